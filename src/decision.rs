//! Whether the installed certificate has to be replaced.

use std::{fmt, time::SystemTime};

use rustls_pki_types::CertificateDer;

use crate::{
    cert,
    config::RenewalConfig,
    error::{Error, Result},
    revocation::RevocationChecker,
};

/// Why a renewal is needed. Checked in this order; the first that applies wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    Forced,
    NoCertificate,
    Expiring,
    DomainMismatch,
    SubjectMismatch,
    Revoked,
}

impl fmt::Display for RenewalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RenewalReason::Forced => "renewal was forced",
            RenewalReason::NoCertificate => "no certificate is installed",
            RenewalReason::Expiring => "certificate is about to expire",
            RenewalReason::DomainMismatch => "certificate does not cover all configured domains",
            RenewalReason::SubjectMismatch => "certificate subject differs from the configured one",
            RenewalReason::Revoked => "certificate has been revoked",
        })
    }
}

/// The checks that need no network access.
pub fn renewal_reason(
    chain: Option<&[CertificateDer<'static>]>,
    config: &RenewalConfig,
    forced: bool,
    now: SystemTime,
) -> Result<Option<RenewalReason>> {
    if forced {
        return Ok(Some(RenewalReason::Forced));
    }

    let Some(leaf) = chain.and_then(<[_]>::first) else {
        return Ok(Some(RenewalReason::NoCertificate));
    };

    let leaf = cert::parse(leaf).map_err(Error::Keystore)?;

    let remaining = cert::remaining_validity(&leaf, now);
    if config.auto_renew_on_expiration && remaining <= config.renew_before_expiration() {
        log::info!(
            "Certificate {} expires at {}, renewing {}h ahead",
            cert::serial_hex(&leaf),
            cert::rfc3339(cert::not_after(&leaf)),
            config.renew_before_expiration().as_secs() / 3600,
        );
        return Ok(Some(RenewalReason::Expiring));
    }

    let names = cert::dns_names(&leaf);
    let missing = config
        .domains
        .iter()
        .filter(|domain| !names.contains(&domain.to_ascii_lowercase()))
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        log::info!("Certificate does not cover {missing:?}");
        return Ok(Some(RenewalReason::DomainMismatch));
    }

    let configured = cert::parse_name(&config.subject_dn())
        .map_err(|err| Error::config(format!("subjectDn: {err:#}")))?;
    let existing = &leaf.tbs_certificate.subject;

    // CAs such as Let's Encrypt only keep the CN of the requested subject
    let subject_matches = if cert::rdn_count(existing) == 1 {
        cert::common_name(existing).map(|cn| cn.to_ascii_lowercase())
            == cert::common_name(&configured).map(|cn| cn.to_ascii_lowercase())
    } else {
        cert::name_attributes(existing) == cert::name_attributes(&configured)
    };
    if !subject_matches {
        log::info!(
            "Certificate subject {existing} differs from {}",
            config.subject_dn()
        );
        return Ok(Some(RenewalReason::SubjectMismatch));
    }

    Ok(None)
}

/// Full decision: [`renewal_reason`] and, if that finds nothing, a revocation check.
pub async fn is_renewal_required(
    chain: Option<&[CertificateDer<'static>]>,
    config: &RenewalConfig,
    forced: bool,
    revocation: &RevocationChecker,
) -> Result<Option<RenewalReason>> {
    if let Some(reason) = renewal_reason(chain, config, forced, SystemTime::now())? {
        log::info!("Certificate renewal required: {reason}");
        return Ok(Some(reason));
    }

    if config.revocation_checker.enabled {
        if let Some(chain) = chain {
            if revocation.is_revoked(chain).await? {
                log::warn!("Certificate renewal required: {}", RenewalReason::Revoked);
                return Ok(Some(RenewalReason::Revoked));
            }
        }
    }

    log::debug!("Certificate is still valid, no renewal required");

    Ok(None)
}
