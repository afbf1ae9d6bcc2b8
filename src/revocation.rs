//! Revocation status of the installed certificate.
//!
//! Two sources are consulted: the OCSP responder named in the leaf's Authority Information Access
//! extension (or a configured override) and the CRLs named in its CRL Distribution Points. OCSP
//! goes first unless CRLs are preferred; the other source is only asked when the first one could
//! not give an answer, and not at all when fallback is disabled.
//!
//! Whatever the sources say, the leaf is also validated against its issuer with `rustls-webpki`,
//! which is where CRL entries are matched.

use std::fmt::Write as _;

use der::{
    asn1::{Any, OctetString},
    oid::{AssociatedOid as _, ObjectIdentifier},
    Decode as _, Encode as _,
};
use rustls_pki_types::{CertificateDer, UnixTime};
use sha1::{Digest as _, Sha1};
use webpki::{
    BorrowedCertRevocationList, CertRevocationList, EndEntityCert, RevocationCheckDepth,
    RevocationOptionsBuilder, UnknownStatusPolicy,
};
use x509_cert::{
    ext::pkix::{
        name::{DistributionPointName, GeneralName},
        AuthorityInfoAccessSyntax, CrlDistributionPoints,
    },
    spki::AlgorithmIdentifierOwned,
    Certificate,
};
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus,
    Request, TbsRequest, Version,
};

use crate::{
    cert,
    config::RevocationConfig,
    error::{Error, Result},
    req::http_client,
};

const ID_AD_OCSP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1");
const ID_PKIX_OCSP_BASIC: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.48.1.1");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Ocsp,
    Crl,
}

/// Answer of one OCSP round trip.
#[derive(Debug)]
enum OcspStatus {
    Good,
    Revoked,
    Undetermined(String),
}

#[derive(Debug, Clone)]
pub struct RevocationChecker {
    config: RevocationConfig,
}

impl RevocationChecker {
    pub fn new(config: RevocationConfig) -> Self {
        RevocationChecker { config }
    }

    fn sources(&self) -> Vec<Source> {
        let mut sources = if self.config.prefer_crls {
            vec![Source::Crl, Source::Ocsp]
        } else {
            vec![Source::Ocsp, Source::Crl]
        };

        if self.config.disable_fallback {
            sources.truncate(1);
        }

        sources
    }

    /// Returns true if the leaf of `chain` (leaf first) is revoked.
    ///
    /// A chain without an issuer, a self-issued leaf and a leaf that names no revocation source
    /// are all reported as not revoked.
    pub async fn is_revoked(&self, chain: &[CertificateDer<'static>]) -> Result<bool> {
        let [leaf_der, issuer_der, ..] = chain else {
            log::debug!("Certificate chain has no issuer, skipping revocation check");
            return Ok(false);
        };

        let leaf = cert::parse(leaf_der).map_err(Error::Check)?;
        let issuer = cert::parse(issuer_der).map_err(Error::Check)?;

        if leaf.tbs_certificate.issuer == leaf.tbs_certificate.subject {
            log::debug!("Certificate is self-issued, skipping revocation check");
            return Ok(false);
        }

        let ocsp_url = self
            .config
            .ocsp_responder_url
            .clone()
            .or_else(|| ocsp_url(&leaf));
        let crl_urls = crl_urls(&leaf);

        if ocsp_url.is_none() && crl_urls.is_empty() {
            log::debug!("Certificate names no OCSP responder or CRL, skipping revocation check");
            return Ok(false);
        }

        let mut revoked = None;
        let mut soft_failures = Vec::new();
        let mut crls = Vec::new();

        for source in self.sources() {
            if revoked.is_some() {
                break;
            }

            match source {
                Source::Ocsp => {
                    let Some(url) = &ocsp_url else { continue };

                    match self.ocsp_status(url, &leaf, &issuer, issuer_der).await? {
                        OcspStatus::Good => revoked = Some(false),
                        OcspStatus::Revoked => revoked = Some(true),
                        OcspStatus::Undetermined(reason) => {
                            soft_failures.push(format!("OCSP {url}: {reason}"))
                        }
                    }
                }

                Source::Crl => {
                    for url in &crl_urls {
                        match fetch_crl(url).await {
                            Ok(crl) => crls.push(crl),
                            Err(err) => soft_failures.push(format!("CRL {url}: {err:#}")),
                        }
                    }

                    if !crls.is_empty() {
                        revoked = Some(false);
                    }
                }
            }
        }

        if revoked == Some(true) {
            log::warn!(
                "OCSP responder reports certificate {} as revoked",
                cert::serial_hex(&leaf)
            );
            return Ok(true);
        }

        match validate_path(leaf_der, issuer_der, &crls) {
            Ok(()) => {}
            Err(webpki::Error::CertRevoked) => {
                log::warn!("CRL lists certificate {} as revoked", cert::serial_hex(&leaf));
                return Ok(true);
            }
            Err(err) => {
                return Err(Error::Check(eyre::eyre!(
                    "certificate path validation failed: {err:?}"
                )))
            }
        }

        if revoked.is_some() {
            return Ok(false);
        }

        let mut summary = String::new();
        for failure in &soft_failures {
            let _ = write!(summary, "\n  {failure}");
        }

        if self.config.soft_fail {
            log::warn!("Revocation status could not be determined, assuming not revoked:{summary}");
            Ok(false)
        } else {
            Err(Error::Check(eyre::eyre!(
                "revocation status could not be determined:{summary}"
            )))
        }
    }

    /// Errors are reserved for requests that cannot be built; every bad answer is undetermined.
    async fn ocsp_status(
        &self,
        url: &str,
        leaf: &Certificate,
        issuer: &Certificate,
        issuer_der: &CertificateDer<'_>,
    ) -> Result<OcspStatus> {
        let request = ocsp_request(leaf, issuer).map_err(Error::Check)?;

        let body = match post_ocsp(url, request).await {
            Ok(body) => body,
            Err(err) => return Ok(OcspStatus::Undetermined(format!("{err:#}"))),
        };

        let response = match OcspResponse::from_der(&body) {
            Ok(response) => response,
            Err(err) => return Ok(OcspStatus::Undetermined(format!("malformed response: {err}"))),
        };

        if response.response_status != OcspResponseStatus::Successful {
            return Ok(OcspStatus::Undetermined(format!(
                "responder answered {:?}",
                response.response_status
            )));
        }

        let Some(bytes) = response
            .response_bytes
            .filter(|bytes| bytes.response_type == ID_PKIX_OCSP_BASIC)
        else {
            return Ok(OcspStatus::Undetermined(
                "no basic OCSP response".to_owned(),
            ));
        };

        let basic = match BasicOcspResponse::from_der(bytes.response.as_bytes()) {
            Ok(basic) => basic,
            Err(err) => return Ok(OcspStatus::Undetermined(format!("malformed response: {err}"))),
        };

        if let Err(err) = verify_ocsp_signature(&basic, issuer_der) {
            return Ok(OcspStatus::Undetermined(format!("untrusted response: {err:#}")));
        }

        let serial = &leaf.tbs_certificate.serial_number;
        let Some(single) = basic
            .tbs_response_data
            .responses
            .iter()
            .find(|single| &single.cert_id.serial_number == serial)
        else {
            return Ok(OcspStatus::Undetermined(
                "response does not cover the certificate".to_owned(),
            ));
        };

        Ok(match single.cert_status {
            CertStatus::Good(_) => OcspStatus::Good,
            CertStatus::Revoked(_) => OcspStatus::Revoked,
            CertStatus::Unknown(_) => {
                OcspStatus::Undetermined("responder does not know the certificate".to_owned())
            }
        })
    }
}

/// OCSP request for `leaf`, identified by SHA-1 hashes of the issuer's name and key.
fn ocsp_request(leaf: &Certificate, issuer: &Certificate) -> eyre::Result<Vec<u8>> {
    let issuer_name = issuer.tbs_certificate.subject.to_der()?;
    let issuer_key = issuer
        .tbs_certificate
        .subject_public_key_info
        .subject_public_key
        .raw_bytes();

    let cert_id = CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: Sha1::OID,
            parameters: Some(Any::null()),
        },
        issuer_name_hash: OctetString::new(Sha1::digest(issuer_name).to_vec())?,
        issuer_key_hash: OctetString::new(Sha1::digest(issuer_key).to_vec())?,
        serial_number: leaf.tbs_certificate.serial_number.clone(),
    };

    let request = OcspRequest {
        tbs_request: TbsRequest {
            version: Version::V1,
            requestor_name: None,
            request_list: vec![Request {
                req_cert: cert_id,
                single_request_extensions: None,
            }],
            request_extensions: None,
        },
        optional_signature: None,
    };

    Ok(request.to_der()?)
}

async fn post_ocsp(url: &str, request: Vec<u8>) -> eyre::Result<Vec<u8>> {
    log::debug!("Asking OCSP responder {url}");

    let res = http_client()
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/ocsp-request")
        .body(request)
        .send()
        .await?
        .error_for_status()?;

    Ok(res.bytes().await?.to_vec())
}

/// The response must be signed by the issuer, or by a responder certificate the issuer signed.
fn verify_ocsp_signature(
    basic: &BasicOcspResponse,
    issuer_der: &CertificateDer<'_>,
) -> eyre::Result<()> {
    let issuer = EndEntityCert::try_from(issuer_der)
        .map_err(|err| eyre::eyre!("parsing issuer for OCSP verification: {err:?}"))?;

    let tbs = basic.tbs_response_data.to_der()?;
    let signature = basic
        .signature
        .as_bytes()
        .ok_or_else(|| eyre::eyre!("OCSP signature has unused bits"))?;

    if verify_signature(&issuer, &tbs, signature) {
        return Ok(());
    }

    for responder in basic.certs.iter().flatten() {
        let responder_tbs = responder.tbs_certificate.to_der()?;
        let Some(responder_sig) = responder.signature.as_bytes() else {
            continue;
        };

        if !verify_signature(&issuer, &responder_tbs, responder_sig) {
            continue;
        }

        let responder_der = CertificateDer::from(responder.to_der()?);
        let responder = EndEntityCert::try_from(&responder_der)
            .map_err(|err| eyre::eyre!("parsing OCSP responder certificate: {err:?}"))?;

        if verify_signature(&responder, &tbs, signature) {
            return Ok(());
        }
    }

    eyre::bail!("OCSP response signature does not verify against the issuer")
}

fn verify_signature(signer: &EndEntityCert<'_>, message: &[u8], signature: &[u8]) -> bool {
    webpki::ALL_VERIFICATION_ALGS
        .iter()
        .any(|alg| signer.verify_signature(*alg, message, signature).is_ok())
}

async fn fetch_crl(url: &str) -> eyre::Result<CertRevocationList<'static>> {
    log::debug!("Fetching CRL {url}");

    let res = http_client().get(url).send().await?.error_for_status()?;
    let body = res.bytes().await?;

    let crl = BorrowedCertRevocationList::from_der(&body)
        .and_then(|crl| crl.to_owned())
        .map_err(|err| eyre::eyre!("parsing CRL: {err:?}"))?;

    Ok(CertRevocationList::from(crl))
}

/// Validates `leaf` against `issuer` as trust anchor, consulting `crls` for the leaf only.
fn validate_path(
    leaf: &CertificateDer<'_>,
    issuer: &CertificateDer<'_>,
    crls: &[CertRevocationList<'_>],
) -> std::result::Result<(), webpki::Error> {
    let anchors = [webpki::anchor_from_trusted_cert(issuer)?];
    let leaf = EndEntityCert::try_from(leaf)?;

    let crl_refs = crls.iter().collect::<Vec<_>>();
    let revocation = RevocationOptionsBuilder::new(&crl_refs).ok().map(|builder| {
        builder
            .with_depth(RevocationCheckDepth::EndEntity)
            .with_status_policy(UnknownStatusPolicy::Allow)
            .build()
    });

    leaf.verify_for_usage(
        webpki::ALL_VERIFICATION_ALGS,
        &anchors,
        &[],
        UnixTime::now(),
        webpki::KeyUsage::server_auth(),
        revocation,
        None,
    )?;

    Ok(())
}

fn ocsp_url(leaf: &Certificate) -> Option<String> {
    let ext = leaf
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == AuthorityInfoAccessSyntax::OID)?;

    let aia = AuthorityInfoAccessSyntax::from_der(ext.extn_value.as_bytes()).ok()?;

    aia.0
        .into_iter()
        .filter(|desc| desc.access_method == ID_AD_OCSP)
        .find_map(|desc| match desc.access_location {
            GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
            _ => None,
        })
}

fn crl_urls(leaf: &Certificate) -> Vec<String> {
    let Some(ext) = leaf
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == CrlDistributionPoints::OID)
    else {
        return Vec::new();
    };

    let Ok(points) = CrlDistributionPoints::from_der(ext.extn_value.as_bytes()) else {
        log::warn!("Ignoring malformed CRL distribution points extension");
        return Vec::new();
    };

    points
        .0
        .into_iter()
        .filter_map(|point| match point.distribution_point {
            Some(DistributionPointName::FullName(names)) => Some(names),
            _ => None,
        })
        .flatten()
        .filter_map(|name| match name {
            GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
            _ => None,
        })
        .collect()
}
