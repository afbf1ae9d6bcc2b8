//! Renewal configuration.
//!
//! The host's configuration system produces a [`RenewalConfig`] (it deserializes from camelCase
//! JSON or any other serde format) and hands it to
//! [`CertificateLifecycleManager::activate`](crate::CertificateLifecycleManager::activate). A
//! configuration never changes in place: a new one means a new manager.

use std::{fmt, path::PathBuf, time::Duration};

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::{cert, error::Error};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalConfig {
    /// ACME directory URL of the CA.
    pub directory_url: String,

    /// Domains the certificate has to cover. The first is the default common name.
    pub domains: Vec<String>,

    /// Subject distinguished name, e.g. `CN=example.com,O=Example,C=US`.
    #[serde(default)]
    pub subject_dn: Option<String>,

    /// Requested validity; sent as the order's `notAfter`.
    #[serde(default)]
    pub valid_for_ms: Option<u64>,

    #[serde(default)]
    pub account_contacts: Vec<String>,

    #[serde(default)]
    pub accept_terms_of_service: bool,

    pub account_key_file: PathBuf,
    pub domain_key_file: PathBuf,

    #[serde(default = "defaults::challenge_retries")]
    pub challenge_retries: u32,
    #[serde(default = "defaults::challenge_retry_wait_ms")]
    pub challenge_retry_wait_ms: u64,

    #[serde(default = "defaults::order_retries")]
    pub order_retries: u32,
    #[serde(default = "defaults::order_retry_wait_ms")]
    pub order_retry_wait_ms: u64,

    #[serde(default = "defaults::renew_before_expiration_ms")]
    pub renew_before_expiration_ms: u64,

    #[serde(default = "defaults::enabled")]
    pub auto_renew_on_expiration: bool,

    /// Interval of the regular certificate check. Zero disables the checker.
    #[serde(default = "defaults::cert_checker_schedule_ms")]
    pub cert_checker_schedule_ms: u64,

    /// Interval used after a failed check until one succeeds again.
    #[serde(default = "defaults::cert_checker_error_schedule_ms")]
    pub cert_checker_error_schedule_ms: u64,

    /// Minimum time between two renewals requested on demand.
    #[serde(default = "defaults::renew_cert_min_ms")]
    pub renew_cert_min_ms: u64,

    #[serde(default)]
    pub disable_min_renew_window: bool,

    /// Do not force a renewal when the directory URL differs from the last issuance.
    #[serde(default)]
    pub disable_renew_on_new_history: bool,

    /// How long to wait for the HTTP-01 responder to come up before each check.
    #[serde(default = "defaults::start_ready_timeout_ms")]
    pub start_ready_timeout_ms: u64,

    pub history_file: PathBuf,

    pub keystore: KeystoreLocation,

    #[serde(default)]
    pub revocation_checker: RevocationConfig,
}

mod defaults {
    use super::DAY_MS;

    pub(super) fn enabled() -> bool {
        true
    }
    pub(super) fn challenge_retries() -> u32 {
        10
    }
    pub(super) fn challenge_retry_wait_ms() -> u64 {
        5_000
    }
    pub(super) fn order_retries() -> u32 {
        10
    }
    pub(super) fn order_retry_wait_ms() -> u64 {
        3_000
    }
    pub(super) fn renew_before_expiration_ms() -> u64 {
        7 * DAY_MS
    }
    pub(super) fn cert_checker_schedule_ms() -> u64 {
        DAY_MS
    }
    pub(super) fn cert_checker_error_schedule_ms() -> u64 {
        60 * 60 * 1000
    }
    pub(super) fn renew_cert_min_ms() -> u64 {
        15_000
    }
    pub(super) fn start_ready_timeout_ms() -> u64 {
        2 * 60 * 1000
    }
}

/// Where the keystore collaborator keeps the installed certificate.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystoreLocation {
    pub path: PathBuf,
    pub password: Zeroizing<String>,
    #[serde(default = "KeystoreLocation::default_alias")]
    pub alias: String,
}

impl KeystoreLocation {
    fn default_alias() -> String {
        "default".to_owned()
    }
}

impl fmt::Debug for KeystoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreLocation")
            .field("path", &self.path)
            .field("password", &"****")
            .field("alias", &self.alias)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationConfig {
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,

    /// Treat unreachable or undecided responders as "not revoked".
    #[serde(default = "defaults::enabled")]
    pub soft_fail: bool,

    /// Consult CRLs before OCSP.
    #[serde(default)]
    pub prefer_crls: bool,

    /// Only consult the preferred source.
    #[serde(default)]
    pub disable_fallback: bool,

    /// Used instead of the leaf's AIA OCSP URL.
    #[serde(default)]
    pub ocsp_responder_url: Option<String>,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        RevocationConfig {
            enabled: true,
            soft_fail: true,
            prefer_crls: false,
            disable_fallback: false,
            ocsp_responder_url: None,
        }
    }
}

impl RenewalConfig {
    /// Checks the configuration for values that can never work.
    pub fn validate(&self) -> Result<(), Error> {
        match reqwest::Url::parse(&self.directory_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => {
                return Err(Error::config(format!(
                    "directoryUrl {:?} is not an http(s) URL",
                    self.directory_url
                )))
            }
        }

        if self.domains.is_empty() {
            return Err(Error::config("at least one domain is required"));
        }

        for domain in &self.domains {
            if domain.trim().is_empty() {
                return Err(Error::config("domains must not be blank"));
            }
            if domain.contains('*') {
                return Err(Error::config(format!(
                    "wildcard domain {domain} cannot be validated with http-01"
                )));
            }
        }

        let subject = cert::parse_name(&self.subject_dn())
            .map_err(|err| Error::config(format!("subjectDn: {err:#}")))?;

        match cert::common_name(&subject) {
            Some(cn) if self.domains.iter().any(|d| d.eq_ignore_ascii_case(&cn)) => {}
            Some(cn) => {
                return Err(Error::config(format!(
                    "subjectDn common name {cn} is not one of the configured domains"
                )))
            }
            None => return Err(Error::config("subjectDn has no common name")),
        }

        for contact in &self.account_contacts {
            if !contact.starts_with("mailto:") {
                return Err(Error::config(format!(
                    "account contact {contact} must be a mailto: URI"
                )));
            }
        }

        if self.challenge_retry_wait_ms == 0 || self.order_retry_wait_ms == 0 {
            return Err(Error::config("retry waits must be greater than zero"));
        }

        if let Some(valid_for) = self.valid_for() {
            if valid_for <= self.renew_before_expiration() {
                return Err(Error::config(format!(
                    "renewBeforeExpirationMs ({}) must be shorter than validForMs ({})",
                    self.renew_before_expiration_ms,
                    valid_for.as_millis()
                )));
            }
        }

        if self.cert_checker_schedule_ms > 0 && self.cert_checker_error_schedule_ms == 0 {
            return Err(Error::config(
                "certCheckerErrorScheduleMs must be set when the checker is enabled",
            ));
        }

        Ok(())
    }

    /// The configured subject, or `CN=<first domain>`.
    pub fn subject_dn(&self) -> String {
        match &self.subject_dn {
            Some(dn) => dn.clone(),
            None => format!("CN={}", self.domains.first().map_or("", String::as_str)),
        }
    }

    pub fn valid_for(&self) -> Option<Duration> {
        self.valid_for_ms.map(Duration::from_millis)
    }

    pub fn challenge_retry_wait(&self) -> Duration {
        Duration::from_millis(self.challenge_retry_wait_ms)
    }

    pub fn order_retry_wait(&self) -> Duration {
        Duration::from_millis(self.order_retry_wait_ms)
    }

    pub fn renew_before_expiration(&self) -> Duration {
        Duration::from_millis(self.renew_before_expiration_ms)
    }

    pub fn renew_cert_min(&self) -> Duration {
        Duration::from_millis(self.renew_cert_min_ms)
    }

    pub fn start_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.start_ready_timeout_ms)
    }

    pub fn regular_interval(&self) -> Duration {
        Duration::from_millis(self.cert_checker_schedule_ms)
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.cert_checker_error_schedule_ms)
    }
}
