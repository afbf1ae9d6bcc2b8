use std::{fmt, str::FromStr};

use base64::prelude::*;
use rustls_pki_types::CertificateDer;

use crate::{
    api,
    req::req_expect_header,
    trans::Transport,
};

/// An account at one CA, ready to sign requests with its key ID.
///
/// All resource requests after account lookup go through here; each is a single signed POST and
/// none of them retry on their own.
#[derive(Debug, Clone)]
pub(crate) struct Account {
    transport: Transport,
    url: String,
    api_account: api::Account,
    api_directory: api::Directory,
}

impl Account {
    pub(crate) fn new(
        transport: Transport,
        url: String,
        api_account: api::Account,
        api_directory: api::Directory,
    ) -> Self {
        Self {
            transport,
            url,
            api_account,
            api_directory,
        }
    }

    /// The account URL (the `kid` of every signed request).
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn api_account(&self) -> &api::Account {
        &self.api_account
    }

    /// Creates an order. Returns the order URL along with the order.
    ///
    /// Every call creates a new order with the CA, even for the same domains.
    pub async fn new_order(
        &self,
        domains: &[String],
        not_after: Option<String>,
    ) -> eyre::Result<(String, api::Order)> {
        let order = api::Order::request(domains, not_after);

        let res = self
            .transport
            .call_kid(&self.api_directory.new_order, &order)
            .await?;
        let order_url = req_expect_header(&res, "location")?;
        let api_order = res.json::<api::Order>().await?;

        Ok((order_url, api_order))
    }

    /// POST-as-GET of an order.
    pub async fn order(&self, order_url: &str) -> eyre::Result<api::Order> {
        let res = self.transport.call_kid(order_url, &api::EmptyString).await?;
        Ok(res.json().await?)
    }

    /// POST-as-GET of an authorization.
    pub async fn authorization(&self, auth_url: &str) -> eyre::Result<api::Authorization> {
        let res = self.transport.call_kid(auth_url, &api::EmptyString).await?;
        Ok(res.json().await?)
    }

    /// POST-as-GET of a challenge.
    pub async fn challenge(&self, challenge_url: &str) -> eyre::Result<api::Challenge> {
        let res = self
            .transport
            .call_kid(challenge_url, &api::EmptyString)
            .await?;
        Ok(res.json().await?)
    }

    /// Tells the CA the challenge response is in place and can be validated.
    pub async fn trigger_challenge(&self, challenge_url: &str) -> eyre::Result<api::Challenge> {
        let res = self
            .transport
            .call_kid(challenge_url, &api::EmptyObject)
            .await?;
        Ok(res.json().await?)
    }

    /// Submits the CSR (DER) to the order's finalize URL.
    pub async fn finalize(&self, finalize_url: &str, csr_der: &[u8]) -> eyre::Result<()> {
        let finalize = api::Finalize {
            csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
        };

        // an unacceptable CSR comes back as a 4xx problem
        self.transport.call_kid(finalize_url, &finalize).await?;

        Ok(())
    }

    /// Downloads the issued certificate chain, leaf first.
    pub async fn download_chain(&self, cert_url: &str) -> eyre::Result<Vec<CertificateDer<'static>>> {
        let res = self.transport.call_kid(cert_url, &api::EmptyString).await?;
        let pem = res.text().await?;

        let chain = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
        if chain.is_empty() {
            eyre::bail!("CA returned no certificates from {cert_url}");
        }

        Ok(chain)
    }

    /// Revokes `cert` for the reason given.
    pub async fn revoke_certificate(
        &self,
        cert: &CertificateDer<'_>,
        reason: RevocationReason,
    ) -> eyre::Result<()> {
        // convert to base64url of the DER (which is not PEM).
        let certificate = BASE64_URL_SAFE_NO_PAD.encode(cert.as_ref());

        let reason = match reason {
            // > the reason code CRL entry extension SHOULD be absent instead of
            // > using the unspecified (0) reasonCode value
            // see <https://datatracker.ietf.org/doc/html/rfc5280#section-5.3.1>
            RevocationReason::Unspecified => None,

            reason => Some(reason as u8),
        };

        let revocation = api::Revocation {
            certificate,
            reason,
        };

        let url = &self.api_directory.revoke_cert;
        self.transport.call_kid(url, &revocation).await?;

        Ok(())
    }
}

/// Enumeration of reasons for revocation.
///
/// The reason codes are taken from [RFC 5280 §5.3.1].
///
/// [RFC 5280 §5.3.1]: https://tools.ietf.org/html/rfc5280#section-5.3.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationReason {
    Unspecified = 0,
    KeyCompromise = 1,
    CACompromise = 2,
    AffiliationChanged = 3,
    Superseded = 4,
    CessationOfOperation = 5,
    CertificateHold = 6,
    // value 7 is not used
    RemoveFromCRL = 8,
    PrivilegeWithdrawn = 9,
    AACompromise = 10,
}

impl RevocationReason {
    const NAMES: [(&'static str, RevocationReason); 10] = [
        ("unspecified", RevocationReason::Unspecified),
        ("keyCompromise", RevocationReason::KeyCompromise),
        ("cACompromise", RevocationReason::CACompromise),
        ("affiliationChanged", RevocationReason::AffiliationChanged),
        ("superseded", RevocationReason::Superseded),
        ("cessationOfOperation", RevocationReason::CessationOfOperation),
        ("certificateHold", RevocationReason::CertificateHold),
        ("removeFromCRL", RevocationReason::RemoveFromCRL),
        ("privilegeWithdrawn", RevocationReason::PrivilegeWithdrawn),
        ("aACompromise", RevocationReason::AACompromise),
    ];
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = Self::NAMES
            .iter()
            .find(|(_, reason)| reason == self)
            .map_or("unspecified", |(name, _)| name);
        f.write_str(name)
    }
}

/// Parses RFC 5280 reason names case-insensitively, e.g. `keyCompromise` or `SUPERSEDED`.
impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s.trim()))
            .map(|(_, reason)| *reason)
            .ok_or_else(|| format!("unknown revocation reason: {s}"))
    }
}
