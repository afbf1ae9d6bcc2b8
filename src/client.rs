//! Obtaining and revoking certificates through the ACME protocol.
//!
//! One [`AcmeProtocolClient::fetch_certificate`] call runs a whole issuance: account lookup or
//! registration, a new order, HTTP-01 validation of every pending authorization, finalization
//! and download. Nothing is retried across calls; the scheduler decides when to try again.

use std::{
    future::Future,
    time::{Duration, SystemTime},
};

use eyre::WrapErr as _;
use rustls_pki_types::CertificateDer;

use crate::{
    account::{Account, RevocationReason},
    api,
    cert::{self, IssuedCertificate},
    challenge::{key_authorization, ChallengeTokens},
    config::RenewalConfig,
    dir::Directory,
    error::{Error, Result},
    key::{self, AcmeKey},
};

/// Outcome of one polling attempt.
enum Poll<T> {
    Done(T),
    Pending(String),
    Failed(eyre::Report),
}

/// Polls `attempt` up to `1 + retries` times, sleeping `wait` in between.
async fn poll<T, F, Fut>(what: &str, retries: u32, wait: Duration, mut attempt: F) -> eyre::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = eyre::Result<Poll<T>>>,
{
    let attempts = retries.saturating_add(1);
    let mut last_status = String::new();

    for n in 1..=attempts {
        match attempt().await? {
            Poll::Done(value) => return Ok(value),
            Poll::Failed(err) => return Err(err),
            Poll::Pending(status) => {
                log::debug!("{what} is {status} after attempt {n}/{attempts}");
                last_status = status;
            }
        }

        if n < attempts {
            tokio::time::sleep(wait).await;
        }
    }

    eyre::bail!("{what} still {last_status} after {attempts} attempts")
}

/// Talks to the CA named by the configured directory URL.
#[derive(Debug)]
pub struct AcmeProtocolClient {
    config: RenewalConfig,
    tokens: ChallengeTokens,
}

impl AcmeProtocolClient {
    pub fn new(config: RenewalConfig) -> Self {
        AcmeProtocolClient {
            config,
            tokens: ChallengeTokens::default(),
        }
    }

    /// Key authorization for an HTTP-01 token currently being validated.
    ///
    /// This is what the host's responder serves at `/.well-known/acme-challenge/<token>`. Safe to
    /// call from any thread while a fetch is running.
    pub fn http_authorization(&self, token: &str) -> Option<String> {
        self.tokens.get(token)
    }

    /// Obtains a new certificate for the configured domains.
    pub async fn fetch_certificate(&self) -> Result<IssuedCertificate> {
        let directory_url = &self.config.directory_url;
        let domains = &self.config.domains;

        log::info!("Requesting certificate for {domains:?} from {directory_url}");

        let account_key = key::load_or_create_key(&self.config.account_key_file)?;
        let directory = Directory::fetch(directory_url).await?;
        let account = self.account(&directory, AcmeKey::from_key(account_key)).await?;

        let not_after = self
            .config
            .valid_for()
            .map(|valid_for| cert::rfc3339(SystemTime::now() + valid_for));

        let (order_url, order) = account.new_order(domains, not_after).await?;
        log::debug!("Created order {order_url}");

        for auth_url in &order.authorizations {
            self.authorize(&account, auth_url).await?;
        }

        let domain_key = key::load_or_create_key(&self.config.domain_key_file)?;
        let subject = cert::parse_name(&self.config.subject_dn())?;
        let csr = cert::create_csr(&domain_key, subject, domains)?;

        account.finalize(&order.finalize, &csr).await?;
        log::debug!("Submitted CSR for order {order_url}");

        let order = self.wait_for_order(&account, &order_url).await?;
        let cert_url = order
            .certificate
            .ok_or_else(|| eyre::eyre!("valid order {order_url} has no certificate URL"))?;

        let chain = account.download_chain(&cert_url).await?;

        let issued = IssuedCertificate::new(
            key::signing_key_to_pem(&domain_key)?,
            chain,
            directory_url.clone(),
            account.url().to_owned(),
        );

        let leaf = issued.leaf()?;
        log::info!(
            "Issued certificate {} for {domains:?}, valid until {}",
            cert::serial_hex(&leaf),
            cert::rfc3339(cert::not_after(&leaf)),
        );

        Ok(issued)
    }

    /// Revokes `cert` at the CA behind `directory_url`.
    ///
    /// Uses the account that exists for the configured account key; it never generates a key or
    /// registers an account.
    pub async fn revoke(
        &self,
        cert: &CertificateDer<'_>,
        reason: RevocationReason,
        directory_url: &str,
    ) -> Result<()> {
        let path = &self.config.account_key_file;

        let Some(account_key) = key::load_key(path)? else {
            return Err(Error::Protocol(eyre::eyre!(
                "cannot revoke certificate: no account key at {}",
                path.display()
            )));
        };

        let directory = Directory::fetch(directory_url).await?;
        let Some(account) = directory
            .find_account(AcmeKey::from_key(account_key))
            .await?
        else {
            return Err(Error::Protocol(eyre::eyre!(
                "cannot revoke certificate: no account for key {} at {directory_url}",
                path.display()
            )));
        };

        account.revoke_certificate(cert, reason).await?;

        log::info!("Revoked certificate at {directory_url} ({reason})");

        Ok(())
    }

    async fn account(&self, directory: &Directory, account_key: AcmeKey) -> Result<Account> {
        if let Some(account) = directory.find_account(account_key.clone()).await? {
            log::debug!("Using existing account {}", account.url());
            if !account.api_account().is_status_valid() {
                log::warn!(
                    "Account {} has status {:?}",
                    account.url(),
                    account.api_account().status
                );
            }
            return Ok(account);
        }

        if let Some(tos) = directory.api_directory().terms_of_service() {
            if !self.config.accept_terms_of_service {
                return Err(Error::Protocol(eyre::eyre!(
                    "terms of service at {tos} must be accepted to register an account with {}",
                    directory.url()
                )));
            }
        }

        let account = directory
            .register_account(
                account_key,
                &self.config.account_contacts,
                self.config.accept_terms_of_service,
            )
            .await
            .wrap_err("registering ACME account")?;

        log::info!("Registered account {}", account.url());

        Ok(account)
    }

    async fn authorize(&self, account: &Account, auth_url: &str) -> Result<()> {
        let auth = account.authorization(auth_url).await?;
        let domain = &auth.identifier.value;

        match auth.status {
            api::AuthorizationStatus::Valid => {
                log::debug!("Authorization for {domain} is already valid");
                Ok(())
            }

            api::AuthorizationStatus::Pending => {
                let challenge = auth.http_challenge().ok_or_else(|| {
                    eyre::eyre!("authorization for {domain} offers no http-01 challenge")
                })?;
                self.complete_challenge(account, domain, challenge).await
            }

            status => Err(Error::Protocol(eyre::eyre!(
                "authorization for {domain} is {status:?}{}",
                auth.challenge_error()
                    .map(|err| format!(": {err}"))
                    .unwrap_or_default()
            ))),
        }
    }

    async fn complete_challenge(
        &self,
        account: &Account,
        domain: &str,
        challenge: &api::Challenge,
    ) -> Result<()> {
        if challenge.status == api::ChallengeStatus::Valid {
            return Ok(());
        }

        let key_auth = key_authorization(&challenge.token, account.transport().acme_key())?;
        let _published = self.tokens.publish(&challenge.token, key_auth);

        account.trigger_challenge(&challenge.url).await?;

        log::info!("Waiting for http-01 validation of {domain}");

        poll(
            &format!("challenge for {domain}"),
            self.config.challenge_retries,
            self.config.challenge_retry_wait(),
            move || async move {
                let challenge = account.challenge(&challenge.url).await?;

                Ok(match challenge.status {
                    api::ChallengeStatus::Valid => Poll::Done(()),
                    api::ChallengeStatus::Invalid => Poll::Failed(eyre::eyre!(
                        "challenge for {domain} is invalid: {}",
                        challenge
                            .error
                            .map_or_else(|| "no error given".to_owned(), |err| err.to_string())
                    )),
                    status => Poll::Pending(format!("{status:?}")),
                })
            },
        )
        .await?;

        log::info!("Validated {domain}");

        Ok(())
    }

    async fn wait_for_order(&self, account: &Account, order_url: &str) -> Result<api::Order> {
        let domains = &self.config.domains;

        let order = poll(
            &format!("order {order_url} for {domains:?}"),
            self.config.order_retries,
            self.config.order_retry_wait(),
            move || async move {
                let order = account.order(order_url).await?;

                Ok(match order.status {
                    Some(api::OrderStatus::Valid) => Poll::Done(order),
                    Some(api::OrderStatus::Invalid) => Poll::Failed(eyre::eyre!(
                        "order {order_url} is invalid: {}",
                        order
                            .error
                            .map_or_else(|| "no error given".to_owned(), |err| err.to_string())
                    )),
                    status => Poll::Pending(format!("{status:?}")),
                })
            },
        )
        .await?;

        Ok(order)
    }
}
