//! Keeps one certificate installed and fresh.
//!
//! The manager owns the other components and serializes every operation that may replace the
//! installed certificate behind one asynchronous renewal lock: the scheduled check, on-demand
//! renewal and revocation never overlap, and a second caller waits for the first to finish
//! before it decides anything.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::SystemTime,
};

use rustls_pki_types::CertificateDer;
use tokio::{runtime::Handle, sync::watch};

use crate::{
    account::RevocationReason,
    cert::{self, IssuedCertificate},
    client::AcmeProtocolClient,
    config::RenewalConfig,
    decision::{self, RenewalReason},
    error::{Error, Result},
    history::{CertificateHistoryLog, HistoryEntry},
    keystore::Keystore,
    revocation::RevocationChecker,
    scheduler::{RenewalScheduler, ScheduleSettings, SchedulerState},
};

/// What the host provides besides the configuration.
pub struct Collaborators {
    pub keystore: Arc<dyn Keystore>,

    /// Becomes true once the HTTP-01 responder accepts connections.
    pub responder_ready: watch::Receiver<bool>,

    /// Becomes true when the host shuts down; no further scheduled checks run after that.
    pub shutdown: watch::Receiver<bool>,

    /// Runtime the scheduled checks are spawned on.
    pub runtime: Handle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Renewed {
        serial: String,
        reason: RenewalReason,
    },
    StillValid,
}

pub struct CertificateLifecycleManager {
    config: RenewalConfig,
    client: AcmeProtocolClient,
    revocation: RevocationChecker,
    history: CertificateHistoryLog,
    scheduler: RenewalScheduler,
    keystore: Arc<dyn Keystore>,
    responder_ready: watch::Receiver<bool>,

    renewal_lock: tokio::sync::Mutex<()>,
    last_renewal: parking_lot::Mutex<Option<SystemTime>>,
    directory_changed: AtomicBool,
    active: AtomicBool,
}

impl CertificateLifecycleManager {
    fn new(config: RenewalConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let history = CertificateHistoryLog::new(&config.history_file);
        let last = history.last_entry().unwrap_or_else(|err| {
            log::warn!("Ignoring unreadable certificate history: {err:#}");
            None
        });

        let directory_changed = !config.disable_renew_on_new_history
            && last
                .as_ref()
                .is_some_and(|entry| entry.directory_url != config.directory_url);

        if let (true, Some(entry)) = (directory_changed, &last) {
            log::info!(
                "ACME directory changed from {} to {}, certificate will be replaced",
                entry.directory_url,
                config.directory_url
            );
        }

        Ok(CertificateLifecycleManager {
            client: AcmeProtocolClient::new(config.clone()),
            revocation: RevocationChecker::new(config.revocation_checker.clone()),
            history,
            scheduler: RenewalScheduler::new(collaborators.runtime, collaborators.shutdown),
            keystore: collaborators.keystore,
            responder_ready: collaborators.responder_ready,
            renewal_lock: tokio::sync::Mutex::new(()),
            last_renewal: parking_lot::Mutex::new(last.map(|entry| entry.renewed_at)),
            directory_changed: AtomicBool::new(directory_changed),
            active: AtomicBool::new(false),
            config,
        })
    }

    /// Validates `config`, makes sure a certificate is installed and starts the scheduler.
    ///
    /// Only configuration and keystore access problems fail activation. If the first check fails
    /// the scheduler starts on the error interval.
    pub async fn activate(config: RenewalConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        let manager = Arc::new(Self::new(config, collaborators)?);
        manager.active.store(true, Ordering::SeqCst);

        let exists = manager
            .keystore
            .exists(&manager.config.keystore)
            .map_err(Error::Keystore)?;

        let first_check = if exists {
            let forced = manager.directory_changed.load(Ordering::SeqCst);
            manager.checked(forced).await.map(|_| ())
        } else {
            manager.create_initial_certificate().await
        };

        match first_check {
            Ok(()) => {
                manager.start_scheduler();
            }
            Err(err) => {
                log::warn!("Initial certificate check failed: {err}");
                let weak = Arc::downgrade(&manager);
                manager
                    .scheduler
                    .start_after_failure(manager.schedule_settings(), scheduled(weak));
            }
        }

        log::info!(
            "Certificate lifecycle manager active for {:?}",
            manager.config.domains
        );

        Ok(manager)
    }

    /// Stops scheduled checks. A check already running completes.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.scheduler.stop();
        log::info!("Certificate lifecycle manager deactivated");
    }

    pub fn config(&self) -> &RenewalConfig {
        &self.config
    }

    pub fn history(&self) -> &CertificateHistoryLog {
        &self.history
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Key authorization for an HTTP-01 token; see [`AcmeProtocolClient::http_authorization`].
    pub fn http_authorization(&self, token: &str) -> Option<String> {
        self.client.http_authorization(token)
    }

    /// Checks the installed certificate and replaces it if required (or if `forced`).
    ///
    /// Whatever the outcome, the scheduler is then restarted on the regular interval.
    pub async fn check_and_install(self: &Arc<Self>, forced: bool) -> Result<CheckOutcome> {
        let outcome = self.checked(forced).await;
        self.restart_scheduler();
        outcome
    }

    /// Renews on demand, unless the last renewal was too recent.
    pub async fn renew_certificate(self: &Arc<Self>) -> Result<CheckOutcome> {
        self.check_certificate_renew_allowed()?;
        log::info!("Certificate renewal requested");
        self.check_and_install(true).await
    }

    /// Fails with [`Error::RenewBlocked`] if less than the minimum renewal interval has passed
    /// since the last renewal. Always allowed after the directory changed.
    pub fn check_certificate_renew_allowed(&self) -> Result<()> {
        if self.config.disable_min_renew_window || self.directory_changed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let Some(last) = *self.last_renewal.lock() else {
            return Ok(());
        };

        let elapsed = SystemTime::now()
            .duration_since(last)
            .unwrap_or_default();
        let min = self.config.renew_cert_min();

        if elapsed < min {
            let retry_after = min - elapsed;
            log::info!("Certificate was renewed {elapsed:?} ago, blocking renewal for {retry_after:?}");
            return Err(Error::RenewBlocked { retry_after });
        }

        Ok(())
    }

    /// Revokes the installed certificate and replaces it with a new one.
    pub async fn revoke_certificate(
        self: &Arc<Self>,
        reason: RevocationReason,
    ) -> Result<CheckOutcome> {
        let outcome = self.revoked_and_replaced(reason).await;
        self.restart_scheduler();
        outcome
    }

    async fn revoked_and_replaced(&self, reason: RevocationReason) -> Result<CheckOutcome> {
        let _guard = self.renewal_lock.lock().await;

        let leaf = self
            .installed_chain()?
            .and_then(|chain| chain.into_iter().next())
            .ok_or_else(|| Error::Protocol(eyre::eyre!("no certificate installed to revoke")))?;

        let serial = cert::serial_hex(&cert::parse(&leaf).map_err(Error::Keystore)?);
        let directory_url = self.directory_for_serial(&serial);

        log::info!("Revoking certificate {serial} ({reason})");
        self.client.revoke(&leaf, reason, &directory_url).await?;

        self.check_and_install_locked(true, false).await
    }

    /// Issues the first certificate. If the CA cannot be reached, an empty keystore is created so
    /// the host can still start; the scheduler retries later.
    pub async fn create_initial_certificate(&self) -> Result<()> {
        let _guard = self.renewal_lock.lock().await;

        log::info!("No keystore found, creating initial certificate");
        self.wait_for_responder().await;

        match self.client.fetch_certificate().await {
            Ok(issued) => {
                self.install(&issued)?;
                Ok(())
            }
            Err(err) if err.is_protocol() => {
                log::error!("Could not obtain initial certificate: {err}");
                self.keystore
                    .create_empty(&self.config.keystore)
                    .map_err(Error::Keystore)?;
                log::info!(
                    "Created empty keystore at {}",
                    self.config.keystore.path.display()
                );
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn schedule_settings(&self) -> ScheduleSettings {
        ScheduleSettings {
            regular_interval: self.config.regular_interval(),
            error_interval: self.config.error_interval(),
            auto_renew: self.config.auto_renew_on_expiration,
            revocation_check: self.config.revocation_checker.enabled,
        }
    }

    fn start_scheduler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler
            .start(self.schedule_settings(), scheduled(weak));
    }

    fn restart_scheduler(self: &Arc<Self>) {
        if self.active.load(Ordering::SeqCst) {
            self.start_scheduler();
        }
    }

    /// Lock, check and replace; no scheduler changes.
    async fn checked(&self, forced: bool) -> Result<CheckOutcome> {
        let _guard = self.renewal_lock.lock().await;
        self.check_and_install_locked(forced, true).await
    }

    /// Caller holds the renewal lock.
    async fn check_and_install_locked(
        &self,
        forced: bool,
        revoke_previous: bool,
    ) -> Result<CheckOutcome> {
        self.wait_for_responder().await;

        let chain = self.installed_chain()?;
        let forced = forced || self.directory_changed.load(Ordering::SeqCst);

        let Some(reason) = decision::is_renewal_required(
            chain.as_deref(),
            &self.config,
            forced,
            &self.revocation,
        )
        .await?
        else {
            return Ok(CheckOutcome::StillValid);
        };

        let issued = self.client.fetch_certificate().await?;
        let serial = self.install(&issued)?;

        if revoke_previous && reason != RenewalReason::Revoked {
            if let Some(previous) = chain.as_ref().and_then(|chain| chain.first()) {
                self.revoke_superseded(previous, &serial).await;
            }
        }

        Ok(CheckOutcome::Renewed { serial, reason })
    }

    fn installed_chain(&self) -> Result<Option<Vec<CertificateDer<'static>>>> {
        self.keystore
            .certificate_chain(&self.config.keystore)
            .map_err(Error::Keystore)
    }

    async fn wait_for_responder(&self) {
        let timeout = self.config.start_ready_timeout();
        let mut ready = self.responder_ready.clone();
        let wait = async move { ready.wait_for(|ready| *ready).await.map(|_| ()) };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => log::warn!("HTTP-01 responder readiness is unknown, continuing"),
            Err(_) => log::warn!("HTTP-01 responder not ready after {timeout:?}, continuing"),
        }
    }

    /// Installs `issued` and records it. Returns its serial.
    fn install(&self, issued: &IssuedCertificate) -> Result<String> {
        let leaf = issued.leaf()?;
        let serial = cert::serial_hex(&leaf);
        let expires_at = cert::not_after(&leaf);

        self.keystore
            .install(&self.config.keystore, issued.private_key(), issued.chain())
            .map_err(Error::Keystore)?;

        let now = SystemTime::now();
        *self.last_renewal.lock() = Some(now);
        self.directory_changed.store(false, Ordering::SeqCst);

        let entry = HistoryEntry {
            renewed_at: now,
            serial: serial.clone(),
            directory_url: issued.directory_url().to_owned(),
            account_url: issued.account_url().to_owned(),
            expires_at: Some(expires_at),
        };
        if let Err(err) = self.history.append(entry) {
            log::warn!("Could not record certificate {serial} in history: {err:#}");
        }

        log::info!(
            "Installed certificate {serial} from {} in {}, expires {}",
            issued.directory_url(),
            self.config.keystore.path.display(),
            cert::rfc3339(expires_at),
        );

        Ok(serial)
    }

    fn directory_for_serial(&self, serial: &str) -> String {
        match self.history.directory_for_serial(serial) {
            Ok(Some(url)) => url,
            Ok(None) => self.config.directory_url.clone(),
            Err(err) => {
                log::warn!("Could not read certificate history: {err:#}");
                self.config.directory_url.clone()
            }
        }
    }

    /// Best effort; failures are logged.
    async fn revoke_superseded(&self, previous: &CertificateDer<'static>, new_serial: &str) {
        let serial = match cert::parse(previous) {
            Ok(cert) => cert::serial_hex(&cert),
            Err(err) => {
                log::warn!("Not revoking unreadable superseded certificate: {err:#}");
                return;
            }
        };

        if serial == new_serial {
            return;
        }

        let directory_url = self.directory_for_serial(&serial);

        match self
            .client
            .revoke(previous, RevocationReason::Superseded, &directory_url)
            .await
        {
            Ok(()) => log::info!("Revoked superseded certificate {serial}"),
            Err(err) => log::warn!("Could not revoke superseded certificate {serial}: {err}"),
        }
    }
}

impl std::fmt::Debug for CertificateLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateLifecycleManager")
            .field("domains", &self.config.domains)
            .field("directory_url", &self.config.directory_url)
            .field("scheduler", &self.scheduler.state())
            .finish_non_exhaustive()
    }
}

type CheckFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// The scheduled check. Holds the manager weakly so a dropped manager ends the schedule.
fn scheduled(
    manager: Weak<CertificateLifecycleManager>,
) -> impl Fn() -> CheckFuture + Send + Sync + 'static {
    move || {
        let manager = manager.clone();
        Box::pin(async move {
            match manager.upgrade() {
                Some(manager) => manager.checked(false).await.map(|_| ()),
                None => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use super::*;
    use crate::test::{test_config, with_mock_ca, MemoryKeystore, TestServer};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Harness {
        ca: TestServer,
        keystore: Arc<MemoryKeystore>,
        config: RenewalConfig,
        _dir: tempfile::TempDir,
        _ready: watch::Sender<bool>,
        _shutdown: watch::Sender<bool>,
        collaborators: Option<Collaborators>,
    }

    impl Harness {
        fn new() -> Self {
            let ca = with_mock_ca();
            let dir = tempfile::tempdir().unwrap();
            let config = test_config(&ca.dir_url, dir.path());
            let keystore = Arc::new(MemoryKeystore::default());
            let (ready_tx, ready_rx) = watch::channel(true);
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let collaborators = Collaborators {
                keystore: keystore.clone(),
                responder_ready: ready_rx,
                shutdown: shutdown_rx,
                runtime: Handle::current(),
            };

            Harness {
                ca,
                keystore,
                config,
                _dir: dir,
                _ready: ready_tx,
                _shutdown: shutdown_tx,
                collaborators: Some(collaborators),
            }
        }

        fn collaborators(&mut self) -> Collaborators {
            self.collaborators.take().unwrap()
        }

        async fn activate(&mut self) -> Arc<CertificateLifecycleManager> {
            let collaborators = self.collaborators();
            CertificateLifecycleManager::activate(self.config.clone(), collaborators)
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn activation_creates_initial_certificate() {
        let mut h = Harness::new();
        let manager = h.activate().await;

        assert_eq!(h.keystore.installed_serial().as_deref(), Some("ab12"));
        assert_eq!(h.ca.state.new_orders.load(Ordering::SeqCst), 1);
        assert_eq!(manager.scheduler_state(), SchedulerState::Regular);

        let entry = manager.history().last_entry().unwrap().unwrap();
        assert_eq!(entry.serial, "ab12");
        assert_eq!(entry.directory_url, h.ca.dir_url);
    }

    #[tokio::test]
    async fn failed_initial_certificate_creates_empty_keystore() {
        let mut h = Harness::new();
        h.config.accept_terms_of_service = false;

        let manager = h.activate().await;

        assert!(h.keystore.exists.load(Ordering::SeqCst));
        assert_eq!(h.keystore.installed_serial(), None);
        assert_eq!(manager.scheduler_state(), SchedulerState::Error);
    }

    #[tokio::test]
    async fn expiring_certificate_is_replaced_and_revoked() {
        let mut h = Harness::new();
        let old = h
            .ca
            .state
            .ca
            .leaf(&["acme.example.com"])
            .serial(&[0x01])
            .not_after(SystemTime::now() + 5 * DAY)
            .issue();
        h.keystore.preinstall(&old);

        let manager = h.activate().await;

        assert_eq!(h.keystore.installed_serial().as_deref(), Some("ab12"));
        assert_eq!(
            manager.history().last_entry().unwrap().unwrap().serial,
            "ab12"
        );
        assert_eq!(h.ca.state.revocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn valid_certificate_is_kept() {
        let mut h = Harness::new();
        let current = h
            .ca
            .state
            .ca
            .leaf(&["acme.example.com"])
            .serial(&[0x01])
            .issue();
        h.keystore.preinstall(&current);

        let manager = h.activate().await;

        assert_eq!(h.keystore.installed_serial().as_deref(), Some("1"));
        assert_eq!(h.ca.state.new_orders.load(Ordering::SeqCst), 0);
        assert_eq!(manager.check_and_install(false).await.unwrap(), CheckOutcome::StillValid);
    }

    #[tokio::test]
    async fn concurrent_checks_renew_once() {
        let mut h = Harness::new();
        h.keystore.exists.store(true, Ordering::SeqCst);

        let manager = Arc::new(
            CertificateLifecycleManager::new(h.config.clone(), h.collaborators()).unwrap(),
        );

        let (a, b) = tokio::join!(
            manager.check_and_install(false),
            manager.check_and_install(false),
        );

        let mut outcomes = [a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|outcome| matches!(outcome, CheckOutcome::StillValid));
        assert_eq!(
            outcomes[0],
            CheckOutcome::Renewed {
                serial: "ab12".to_owned(),
                reason: RenewalReason::NoCertificate,
            }
        );
        assert_eq!(outcomes[1], CheckOutcome::StillValid);
        assert_eq!(h.ca.state.new_orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renewal_is_blocked_within_min_window() {
        let mut h = Harness::new();
        h.config.renew_cert_min_ms = 60_000;
        let manager =
            CertificateLifecycleManager::new(h.config.clone(), h.collaborators()).unwrap();

        assert!(manager.check_certificate_renew_allowed().is_ok());

        *manager.last_renewal.lock() = Some(SystemTime::now() - Duration::from_secs(10));

        match manager.check_certificate_renew_allowed() {
            Err(Error::RenewBlocked { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(50));
                assert!(retry_after > Duration::from_secs(49));
            }
            res => panic!("expected renewal to be blocked, got {res:?}"),
        }

        *manager.last_renewal.lock() = Some(SystemTime::now() - Duration::from_secs(61));
        assert!(manager.check_certificate_renew_allowed().is_ok());
    }

    #[tokio::test]
    async fn renew_right_after_activation_is_blocked() {
        let mut h = Harness::new();
        let manager = h.activate().await;

        let err = manager.renew_certificate().await.unwrap_err();
        assert!(matches!(err, Error::RenewBlocked { .. }), "{err}");
        assert_eq!(h.ca.state.new_orders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn new_directory_forces_renewal() {
        let mut h = Harness::new();
        let current = h
            .ca
            .state
            .ca
            .leaf(&["acme.example.com"])
            .serial(&[0x01])
            .issue();
        h.keystore.preinstall(&current);

        CertificateHistoryLog::new(&h.config.history_file)
            .append(HistoryEntry {
                renewed_at: SystemTime::now() - Duration::from_secs(5),
                serial: "1".to_owned(),
                directory_url: "http://127.0.0.1:1/directory".to_owned(),
                account_url: "http://127.0.0.1:1/acct/1".to_owned(),
                expires_at: Some(SystemTime::now() + 60 * DAY),
            })
            .unwrap();

        let manager = h.activate().await;

        assert_eq!(h.keystore.installed_serial().as_deref(), Some("ab12"));
        assert_eq!(
            manager.history().last_directory().unwrap().as_deref(),
            Some(h.ca.dir_url.as_str())
        );
        // the old CA is gone, so revoking the superseded certificate failed quietly
        assert_eq!(h.ca.state.revocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn revoke_replaces_certificate() {
        let mut h = Harness::new();
        h.config.disable_min_renew_window = true;
        let manager = h.activate().await;

        let outcome = manager
            .revoke_certificate(RevocationReason::KeyCompromise)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            CheckOutcome::Renewed {
                reason: RenewalReason::Forced,
                ..
            }
        ));
        assert_eq!(h.ca.state.revocations.load(Ordering::SeqCst), 1);
        assert_eq!(h.ca.state.new_orders.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deactivate_stops_scheduler() {
        let mut h = Harness::new();
        let manager = h.activate().await;
        assert_eq!(manager.scheduler_state(), SchedulerState::Regular);

        manager.deactivate();
        manager.deactivate();
        assert_eq!(manager.scheduler_state(), SchedulerState::Stopped);

        // on-demand checks keep working but leave the scheduler alone
        manager.check_and_install(false).await.unwrap();
        assert_eq!(manager.scheduler_state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn failed_on_demand_check_still_restarts_scheduler() {
        let mut h = Harness::new();
        h.config.accept_terms_of_service = false;

        let manager = h.activate().await;
        assert_eq!(manager.scheduler_state(), SchedulerState::Error);

        let err = manager.check_and_install(false).await.unwrap_err();
        assert!(err.is_protocol(), "{err}");
        assert_eq!(manager.scheduler_state(), SchedulerState::Regular);
    }
}
