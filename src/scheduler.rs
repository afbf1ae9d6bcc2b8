//! Periodic certificate checks.
//!
//! The scheduler runs one check at a time on a fixed delay: the regular interval while checks
//! succeed and the (usually shorter) error interval after one failed. Stopping it cancels the
//! pending delay but never a check that is already running.

use std::{future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Regular,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub regular_interval: Duration,
    pub error_interval: Duration,
    pub auto_renew: bool,
    pub revocation_check: bool,
}

impl ScheduleSettings {
    /// Nothing to do if neither expiry nor revocation is watched, or the checker is switched off.
    pub fn is_enabled(&self) -> bool {
        (self.auto_renew || self.revocation_check) && !self.regular_interval.is_zero()
    }
}

#[derive(Debug)]
struct Inner {
    state: SchedulerState,
    generation: u64,
    cancel: Option<watch::Sender<bool>>,
}

#[derive(Debug, Clone)]
pub struct RenewalScheduler {
    inner: Arc<Mutex<Inner>>,
    runtime: Handle,
    shutdown: watch::Receiver<bool>,
}

impl RenewalScheduler {
    /// `shutdown` flipping to true stops all future checks.
    pub fn new(runtime: Handle, shutdown: watch::Receiver<bool>) -> Self {
        RenewalScheduler {
            inner: Arc::new(Mutex::new(Inner {
                state: SchedulerState::Stopped,
                generation: 0,
                cancel: None,
            })),
            runtime,
            shutdown,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.inner.lock().state
    }

    /// (Re)starts regular checks. Returns false, leaving the scheduler stopped, if `settings`
    /// disable checking.
    pub fn start<F, Fut>(&self, settings: ScheduleSettings, check: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(settings, SchedulerState::Regular, check)
    }

    /// Starts in the error cadence, for when the check at activation already failed.
    pub fn start_after_failure<F, Fut>(&self, settings: ScheduleSettings, check: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn(settings, SchedulerState::Error, check)
    }

    /// Cancels the pending delay. Idempotent; a running check finishes undisturbed.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();

        if inner.state != SchedulerState::Stopped {
            log::debug!("Stopping certificate checker");
        }

        inner.generation += 1;
        inner.state = SchedulerState::Stopped;

        if let Some(cancel) = inner.cancel.take() {
            let _ = cancel.send(true);
        }
    }

    fn spawn<F, Fut>(&self, settings: ScheduleSettings, initial: SchedulerState, check: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stop();

        if !settings.is_enabled() {
            log::info!("Certificate checker is disabled");
            return false;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut inner = self.inner.lock();
        inner.state = initial;
        let generation = inner.generation;

        self.runtime.spawn(run(
            Arc::clone(&self.inner),
            generation,
            settings,
            cancel_rx,
            self.shutdown.clone(),
            check,
        ));

        inner.cancel = Some(cancel_tx);

        log::debug!(
            "Certificate checker started in {initial:?} state, next check in {:?}",
            delay_for(initial, &settings)
        );

        true
    }
}

fn delay_for(state: SchedulerState, settings: &ScheduleSettings) -> Duration {
    match state {
        SchedulerState::Error => settings.error_interval,
        _ => settings.regular_interval,
    }
}

async fn run<F, Fut>(
    inner: Arc<Mutex<Inner>>,
    generation: u64,
    settings: ScheduleSettings,
    mut cancel: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
    check: F,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        let delay = {
            let guard = inner.lock();
            if guard.generation != generation {
                return;
            }
            delay_for(guard.state, &settings)
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => return,
        }

        if *shutdown.borrow() {
            log::debug!("Shutting down, skipping certificate check");
            return;
        }

        let result = check().await;

        let mut guard = inner.lock();
        if guard.generation != generation {
            return;
        }

        match result {
            Ok(()) => {
                if guard.state == SchedulerState::Error {
                    log::info!("Certificate check succeeded again, back to regular schedule");
                }
                guard.state = SchedulerState::Regular;
            }
            Err(err) => {
                log::warn!(
                    "Certificate check failed, retrying in {:?}: {err}",
                    settings.error_interval
                );
                guard.state = SchedulerState::Error;
            }
        }
    }
}
