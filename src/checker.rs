//! Scheduled credential check over all user owners
//!
//! One pass walks every user, computes the credential status (optionally with a
//! live probe), and sends exactly one notification per expiry event. A failing
//! owner is logged and skipped; the pass goes on with the rest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::credential::{CredentialLifecycle, CredentialProbe, CredentialStatus};
use crate::crypto::random_below;
use crate::error::Result;
use crate::key_manager::MasterKey;
use crate::prefs::OwnerRegistry;
use crate::storage::{Owner, OwnerKind, PrefStorage};

/// Default interval between check passes (5 minutes)
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 300;

/// Delivers the "your credential expired" message to an owner
#[async_trait]
pub trait ExpiryNotifier: Send + Sync {
    async fn notify_expired(&self, owner: &Owner) -> Result<()>;
}

/// Check pass statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Owners whose status was evaluated
    pub checked: usize,
    pub absent: usize,
    pub valid: usize,
    pub expiring_soon: usize,
    /// Notifications sent in this pass
    pub notified: usize,
    pub already_notified: usize,
    /// Owners skipped because of an error
    pub failed: usize,
    /// Pass stopped early on shutdown
    pub interrupted: bool,
    pub duration_ms: u64,
}

pub struct CredentialChecker<S: PrefStorage> {
    registry: OwnerRegistry<S>,
    lifecycle: CredentialLifecycle<S>,
    notifier: Arc<dyn ExpiryNotifier>,
    probe: Option<Arc<dyn CredentialProbe>>,
    max_jitter: Duration,
}

impl<S: PrefStorage> CredentialChecker<S> {
    pub fn new(
        registry: OwnerRegistry<S>,
        lifecycle: CredentialLifecycle<S>,
        notifier: Arc<dyn ExpiryNotifier>,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            notifier,
            probe: None,
            max_jitter: Duration::ZERO,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn CredentialProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Random delay in `[0, max_jitter)` between owners, to spread remote API calls
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Run one pass. Only listing the owners can fail the pass as a whole.
    pub async fn run_once(
        &self,
        master: &MasterKey,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<CheckReport> {
        let start = Instant::now();
        let owners = self.registry.owners(OwnerKind::User).await?;
        debug!(owners = owners.len(), "starting credential check");

        let mut report = CheckReport::default();
        for (i, owner) in owners.iter().enumerate() {
            if *shutdown.borrow() {
                report.interrupted = true;
                break;
            }
            if i > 0 && !self.pause(shutdown).await {
                report.interrupted = true;
                break;
            }

            report.checked += 1;
            match self.check_owner(owner, master).await {
                Ok(Checked::Status(CredentialStatus::Absent)) => report.absent += 1,
                Ok(Checked::Status(CredentialStatus::Valid)) => report.valid += 1,
                Ok(Checked::Status(CredentialStatus::ExpiringSoon)) => report.expiring_soon += 1,
                Ok(Checked::Status(_)) => report.already_notified += 1,
                Ok(Checked::Notified) => report.notified += 1,
                Err(e) => {
                    warn!(owner = %owner.owner_id(), error = %e, "credential check failed, skipping");
                    report.failed += 1;
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        if report.notified > 0 || report.failed > 0 {
            info!(
                checked = report.checked,
                notified = report.notified,
                failed = report.failed,
                duration_ms = report.duration_ms,
                "credential check completed"
            );
        } else {
            debug!(checked = report.checked, duration_ms = report.duration_ms, "credential check completed");
        }
        Ok(report)
    }

    async fn check_owner(&self, owner: &Owner, master: &MasterKey) -> Result<Checked> {
        let status = match &self.probe {
            Some(probe) => {
                self.lifecycle
                    .status_with_probe(owner, master, probe.as_ref())
                    .await?
            }
            None => self.lifecycle.credential_status(owner, master).await?,
        };
        if !status.needs_notification() {
            return Ok(Checked::Status(status));
        }

        // A crash between these two calls sends the message again on the next pass.
        self.notifier.notify_expired(owner).await?;
        self.lifecycle.mark_notified(owner).await?;
        info!(owner = %owner.owner_id(), "sent credential expiry notification");
        Ok(Checked::Notified)
    }

    /// Returns false if shutdown was signalled while waiting
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return true;
        }
        let delay = Duration::from_millis(random_below(max_ms));
        let changed = tokio::select! {
            _ = tokio::time::sleep(delay) => return true,
            changed = shutdown.changed() => changed,
        };
        // sender gone: nobody can ask us to stop any more
        changed.is_err() || !*shutdown.borrow()
    }
}

enum Checked {
    Status(CredentialStatus),
    Notified,
}
