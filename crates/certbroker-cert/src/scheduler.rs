//! Background jobs: inventory sync, expiry handling, domain validation

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::expiry::{ExpiryNotifier, ExpirySweep};
use crate::sync::CertificateSyncer;
use crate::validation::DomainValidationOrchestrator;

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub full_sync: Duration,
    pub pending_sync: Duration,
    pub expiry: Duration,
    pub validation: Duration,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            full_sync: Duration::from_secs(6 * 60 * 60),
            pending_sync: Duration::from_secs(15 * 60),
            expiry: Duration::from_secs(24 * 60 * 60),
            validation: Duration::from_secs(24 * 60 * 60),
        }
    }
}

pub struct Scheduler {
    syncer: CertificateSyncer,
    sweep: Arc<ExpirySweep>,
    notifier: Option<Arc<ExpiryNotifier>>,
    validation: Option<DomainValidationOrchestrator>,
    settings: ScheduleSettings,
}

/// Run `job` every `period` until `cancel` fires. Failures are logged and
/// the loop carries on.
fn every<F, Fut>(
    set: &mut JoinSet<()>,
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    job: F,
) where
    F: Fn(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    set.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let started = Instant::now();
            match job(cancel.clone()).await {
                Ok(()) => debug!(job = name, elapsed = ?started.elapsed(), "Scheduled job finished"),
                Err(e) => error!(job = name, "Scheduled job failed: {}", e),
            }
        }
        info!(job = name, "Scheduled job stopped");
    });
}

impl Scheduler {
    pub fn new(syncer: CertificateSyncer, sweep: ExpirySweep, settings: ScheduleSettings) -> Self {
        Self {
            syncer,
            sweep: Arc::new(sweep),
            notifier: None,
            validation: None,
            settings,
        }
    }

    pub fn with_notifier(mut self, notifier: ExpiryNotifier) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn with_validation(mut self, validation: DomainValidationOrchestrator) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Start every job. Each runs once immediately, then on its period.
    pub fn spawn(self, cancel: &CancellationToken) -> JoinSet<()> {
        let mut set = JoinSet::new();

        let syncer = self.syncer.clone();
        every(&mut set, "full_sync", self.settings.full_sync, cancel.clone(), move |cancel| {
            let syncer = syncer.clone();
            async move {
                syncer.sync_all(&cancel).await?;
                Ok(())
            }
        });

        let syncer = self.syncer;
        every(&mut set, "pending_sync", self.settings.pending_sync, cancel.clone(), move |cancel| {
            let syncer = syncer.clone();
            async move {
                syncer.sync_pending(&cancel).await?;
                Ok(())
            }
        });

        let sweep = self.sweep;
        let notifier = self.notifier;
        every(&mut set, "expiry", self.settings.expiry, cancel.clone(), move |_| {
            let sweep = sweep.clone();
            let notifier = notifier.clone();
            async move {
                let now = Utc::now();
                sweep.run(now).await?;
                if let Some(notifier) = notifier {
                    notifier.run(now).await?;
                }
                Ok(())
            }
        });

        if let Some(validation) = self.validation {
            every(&mut set, "validation", self.settings.validation, cancel.clone(), move |cancel| {
                let validation = validation.clone();
                async move {
                    validation.run(&cancel).await?;
                    Ok(())
                }
            });
        }

        info!(jobs = set.len(), "Scheduler started");
        set
    }

    /// Run until `cancel` fires and every job has stopped
    pub async fn run(self, cancel: CancellationToken) {
        let mut set = self.spawn(&cancel);
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!("Scheduled job task ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }
}
