//! Scheduled daily revalidation.
//!
//! Fires once a day at a configured UTC hour and marks every incremental
//! entry stale, handing them to the manager's eager re-render path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use time::{OffsetDateTime, Time};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::entry::Strategy;
use super::manager::CacheManager;

const REVALIDATION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Background task that periodically marks incremental entries stale.
pub struct Revalidator {
    manager: Arc<CacheManager>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Revalidator {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start the schedule: the first firing happens at the next occurrence
    /// of `hour` (UTC, 0-23), then every 24 hours until [`Self::stop`].
    pub fn start(&mut self, hour: u8) {
        let initial_delay = delay_until_hour(OffsetDateTime::now_utc(), hour);
        info!(
            hour,
            initial_delay_secs = initial_delay.as_secs(),
            "starting cache revalidation worker"
        );

        let manager = Arc::clone(&self.manager);
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cache revalidation worker stopped");
                    return;
                }
                _ = sleep(initial_delay) => {}
            }

            loop {
                revalidate_incremental(&manager);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("cache revalidation worker stopped");
                        return;
                    }
                    _ = sleep(REVALIDATION_PERIOD) => {}
                }
            }
        }));
    }

    /// Halt the schedule. Safe to call more than once, or without a prior
    /// [`Self::start`].
    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.task.take();
    }
}

fn revalidate_incremental(manager: &Arc<CacheManager>) {
    info!("starting incremental cache revalidation");
    let started = Instant::now();
    let count = manager.mark_stale(Strategy::Incremental, true);
    info!(
        count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "incremental cache revalidation completed"
    );
}

/// Time until the next occurrence of `hour` (today if not yet passed, else
/// tomorrow). Hours above 23 are clamped to midnight.
fn delay_until_hour(now: OffsetDateTime, hour: u8) -> Duration {
    let fire_at = Time::from_hms(hour, 0, 0).unwrap_or(Time::MIDNIGHT);
    let mut next = now.replace_time(fire_at);
    if next <= now {
        next += time::Duration::days(1);
    }
    (next - now).unsigned_abs()
}
