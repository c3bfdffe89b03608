//! Periodic background sweep
//!
//! The sweep itself lives with the table; this module only owns the timer
//! task that triggers it.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::error::{BlacklistError, Result};

/// Handle to a running maintenance timer
#[derive(Debug)]
pub struct MaintenanceTask {
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    /// Run `sweep` every `period` on the current tokio runtime
    ///
    /// The first run happens one period after the call. `sweep` returns the
    /// number of entries it freed, or `None` once there is nothing left to
    /// maintain, which ends the task.
    pub fn spawn<F>(period: Duration, mut sweep: F) -> Result<Self>
    where
        F: FnMut() -> Option<usize> + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| BlacklistError::Timer(format!("no tokio runtime available: {}", e)))?;

        let handle = runtime.spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match sweep() {
                    Some(removed) => trace!("maintenance sweep freed {} entries", removed),
                    None => {
                        debug!("blacklist released, stopping maintenance timer");
                        break;
                    }
                }
            }
        });

        debug!("dst blacklist maintenance every {:?}", period);
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the timer
    pub fn stop(self) {
        self.handle.abort();
    }
}
