//! Stale-task watchdog.
//!
//! Periodically scans for active or blocked tasks that stopped heartbeating
//! and raises one alert per stall. A task that resumes heartbeating is
//! cleared from the alerted set, so a later stall alerts again.

use crate::tasks::TaskLogType;
use crate::{CompanyDeps, TaskEvent};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub struct Watchdog {
    deps: CompanyDeps,
    /// Task ids already alerted for their current stall. Never persisted.
    alerted: Mutex<HashSet<String>>,
}

impl Watchdog {
    pub fn new(deps: CompanyDeps) -> Self {
        Self {
            deps,
            alerted: Mutex::new(HashSet::new()),
        }
    }

    /// Start the periodic scanner. Stops when the shutdown flag flips.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let watchdog = self.clone();
        let interval = Duration::from_millis(watchdog.deps.config.check_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                    _ = ticker.tick() => {
                        if let Err(error) = watchdog.scan().await {
                            tracing::error!(%error, "watchdog scan failed");
                        }
                    }
                }
            }
            tracing::debug!("watchdog stopped");
        })
    }

    /// One scan pass. Returns how many tasks were newly alerted.
    pub async fn scan(&self) -> crate::Result<usize> {
        let threshold_ms = self.deps.config.stale_threshold_ms;
        let stale = self.deps.task_store.get_stale_tasks(threshold_ms).await?;
        let stale_ids: HashSet<String> = stale.iter().map(|task| task.id.clone()).collect();

        let fresh: Vec<_> = {
            let alerted = self.alerted.lock().expect("alerted lock poisoned");
            stale
                .into_iter()
                .filter(|task| !alerted.contains(&task.id))
                .collect()
        };

        let mut newly_alerted = 0;
        for task in fresh {
            let task_id = task.id.clone();
            tracing::warn!(
                task_id = %task.id,
                agent_id = %task.agent_id,
                status = %task.status,
                "task went stale"
            );

            let minutes = threshold_ms / 60_000;
            if let Err(error) = self
                .deps
                .task_store
                .append_log(
                    &task.id,
                    &task.agent_id,
                    TaskLogType::Error,
                    &format!("no heartbeat for over {minutes} minutes"),
                    None,
                )
                .await
            {
                tracing::error!(%error, task_id = %task.id, "failed to log stale task");
                continue;
            }

            self.deps
                .broadcaster
                .broadcast("task.stale", serde_json::json!({ "task": &task }));
            self.deps
                .task_store
                .emit(TaskEvent::Stale { task });

            self.alerted
                .lock()
                .expect("alerted lock poisoned")
                .insert(task_id);
            newly_alerted += 1;
        }

        // Tasks that recovered re-arm for the next stall.
        self.alerted
            .lock()
            .expect("alerted lock poisoned")
            .retain(|id| stale_ids.contains(id));

        Ok(newly_alerted)
    }
}
