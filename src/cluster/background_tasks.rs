//! Named periodic loops with a shared shutdown signal.
//!
//! Heartbeat emission, timeout detection and snapshot ticks each run as one
//! named task here so that stopping a node stops all of them at once, with a
//! bound on how long it waits.
//!
//! ```rust,no_run
//! use clusterkernel::cluster::background_tasks::BackgroundTaskRegistry;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut tasks = BackgroundTaskRegistry::new();
//!     tasks.spawn_periodic("heartbeat", Duration::from_secs(5), |_tick| async {
//!         // send heartbeat
//!     });
//!     let report = tasks.shutdown_all_with_timeout(Duration::from_secs(2)).await;
//!     assert!(report.aborted.is_empty());
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    /// The task future returned or panicked.
    Finished,
}

/// Outcome of a bounded shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that exited on the shutdown signal.
    pub stopped: Vec<&'static str>,
    /// Tasks that had to be aborted at the deadline.
    pub aborted: Vec<&'static str>,
}

struct TaskEntry {
    handle: JoinHandle<()>,
}

/// Registry of named background tasks.
pub struct BackgroundTaskRegistry {
    tasks: HashMap<&'static str, TaskEntry>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn `task` under `name`, replacing any task already using the name.
    ///
    /// The task is raced against the shutdown signal and dropped when it
    /// fires.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            warn!(task = name, "Ignoring spawn during shutdown");
            return;
        }

        if let Some(previous) = self.tasks.remove(name) {
            previous.handle.abort();
            debug!(task = name, "Replaced running task");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => debug!(task = name, "Task completed"),
                _ = shutdown_rx.recv() => debug!(task = name, "Task received shutdown signal"),
            }
        });

        info!(task = name, "Spawned background task");
        self.tasks.insert(name, TaskEntry { handle });
    }

    /// Run `tick` every `period`. The first tick fires immediately.
    ///
    /// A slow tick delays the next one instead of bursting to catch up.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut n = 0u64;
            loop {
                timer.tick().await;
                tick(n).await;
                n = n.wrapping_add(1);
            }
        });
    }

    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        let mut out: Vec<_> = self
            .tasks
            .iter()
            .map(|(name, entry)| {
                let status = if entry.handle.is_finished() {
                    TaskStatus::Finished
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect();
        out.sort_by_key(|(name, _)| *name);
        out
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|e| !e.handle.is_finished())
            .count()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Signal every task and wait up to `timeout` in total for them to exit.
    /// Stragglers are aborted. Calling twice is a no-op.
    pub async fn shutdown_all_with_timeout(&mut self, timeout: Duration) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.shutting_down {
            return report;
        }
        self.shutting_down = true;

        info!(task_count = self.tasks.len(), "Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, entry) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = entry.handle.abort_handle();
            match tokio::time::timeout(remaining, entry.handle).await {
                Ok(Ok(())) => report.stopped.push(name),
                Ok(Err(e)) => {
                    warn!(task = name, error = %e, "Task panicked during shutdown");
                    report.stopped.push(name);
                }
                Err(_) => {
                    warn!(task = name, "Task did not stop in time, aborting");
                    abort.abort();
                    report.aborted.push(name);
                }
            }
        }

        info!(
            stopped = report.stopped.len(),
            aborted = report.aborted.len(),
            "Background tasks stopped"
        );
        report
    }
}

impl Default for BackgroundTaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskRegistry {
    fn drop(&mut self) {
        if !self.shutting_down {
            let _ = self.shutdown_tx.send(());
            for (_, entry) in self.tasks.drain() {
                entry.handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_spawn_and_health_check() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        assert_eq!(registry.task_count(), 1);
        assert_eq!(registry.health_check(), vec![("sleeper", TaskStatus::Running)]);

        let report = registry.shutdown_all_with_timeout(Duration::from_secs(1)).await;
        assert_eq!(report.stopped, vec!["sleeper"]);
        assert!(report.aborted.is_empty());
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_periodic_ticks() {
        let mut registry = BackgroundTaskRegistry::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        registry.spawn_periodic("ticker", Duration::from_millis(10), move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);

        registry.shutdown_all_with_timeout(Duration::from_secs(1)).await;
        let after = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_spawn_replaces_same_name() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("loop", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        registry.spawn("loop", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
        });
        assert_eq!(registry.task_count(), 1);
        registry.shutdown_all_with_timeout(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_finished_task_reported() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.spawn("quick", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.health_check(), vec![("quick", TaskStatus::Finished)]);
        assert_eq!(registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_ignored_after_shutdown() {
        let mut registry = BackgroundTaskRegistry::new();
        registry.shutdown_all_with_timeout(Duration::from_millis(10)).await;
        registry.spawn("late", async {});
        assert_eq!(registry.task_count(), 0);
        assert!(registry.is_shutting_down());
    }
}
