//! Coordinated shutdown.
//!
//! Every long-running task registers its join handle here. Shutdown
//! cancels the shared token, then waits for the tasks to drain within a
//! grace period; anything still running after that is abandoned and
//! reported.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct TaskRegistry {
    token: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The shared shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A child token that is cancelled with the registry but can also be
    /// cancelled independently.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub async fn register(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.tasks.lock().await.push((name.into(), handle));
    }

    /// Cancel the token and wait up to `grace` for all tasks to finish.
    pub async fn shutdown(self, grace: Duration) {
        self.token.cancel();
        let tasks = self.tasks.into_inner();
        let drain = async {
            for (name, handle) in tasks {
                match handle.await {
                    Ok(()) => debug!(task = %name, "Task finished"),
                    Err(e) => warn!(task = %name, error = %e, "Task aborted"),
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Grace period elapsed with tasks still running");
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_joins_registered_tasks() {
        let registry = TaskRegistry::new();
        let token = registry.token();
        registry
            .register(
                "worker",
                tokio::spawn(async move { token.cancelled().await }),
            )
            .await;
        registry.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_task_is_abandoned_after_grace() {
        let registry = TaskRegistry::new();
        registry
            .register(
                "hung",
                tokio::spawn(async {
                    // Ignores cancellation.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }),
            )
            .await;

        let started = tokio::time::Instant::now();
        registry.shutdown(Duration::from_secs(5)).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
