//! Background task supervision shared by the binaries.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the spawned tasks and the token that stops them.
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawn `task`, logging when it starts and ends.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting {name} task");
            task.await;
            tracing::info!("{name} task completed");
        }));
    }

    /// Wait for a shutdown signal or for any task to finish, then cancel the
    /// rest and give them `timeout` to stop.
    pub async fn wait_for_completion(&mut self, timeout: Duration) -> io::Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        let signal_handler = {
            #[cfg(unix)]
            {
                use tokio::signal::unix::signal;
                use tokio::signal::unix::SignalKind;
                let mut sigterm = signal(SignalKind::terminate())?;
                let mut sigint = signal(SignalKind::interrupt())?;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = sigterm.recv() => {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                        }
                        _ = sigint.recv() => {
                            tracing::info!("Received SIGINT, initiating graceful shutdown");
                        }
                    }
                })
            }
            #[cfg(not(unix))]
            {
                tokio::spawn(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        tracing::error!("Failed to listen for Ctrl+C: {e}");
                        return;
                    }
                    tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                })
            }
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
            }
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index, remaining) = result;
                drop(remaining);
                match result {
                    Ok(()) => tracing::warn!("Task completed unexpectedly"),
                    Err(e) => tracing::error!("Task completed with error: {e}"),
                }
                // the finished handle must not be polled again
                drop(self.tasks.remove(index));
            }
        }

        self.cancellation_token.cancel();
        self.wait_for_tasks_with_timeout(timeout).await;
        Ok(())
    }

    async fn wait_for_tasks_with_timeout(&mut self, timeout: Duration) {
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn finished_task_cancels_the_others() {
        let mut tasks = Tasks::new();
        let stopped = Arc::new(AtomicBool::new(false));

        let token = tasks.token();
        let flag = stopped.clone();
        tasks.spawn("waiter", async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        tasks.spawn("short", async {});

        tasks
            .wait_for_completion(Duration::from_secs(5))
            .await
            .expect("should install signal handlers");

        assert!(stopped.load(Ordering::SeqCst));
        assert!(tasks.token().is_cancelled());
    }

    #[tokio::test]
    async fn no_tasks_returns_immediately() {
        let mut tasks = Tasks::new();
        tasks
            .wait_for_completion(Duration::from_secs(1))
            .await
            .expect("should return");
    }
}
