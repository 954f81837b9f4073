//! Run-scoped background tasks: periodic jobs registered on a [`Scheduler`]
//! share one cancellation token and are cancelled and joined together.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct Scheduler {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// Tasks stop when either `parent` or [`Scheduler::shutdown`] cancels them.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Runs `task` every `period`, first after one full period. A tick that fires while the
    /// previous run is still in flight is skipped; a run in progress is never interrupted.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => task().await,
                }
            }

            tracing::debug!(task = name, "scheduled task stopped");
        });
        self.tasks.push((name, handle));
    }

    /// Adopts a task spawned elsewhere so shutdown joins it too. The task is expected to
    /// observe [`Scheduler::token`].
    pub fn adopt(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.tasks {
            if let Err(err) = handle.await {
                tracing::warn!(task = name, error = %err, "scheduled task panicked");
            }
        }
    }
}
