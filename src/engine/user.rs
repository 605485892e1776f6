use crate::engine::MetricsCollector;
use crate::engine::clock;
use crate::engine::pool::{Job, WorkerPool};
use crate::requester::Requester;
use crate::types::{Endpoint, ThinkTime};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Idle,
    Requesting,
    Thinking,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct UserReport {
    pub id: u32,
    pub iterations: u64,
    pub state: UserState,
}

/// Closed-loop actor: request, think, repeat.
///
/// At most one request per user is ever outstanding. Cancellation is only
/// observed between states, so a request that already started always
/// completes and is recorded.
pub struct VirtualUser<J: Job> {
    id: u32,
    requester: Arc<dyn Requester>,
    endpoint: Endpoint,
    think_time: ThinkTime,
    pool: WorkerPool<J>,
    metrics: Arc<MetricsCollector>,
    cancel: CancellationToken,
    deadline: Instant,
    state: UserState,
    iterations: u64,
}

impl<J: Job> VirtualUser<J> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        requester: Arc<dyn Requester>,
        endpoint: Endpoint,
        think_time: ThinkTime,
        pool: WorkerPool<J>,
        metrics: Arc<MetricsCollector>,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            id,
            requester,
            endpoint,
            think_time,
            pool,
            metrics,
            cancel,
            deadline,
            state: UserState::Idle,
            iterations: 0,
        }
    }

    pub async fn run(mut self) -> UserReport {
        tracing::debug!("User {} started", self.id);

        while !self.should_stop() {
            self.transition(UserState::Requesting);
            let scheduled_at = clock::now();
            let outcome = match self.pool.run(self.requester.send(&self.endpoint)).await {
                Ok(outcome) => outcome,
                // Pool closed while waiting for a slot, or torn down mid-request
                Err(_) => break,
            };
            self.metrics.record(outcome.with_queue_delay(scheduled_at));
            self.iterations += 1;

            if self.should_stop() {
                break;
            }

            self.transition(UserState::Thinking);
            let think = self.think_time.sample();
            if think.is_zero() {
                // Zero think time must still let the scheduler breathe
                tokio::task::yield_now().await;
            } else if clock::after(think, &self.cancel).await.is_cancelled() {
                break;
            }
        }

        self.transition(UserState::Stopped);
        tracing::debug!("User {} stopped after {} iterations", self.id, self.iterations);

        UserReport {
            id: self.id,
            iterations: self.iterations,
            state: self.state,
        }
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || clock::now() >= self.deadline
    }

    fn transition(&mut self, next: UserState) {
        debug_assert!(
            self.state != UserState::Stopped,
            "user {} left the stopped state",
            self.id
        );
        tracing::trace!("User {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}
