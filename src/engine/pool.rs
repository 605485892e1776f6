//! Bounded execution slots shared by the request generators.
//!
//! Closed-loop users borrow a slot for the duration of one request via
//! [`WorkerPool::run`]. Open-loop emissions go through [`WorkerPool::submit`],
//! which starts the job on a free slot or parks it in a bounded queue that
//! finishing slots drain. Nothing ever spawns beyond `capacity`.

use crate::error::{Error, Result};
use crate::types::BackpressurePolicy;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Unit of open-loop work.
pub trait Job: Send + 'static {
    fn run(self) -> BoxFuture<'static, ()>;
}

/// How [`WorkerPool::submit`] admitted a job.
#[derive(Debug)]
pub enum Admission<J> {
    /// Running on a free slot right away
    Started,
    /// Parked until a slot frees up
    Queued,
    /// Queue was full; this job (the oldest queued one, or the submitted one
    /// when nothing is queued) was evicted and will never run
    Evicted(J),
    /// Block policy had to wait this long for room before admitting
    Backpressured { waited: Duration },
}

pub struct WorkerPool<J: Job> {
    inner: Arc<Inner<J>>,
}

impl<J: Job> Clone for WorkerPool<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<J> {
    capacity: u32,
    slots: Arc<Semaphore>,
    queue: Mutex<VecDeque<J>>,
    queue_capacity: usize,
    policy: BackpressurePolicy,
    // Signalled whenever a queued job leaves the queue or a slot is released
    space: Notify,
    closed: CancellationToken,
    aborted: CancellationToken,
    tracker: TaskTracker,
    in_flight: AtomicU32,
    in_flight_peak: AtomicU32,
    abandoned: AtomicU64,
}

impl<J: Job> WorkerPool<J> {
    pub fn new(capacity: u32, queue_capacity: u32, policy: BackpressurePolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                slots: Arc::new(Semaphore::new(capacity as usize)),
                queue: Mutex::new(VecDeque::with_capacity(queue_capacity.min(4_096) as usize)),
                queue_capacity: queue_capacity as usize,
                policy,
                space: Notify::new(),
                closed: CancellationToken::new(),
                aborted: CancellationToken::new(),
                tracker: TaskTracker::new(),
                in_flight: AtomicU32::new(0),
                in_flight_peak: AtomicU32::new(0),
                abandoned: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.in_flight.load(Ordering::Relaxed)
    }

    pub fn in_flight_peak(&self) -> u32 {
        self.inner.in_flight_peak.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn abandoned(&self) -> u64 {
        self.inner.abandoned.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Run `fut` on a slot owned by the caller, waiting until one is free.
    ///
    /// Fails with `PoolClosed` if the pool closes while waiting, or if the
    /// pool is aborted while `fut` is still running.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        let _permit = tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => return Err(Error::PoolClosed),
            permit = self.inner.slots.acquire() => permit.map_err(|_| Error::PoolClosed)?,
        };

        let _busy = InFlight::enter(&self.inner);
        tokio::select! {
            biased;
            _ = self.inner.aborted.cancelled() => Err(Error::PoolClosed),
            output = fut => Ok(output),
        }
    }

    /// Hand an open-loop job to the pool without waiting for it to run.
    pub async fn submit(&self, job: J) -> Result<Admission<J>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let job = match self.try_admit(job) {
            Ok(admission) => return Ok(admission),
            Err(job) => job,
        };

        // Block policy: wait for a slot or queue room
        let blocked_at = Instant::now();
        let mut pending = job;
        loop {
            tokio::select! {
                biased;
                _ = self.inner.closed.cancelled() => return Err(Error::PoolClosed),
                _ = self.inner.space.notified() => {}
            }

            pending = match self.try_admit(pending) {
                Ok(_) => {
                    return Ok(Admission::Backpressured {
                        waited: blocked_at.elapsed(),
                    });
                }
                Err(job) => job,
            };
        }
    }

    /// Admit without waiting. Hands the job back when the block policy
    /// requires the caller to wait.
    fn try_admit(&self, job: J) -> std::result::Result<Admission<J>, J> {
        let mut queue = self.inner.queue.lock();

        if queue.is_empty()
            && let Ok(permit) = self.inner.slots.clone().try_acquire_owned()
        {
            drop(queue);
            self.spawn_slot(permit, job);
            return Ok(Admission::Started);
        }

        if queue.len() < self.inner.queue_capacity {
            queue.push_back(job);
            drop(queue);
            self.pump();
            return Ok(Admission::Queued);
        }

        match self.inner.policy {
            BackpressurePolicy::DropOldest => {
                let evicted = match queue.pop_front() {
                    Some(oldest) => {
                        queue.push_back(job);
                        oldest
                    }
                    None => job,
                };
                Ok(Admission::Evicted(evicted))
            }
            BackpressurePolicy::Block => Err(job),
        }
    }

    /// Start queued jobs on any slots that are free.
    fn pump(&self) {
        loop {
            let mut queue = self.inner.queue.lock();
            if queue.is_empty() {
                return;
            }
            let Ok(permit) = self.inner.slots.clone().try_acquire_owned() else {
                return;
            };
            let Some(job) = queue.pop_front() else {
                return;
            };
            drop(queue);

            self.inner.space.notify_one();
            self.spawn_slot(permit, job);
        }
    }

    fn spawn_slot(&self, permit: OwnedSemaphorePermit, job: J) {
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move {
            let mut job = job;
            loop {
                {
                    let _busy = InFlight::enter(&inner);
                    tokio::select! {
                        biased;
                        _ = inner.aborted.cancelled() => break,
                        _ = job.run() => {}
                    }
                }

                // The permit goes back while the queue is locked, so a
                // concurrent submit either sees our job taken or the slot free.
                let mut queue = inner.queue.lock();
                match queue.pop_front() {
                    Some(next) => {
                        drop(queue);
                        inner.space.notify_one();
                        job = next;
                    }
                    None => {
                        drop(permit);
                        drop(queue);
                        inner.space.notify_one();
                        return;
                    }
                }
            }
        });
    }

    /// Stop admitting work. Queued jobs that never started are discarded;
    /// running ones keep going.
    pub fn close(&self) {
        if self.inner.closed.is_cancelled() {
            return;
        }
        self.inner.closed.cancel();
        self.inner.slots.close();

        let discarded = {
            let mut queue = self.inner.queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if discarded > 0 {
            self.inner.abandoned.fetch_add(discarded as u64, Ordering::Relaxed);
            tracing::info!("Discarded {} queued requests that never started", discarded);
        }
        self.inner.tracker.close();
    }

    /// Wait for every slot task spawned by `submit` to finish.
    pub async fn wait(&self) {
        self.inner.tracker.wait().await;
    }

    /// Forced teardown: cancel whatever is still running.
    pub fn abort(&self) {
        self.close();
        self.inner.aborted.cancel();
    }
}

struct InFlight<'a> {
    count: &'a AtomicU32,
}

impl<'a> InFlight<'a> {
    fn enter<J>(inner: &'a Inner<J>) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        inner.in_flight_peak.fetch_max(now, Ordering::AcqRel);
        Self {
            count: &inner.in_flight,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}
