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
//! The idle accountant (C6): tracks the most recent activity across every port and arms/fires
//! the idle timer that drives READY -> STOPPING.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};

use crate::lifecycle::{LifecycleEvent, LifecycleState};

/// Shared, clonable handle to the last-activity timestamp.
///
/// Stored as milliseconds elapsed since the accountant was created rather than an `Instant`
/// directly, so it fits in an `AtomicU64` and can be updated with a compare-and-swap loop that
/// only ever advances the clock forward -- concurrent stamps race safely and never regress it.
#[derive(Clone)]
pub struct ActivityStamp {
    epoch: Instant,
    last_activity_ms: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl ActivityStamp {
    fn new() -> Self {
        ActivityStamp { epoch: Instant::now(), last_activity_ms: Arc::new(AtomicU64::new(0)), notify: Arc::new(Notify::new()) }
    }

    /// Records activity "now". Uses an atomic max so a stale, reordered update can never move
    /// the timestamp backwards.
    pub fn stamp(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let mut current = self.last_activity_ms.load(Ordering::SeqCst);
        while now_ms > current {
            match self
                .last_activity_ms
                .compare_exchange_weak(current, now_ms, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        self.notify.notify_waiters();
    }

    pub fn last_activity(&self) -> Instant { self.epoch + Duration::from_millis(self.last_activity_ms.load(Ordering::SeqCst)) }
}

/// Runs the idle timer loop: while the lifecycle state is READY, watches for
/// `now - last_activity >= inactivity_timeout` and posts [`LifecycleEvent::IdleTimerFired`].
///
/// The lifecycle machine re-validates elapsed time itself before acting on the event, so a
/// stale firing racing against fresh activity can never incorrectly stop a backend that just
/// received a new request (see the tie-break rule in the spec).
pub async fn run(
    stamp: ActivityStamp, inactivity_timeout: Duration, mut state_rx: watch::Receiver<LifecycleState>,
    events_tx: tokio::sync::mpsc::UnboundedSender<LifecycleEvent>,
) {
    loop {
        if *state_rx.borrow() != LifecycleState::Ready {
            if state_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let last = stamp.last_activity();
        let elapsed = last.elapsed();
        if elapsed >= inactivity_timeout {
            let _ = events_tx.send(LifecycleEvent::IdleTimerFired);
            // Wait for the lifecycle machine to move us out of READY before re-arming, so we
            // don't spam duplicate fire events every loop iteration.
            if state_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let remaining = inactivity_timeout - elapsed;
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {},
            _ = stamp.notify.notified() => {},
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

pub fn new_stamp() -> ActivityStamp { ActivityStamp::new() }
