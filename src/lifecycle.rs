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
//! The lifecycle state machine (C4): the single authoritative writer of backend state.
//!
//! Every other component only ever *proposes* a transition by sending a [`LifecycleEvent`] into
//! this machine's channel; the machine itself is the only thing that ever assigns `self.state`.
//! External readers get an atomic snapshot through a `watch::Receiver` rather than touching any
//! lock.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::error::IntentFailure;
use crate::idle::ActivityStamp;
use crate::ipmi::IpmiEffector;
use crate::forwarder;
use crate::queue::{AdmissionQueue, PendingIntent};

/// The authoritative backend state. Exactly one instance exists, owned by [`LifecycleMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Off,
    Starting,
    Ready,
    Stopping,
}

/// Every event the lifecycle machine reacts to, drawn from the transition table: oracle signals,
/// admission arrivals, timer expiries, and in-flight IPMI command completions.
#[derive(Debug)]
pub enum LifecycleEvent {
    IntentArrived(PendingIntent),
    ObservedOff,
    ObservedStarting,
    ObservedReady,
    ObservedUnknown,
    IdleTimerFired,
    PowerOnAck { epoch: u64, ok: bool },
    StartupDeadlineElapsed { epoch: u64 },
    SoftOffAck { epoch: u64, ok: bool },
    Shutdown,
}

/// Handle given to every other component: a sender into the machine's event channel plus a
/// read-only snapshot of the current state.
#[derive(Clone)]
pub struct LifecycleHandle {
    pub events_tx: mpsc::UnboundedSender<LifecycleEvent>,
    pub state_rx: watch::Receiver<LifecycleState>,
}

impl LifecycleHandle {
    pub fn snapshot(&self) -> LifecycleState { *self.state_rx.borrow() }
}

pub struct LifecycleMachine {
    state: LifecycleState,
    state_tx: watch::Sender<LifecycleState>,
    events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    events_tx: mpsc::UnboundedSender<LifecycleEvent>,

    queue: Arc<AdmissionQueue>,
    effector: Arc<dyn IpmiEffector>,
    activity: ActivityStamp,
    target_host: Arc<str>,
    forwarders: Arc<forwarder::ForwarderRegistry>,

    startup_timeout: Duration,
    inactivity_timeout: Duration,

    starting_epoch: u64,
    startup_retry_used: bool,
    stopping_epoch: u64,
}

/// Everything the machine needs at construction time; bundled so `supervisor.rs` doesn't have to
/// pass eight positional arguments.
pub struct MachineConfig {
    pub queue: Arc<AdmissionQueue>,
    pub effector: Arc<dyn IpmiEffector>,
    pub activity: ActivityStamp,
    pub target_host: Arc<str>,
    pub forwarders: Arc<forwarder::ForwarderRegistry>,
    pub startup_timeout: Duration,
    pub inactivity_timeout: Duration,
}

impl LifecycleMachine {
    pub fn new(config: MachineConfig) -> (LifecycleMachine, LifecycleHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LifecycleState::Off);

        let machine = LifecycleMachine {
            state: LifecycleState::Off,
            state_tx,
            events_rx,
            events_tx: events_tx.clone(),
            queue: config.queue,
            effector: config.effector,
            activity: config.activity,
            target_host: config.target_host,
            forwarders: config.forwarders,
            startup_timeout: config.startup_timeout,
            inactivity_timeout: config.inactivity_timeout,
            starting_epoch: 0,
            startup_retry_used: false,
            stopping_epoch: 0,
        };

        let handle = LifecycleHandle { events_tx, state_rx };
        (machine, handle)
    }

    /// Runs until a [`LifecycleEvent::Shutdown`] is received or every sender has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            if matches!(event, LifecycleEvent::Shutdown) {
                self.handle_shutdown().await;
                return;
            }
            self.handle(event).await;
            let _ = self.state_tx.send(self.state);
        }
    }

    async fn handle_shutdown(&mut self) {
        log::info!("[lifecycle] shutting down; failing any queued intents");
        for intent in self.queue.fail_all(IntentFailure::ShuttingDown).await {
            intent.fail(IntentFailure::ShuttingDown).await;
        }
    }

    async fn handle(&mut self, event: LifecycleEvent) {
        log::debug!("[lifecycle] state={:?} event={:?}", self.state, event);
        match (self.state, event) {
            // -------------------------------------------------------------- OFF
            (LifecycleState::Off, LifecycleEvent::IntentArrived(intent)) => {
                self.enqueue(intent).await;
                self.enter_starting_from_off();
            },
            (LifecycleState::Off, LifecycleEvent::ObservedStarting) => self.enter_starting_from_off(),
            (LifecycleState::Off, LifecycleEvent::ObservedReady) => self.enter_ready().await,
            (LifecycleState::Off, LifecycleEvent::ObservedOff) => {},

            // -------------------------------------------------------------- STARTING
            (LifecycleState::Starting, LifecycleEvent::IntentArrived(intent)) => self.enqueue(intent).await,
            (LifecycleState::Starting, LifecycleEvent::ObservedReady) => self.enter_ready().await,
            (LifecycleState::Starting, LifecycleEvent::ObservedOff) => {},
            (LifecycleState::Starting, LifecycleEvent::ObservedStarting) => {},
            (LifecycleState::Starting, LifecycleEvent::PowerOnAck { epoch, ok }) => {
                if epoch == self.starting_epoch {
                    log::debug!("[lifecycle] power-on ack (ok={}) recorded; still waiting for READY", ok);
                }
            },
            (LifecycleState::Starting, LifecycleEvent::StartupDeadlineElapsed { epoch }) => {
                if epoch == self.starting_epoch {
                    self.handle_startup_timeout().await;
                }
            },

            // -------------------------------------------------------------- READY
            (LifecycleState::Ready, LifecycleEvent::IntentArrived(intent)) => self.forward_immediately(intent).await,
            (LifecycleState::Ready, LifecycleEvent::ObservedOff) => {
                log::warn!("[lifecycle] backend power lost unexpectedly while READY; dropping forwarders");
                self.state = LifecycleState::Off;
                self.forwarders.abort_all().await;
            },
            (LifecycleState::Ready, LifecycleEvent::ObservedStarting) => {
                self.state = LifecycleState::Starting;
            },
            (LifecycleState::Ready, LifecycleEvent::IdleTimerFired) => {
                if self.activity.last_activity().elapsed() >= self.inactivity_timeout {
                    self.enter_stopping();
                } else {
                    log::debug!("[lifecycle] idle fire raced with fresh activity; ignoring");
                }
            },

            // -------------------------------------------------------------- STOPPING
            (LifecycleState::Stopping, LifecycleEvent::IntentArrived(intent)) => self.enqueue(intent).await,
            (LifecycleState::Stopping, LifecycleEvent::ObservedOff) => self.after_power_off().await,
            (LifecycleState::Stopping, LifecycleEvent::ObservedStarting) => self.state = LifecycleState::Starting,
            (LifecycleState::Stopping, LifecycleEvent::ObservedReady) => self.enter_ready().await,
            (LifecycleState::Stopping, LifecycleEvent::SoftOffAck { epoch, ok }) => {
                if epoch == self.stopping_epoch {
                    log::debug!("[lifecycle] soft-off ack (ok={}) recorded", ok);
                }
            },

            // -------------------------------------------------------------- catch-all
            (state, event) => {
                log::debug!("[lifecycle] ignoring event {:?} in state {:?}", event, state);
            },
        }
    }

    async fn enqueue(&mut self, intent: PendingIntent) {
        if let Err((intent, _)) = self.queue.offer(intent).await {
            intent.fail(IntentFailure::QueueFull).await;
        }
    }

    async fn forward_immediately(&mut self, intent: PendingIntent) {
        self.activity.stamp();
        let target_host = self.target_host.clone();
        let activity = self.activity.clone();
        let queue = self.queue.clone();
        self.forwarders.spawn(forwarder::spawn(intent, target_host, activity, queue)).await;
    }

    fn enter_starting_from_off(&mut self) {
        self.state = LifecycleState::Starting;
        self.starting_epoch += 1;
        self.startup_retry_used = false;
        let epoch = self.starting_epoch;

        let effector = self.effector.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let ok = effector.power_on().await.is_ok();
            let _ = events_tx.send(LifecycleEvent::PowerOnAck { epoch, ok });
        });

        self.arm_startup_deadline(epoch);
    }

    fn arm_startup_deadline(&self, epoch: u64) {
        let events_tx = self.events_tx.clone();
        let timeout = self.startup_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events_tx.send(LifecycleEvent::StartupDeadlineElapsed { epoch });
        });
    }

    async fn handle_startup_timeout(&mut self) {
        let queue_len = self.queue.len().await;
        if !self.startup_retry_used && queue_len > 0 {
            log::warn!("[lifecycle] startup timeout with {} queued intents; retrying power-on once", queue_len);
            self.startup_retry_used = true;

            let effector = self.effector.clone();
            let events_tx = self.events_tx.clone();
            let epoch = self.starting_epoch;
            tokio::spawn(async move {
                let ok = effector.power_on().await.is_ok();
                let _ = events_tx.send(LifecycleEvent::PowerOnAck { epoch, ok });
            });
            self.arm_startup_deadline(epoch);
            return;
        }

        log::error!("[lifecycle] startup timeout exceeded; failing queued intents and returning to OFF");
        self.state = LifecycleState::Off;
        for intent in self.queue.fail_all(IntentFailure::BackendStartTimeout).await {
            intent.fail(IntentFailure::BackendStartTimeout).await;
        }
    }

    async fn enter_ready(&mut self) {
        self.state = LifecycleState::Ready;
        self.activity.stamp();
        self.drain_queue().await;
    }

    async fn drain_queue(&mut self) {
        let (ready, expired) = self.queue.release_all().await;
        for intent in expired {
            intent.fail(IntentFailure::DeadlineExpired).await;
        }
        for intent in ready {
            self.forward_immediately(intent).await;
        }
    }

    fn enter_stopping(&mut self) {
        self.state = LifecycleState::Stopping;
        self.stopping_epoch += 1;
        let epoch = self.stopping_epoch;

        let effector = self.effector.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let ok = effector.power_soft().await.is_ok();
            let _ = events_tx.send(LifecycleEvent::SoftOffAck { epoch, ok });
        });
    }

    async fn after_power_off(&mut self) {
        self.state = LifecycleState::Off;
        if self.queue.is_empty().await {
            return;
        }
        self.enter_starting_from_off();
    }
}
