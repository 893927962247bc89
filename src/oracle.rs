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
//! The power state oracle (C3): polls C1 (and, when powered on, C2) on a fixed interval and
//! posts a derived signal to the lifecycle machine. Never touches [`crate::lifecycle`] state
//! directly -- it is advisory, not authoritative.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::ipmi::{IpmiEffector, ObservedState};
use crate::lifecycle::LifecycleEvent;
use crate::probe::{self, ObservedReachability};

/// Runs the oracle loop until `events_tx` is dropped or the channel is closed.
pub async fn run(
    effector: Arc<dyn IpmiEffector>, target_host: String, probe_port: u16, check_interval: Duration,
    events_tx: UnboundedSender<LifecycleEvent>,
) {
    let mut interval = tokio::time::interval(check_interval);
    // The first tick fires immediately; skip it so the oracle's cadence matches `check_interval`
    // rather than polling the instant the task is spawned.
    interval.tick().await;

    loop {
        interval.tick().await;

        let event = poll_once(effector.as_ref(), &target_host, probe_port).await;
        log::debug!("[oracle] tick produced {:?}", event);
        if events_tx.send(event).is_err() {
            return;
        }
    }
}

async fn poll_once(effector: &dyn IpmiEffector, target_host: &str, probe_port: u16) -> LifecycleEvent {
    match effector.query_power().await {
        ObservedState::PoweredOff => LifecycleEvent::ObservedOff,
        ObservedState::Unknown => LifecycleEvent::ObservedUnknown,
        ObservedState::PoweredOn => match probe::probe_default(target_host, probe_port).await {
            ObservedReachability::Reachable => LifecycleEvent::ObservedReady,
            ObservedReachability::Unreachable => LifecycleEvent::ObservedStarting,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipmi::MockIpmiEffector;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn powered_off_yields_observed_off() {
        let effector = MockIpmiEffector::new(ObservedState::PoweredOff);
        let event = poll_once(&effector, "127.0.0.1", 1).await;
        assert!(matches!(event, LifecycleEvent::ObservedOff));
    }

    #[tokio::test]
    async fn powered_on_and_reachable_yields_observed_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });

        let effector = MockIpmiEffector::new(ObservedState::PoweredOn);
        let event = poll_once(&effector, "127.0.0.1", port).await;
        assert!(matches!(event, LifecycleEvent::ObservedReady));
    }

    #[tokio::test]
    async fn powered_on_and_unreachable_yields_observed_starting() {
        let effector = MockIpmiEffector::new(ObservedState::PoweredOn);
        let event = poll_once(&effector, "127.0.0.1", 1).await;
        assert!(matches!(event, LifecycleEvent::ObservedStarting));
    }

    #[tokio::test]
    async fn unknown_yields_observed_unknown() {
        let effector = MockIpmiEffector::new(ObservedState::Unknown);
        let event = poll_once(&effector, "127.0.0.1", 1).await;
        assert!(matches!(event, LifecycleEvent::ObservedUnknown));
    }
}
