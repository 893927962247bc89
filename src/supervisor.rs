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
//! Wires every component (C1-C9) together into one running process and owns shutdown.
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{RuntimeError, SupervisorError};
use crate::forwarder::ForwarderRegistry;
use crate::idle;
use crate::ipmi::{IpmiEffector, ProcessIpmiEffector};
use crate::lifecycle::{LifecycleMachine, MachineConfig};
use crate::listener;
use crate::oracle;
use crate::queue::{self, AdmissionQueue};

/// Builds every long-running task for `config` and runs until shut down.
///
/// Shutdown is triggered by `shutdown_signal` resolving (normally `tokio::signal::ctrl_c`, a
/// test harness's own `CancellationToken`, or any other future the caller chooses). Every
/// listener's accept loop, the oracle, the idle timer, and the lifecycle machine all observe the
/// same token, so a single cancellation tears the whole process down cleanly.
pub async fn run(config: Config, shutdown_signal: impl std::future::Future<Output = ()>) -> Result<(), SupervisorError> {
    let effector: Arc<dyn IpmiEffector> = Arc::new(ProcessIpmiEffector::new(config.identity.clone()));
    run_with_effector(config, effector, shutdown_signal).await
}

/// As [`run`], but with the IPMI effector injected -- the seam integration tests use to swap in
/// a [`crate::ipmi::MockIpmiEffector`] without touching real hardware.
pub async fn run_with_effector(
    config: Config, effector: Arc<dyn IpmiEffector>, shutdown_signal: impl std::future::Future<Output = ()>,
) -> Result<(), SupervisorError> {
    let listeners = match listener::bind_all(&config.proxy_host, &config.port_mappings) {
        Ok(listeners) => listeners,
        Err(e) => {
            log::error!("[supervisor] failed to bind listeners: {}", e);
            return Err(e.into());
        },
    };

    let queue = Arc::new(AdmissionQueue::new(config.max_queue_size));
    let activity = idle::new_stamp();
    let target_host: Arc<str> = Arc::from(config.identity.target_host.as_str());
    let forwarders = Arc::new(ForwarderRegistry::new());

    let (machine, handle) = LifecycleMachine::new(MachineConfig {
        queue: queue.clone(),
        effector: effector.clone(),
        activity: activity.clone(),
        target_host: target_host.clone(),
        forwarders: forwarders.clone(),
        startup_timeout: config.startup_timeout,
        inactivity_timeout: config.inactivity_timeout,
    });

    let shutdown = CancellationToken::new();
    let lifecycle_task = tokio::spawn(machine.run());

    // Probing reachability against the first configured mapping's backend port is sufficient:
    // all mappings share one backend host, and C1 (power state) already distinguishes off/on.
    let probe_port = config.port_mappings[0].backend_port;
    let oracle_task = tokio::spawn(oracle::run(
        effector.clone(),
        config.identity.target_host.clone(),
        probe_port,
        config.check_interval,
        handle.events_tx.clone(),
    ));

    let idle_task = tokio::spawn(idle::run(
        activity,
        config.inactivity_timeout,
        handle.state_rx.clone(),
        handle.events_tx.clone(),
    ));

    let expiry_task = tokio::spawn(queue::run(queue.clone(), config.check_interval));

    let mut listener_tasks = Vec::with_capacity(listeners.len());
    for (mapping, tcp_listener) in listeners {
        let events_tx = handle.events_tx.clone();
        let shutdown = shutdown.clone();
        let request_timeout = config.request_timeout;
        listener_tasks.push(tokio::spawn(listener::accept_loop(mapping, tcp_listener, request_timeout, events_tx, shutdown)));
    }

    log::info!("[supervisor] smartproxy running with {} listener(s)", listener_tasks.len());

    shutdown_signal.await;
    log::info!("[supervisor] shutdown requested, draining");

    shutdown.cancel();
    for task in listener_tasks {
        let _ = task.await;
    }

    oracle_task.abort();
    idle_task.abort();
    expiry_task.abort();

    let send_result = handle.events_tx.send(crate::lifecycle::LifecycleEvent::Shutdown);
    let _ = lifecycle_task.await;

    // Give in-flight forwarders a chance to finish on their own before the process exits.
    forwarders.drain(config.request_timeout).await;

    if send_result.is_err() {
        log::error!("[supervisor] lifecycle event channel closed unexpectedly during shutdown");
        return Err(SupervisorError::Runtime(RuntimeError::EventChannelClosed));
    }

    log::info!("[supervisor] shutdown complete");
    Ok(())
}
