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
//! End-to-end scenarios driven against the full supervisor: real loopback listeners, a mock
//! IPMI effector standing in for the BMC, and nothing else faked.
use std::sync::Arc;
use std::time::Duration;

use smartproxy::config::{BackendIdentity, Config, PortMapping};
use smartproxy::ipmi::{IpmiEffector, MockIpmiEffector, ObservedState};
use smartproxy::responses;
use smartproxy::supervisor;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn base_config(mappings: Vec<PortMapping>) -> Config {
    Config {
        proxy_host: "127.0.0.1".to_owned(),
        port_mappings: mappings,
        identity: BackendIdentity {
            target_host: "127.0.0.1".to_owned(),
            ipmi_host: "127.0.0.1".to_owned(),
            ipmi_user: "admin".to_owned(),
            ipmi_password: "secret".to_owned(),
            ipmi_path: "/usr/bin/ipmitool".to_owned(),
        },
        inactivity_timeout: Duration::from_secs(3600),
        startup_timeout: Duration::from_secs(300),
        check_interval: Duration::from_millis(20),
        max_queue_size: 100,
        request_timeout: Duration::from_secs(60),
    }
}

/// Reserves an ephemeral port without holding the listener open, so a `Config` can be built
/// before the supervisor binds its own listener on it.
async fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).await.is_ok() {
                    let _ = conn.write_all(b"pong").await;
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn cold_start_wakes_backend_and_forwards() {
    let backend_port = spawn_echo_backend().await;
    let listen_port = reserve_port().await;

    let config = base_config(vec![PortMapping { listen_port, backend_port }]);
    let mock = MockIpmiEffector::new(ObservedState::PoweredOff);
    let effector: Arc<dyn IpmiEffector> = Arc::new(mock.clone());

    let shutdown = CancellationToken::new();
    let shutdown_wait = shutdown.clone();
    let run_task = tokio::spawn(supervisor::run_with_effector(config, effector, async move {
        shutdown_wait.cancelled().await;
    }));

    // Give the listener a moment to come up before dialing it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut response = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut response)).await.unwrap().unwrap();
    assert_eq!(&response, b"pong");
    assert_eq!(mock.power_on_calls(), 1);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}

#[tokio::test]
async fn queue_overflow_returns_service_unavailable() {
    let listen_port = reserve_port().await;
    // Nothing answers this port, so the backend never reaches READY during the test.
    let unreachable_backend_port = reserve_port().await;

    let mut config = base_config(vec![PortMapping { listen_port, backend_port: unreachable_backend_port }]);
    config.max_queue_size = 2;

    let mock = MockIpmiEffector::new(ObservedState::PoweredOff);
    let effector: Arc<dyn IpmiEffector> = Arc::new(mock);

    let shutdown = CancellationToken::new();
    let shutdown_wait = shutdown.clone();
    let run_task = tokio::spawn(supervisor::run_with_effector(config, effector, async move {
        shutdown_wait.cancelled().await;
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut first = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut second = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut third = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(Duration::from_secs(1), third.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], responses::SERVICE_UNAVAILABLE);

    // The first two are still queued -- no response yet.
    let pending = tokio::time::timeout(Duration::from_millis(50), first.read(&mut buf)).await;
    assert!(pending.is_err());
    let pending = tokio::time::timeout(Duration::from_millis(50), second.read(&mut buf)).await;
    assert!(pending.is_err());

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}

#[tokio::test]
async fn startup_timeout_fails_queued_clients_with_gateway_timeout() {
    let listen_port = reserve_port().await;
    let unreachable_backend_port = reserve_port().await;

    let mut config = base_config(vec![PortMapping { listen_port, backend_port: unreachable_backend_port }]);
    config.startup_timeout = Duration::from_millis(60);
    config.check_interval = Duration::from_millis(10);

    let mock = MockIpmiEffector::new(ObservedState::PoweredOff);
    let effector: Arc<dyn IpmiEffector> = Arc::new(mock);

    let shutdown = CancellationToken::new();
    let shutdown_wait = shutdown.clone();
    let run_task = tokio::spawn(supervisor::run_with_effector(config, effector, async move {
        shutdown_wait.cancelled().await;
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    let mut buf = [0u8; 128];
    // One retry of the startup window is allowed before the failure surfaces, so allow roughly
    // two startup windows' worth of time.
    let n = tokio::time::timeout(Duration::from_millis(800), client.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], responses::GATEWAY_TIMEOUT);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}

#[tokio::test]
async fn idle_backend_is_put_back_to_sleep() {
    let backend_port = spawn_echo_backend().await;
    let listen_port = reserve_port().await;

    let mut config = base_config(vec![PortMapping { listen_port, backend_port }]);
    config.inactivity_timeout = Duration::from_millis(30);
    config.check_interval = Duration::from_millis(10);

    // Starts already on and reachable, so the machine goes straight to READY without anyone
    // connecting.
    let mock = MockIpmiEffector::new(ObservedState::PoweredOn);
    let mock_handle = mock.clone();
    let effector: Arc<dyn IpmiEffector> = Arc::new(mock);

    let shutdown = CancellationToken::new();
    let shutdown_wait = shutdown.clone();
    let run_task = tokio::spawn(supervisor::run_with_effector(config, effector, async move {
        shutdown_wait.cancelled().await;
    }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mock_handle.power_soft_calls(), 1);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}

#[tokio::test]
async fn multi_port_mappings_route_to_the_correct_backend() {
    let backend_a = spawn_echo_backend().await;
    let backend_b = spawn_echo_backend().await;
    let listen_a = reserve_port().await;
    let listen_b = reserve_port().await;

    let config = base_config(vec![
        PortMapping { listen_port: listen_a, backend_port: backend_a },
        PortMapping { listen_port: listen_b, backend_port: backend_b },
    ]);

    let mock = MockIpmiEffector::new(ObservedState::PoweredOff);
    let effector: Arc<dyn IpmiEffector> = Arc::new(mock);

    let shutdown = CancellationToken::new();
    let shutdown_wait = shutdown.clone();
    let run_task = tokio::spawn(supervisor::run_with_effector(config, effector, async move {
        shutdown_wait.cancelled().await;
    }));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut client_a = TcpStream::connect(("127.0.0.1", listen_a)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut client_b = TcpStream::connect(("127.0.0.1", listen_b)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut client_c = TcpStream::connect(("127.0.0.1", listen_a)).await.unwrap();

    client_a.write_all(b"ping").await.unwrap();
    client_b.write_all(b"ping").await.unwrap();
    client_c.write_all(b"ping").await.unwrap();

    let mut response = [0u8; 4];
    for client in [&mut client_a, &mut client_b, &mut client_c] {
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut response)).await.unwrap().unwrap();
        assert_eq!(&response, b"pong");
    }

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), run_task).await;
}
