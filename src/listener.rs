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
//! The port listener set (C7): one accept loop per configured [`PortMapping`], each one just
//! wrapping an accepted client into an [`IntentArrived`](crate::lifecycle::LifecycleEvent) and
//! handing it to the lifecycle machine.
use std::io;
use std::net::SocketAddr;

use net2::TcpBuilder;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::PortMapping;
use crate::error::ListenerBindError;
use crate::lifecycle::LifecycleEvent;
use crate::queue::PendingIntent;

/// Binds a listener for every configured port mapping.
///
/// Configured for `SO_REUSEADDR`/`SO_REUSEPORT` before being handed to tokio, so a restart
/// doesn't have to wait out `TIME_WAIT` on the previous process's sockets.
pub fn bind_all(proxy_host: &str, mappings: &[PortMapping]) -> Result<Vec<(PortMapping, TcpListener)>, ListenerBindError> {
    let mut listeners = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let listener = bind_one_mapping(proxy_host, mapping)?;
        listeners.push((*mapping, listener));
    }
    Ok(listeners)
}

fn bind_one_mapping(proxy_host: &str, mapping: &PortMapping) -> Result<TcpListener, ListenerBindError> {
    let to_err = |source: io::Error| ListenerBindError { listen_port: mapping.listen_port, source };

    let addr: SocketAddr = format!("{}:{}", proxy_host, mapping.listen_port)
        .parse()
        .map_err(|e| to_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    bind_one(addr).map_err(to_err)
}

fn bind_one(addr: SocketAddr) -> io::Result<TcpListener> {
    let builder = match addr {
        SocketAddr::V4(_) => TcpBuilder::new_v4()?,
        SocketAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    configure_builder(&builder)?;
    builder.reuse_address(true)?;
    builder.bind(addr)?;
    let std_listener = builder.listen(1024)?;
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

#[cfg(unix)]
fn configure_builder(builder: &TcpBuilder) -> io::Result<()> {
    use net2::unix::UnixTcpBuilderExt;

    builder.reuse_port(true)?;
    Ok(())
}

#[cfg(windows)]
fn configure_builder(_builder: &TcpBuilder) -> io::Result<()> { Ok(()) }

/// Runs the accept loop for a single listener until `shutdown` fires.
///
/// Each accepted connection becomes a [`PendingIntent`] and is handed straight to the lifecycle
/// machine as a [`LifecycleEvent::IntentArrived`] -- this task never touches backend state
/// itself.
const ACCEPT_BACKOFF_CAP: std::time::Duration = std::time::Duration::from_secs(1);

pub async fn accept_loop(
    mapping: PortMapping, listener: TcpListener, request_timeout: std::time::Duration,
    events_tx: UnboundedSender<LifecycleEvent>, shutdown: CancellationToken,
) {
    log::info!("[listener] accepting on port {} -> backend port {}", mapping.listen_port, mapping.backend_port);
    let mut backoff = std::time::Duration::from_millis(10);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::info!("[listener] port {} shutting down", mapping.listen_port);
                return;
            },
            accepted = listener.accept() => {
                match accepted {
                    Ok((client, peer)) => {
                        backoff = std::time::Duration::from_millis(10);
                        log::debug!("[listener] accepted {} on port {}", peer, mapping.listen_port);
                        let intent = PendingIntent::new(client, mapping, request_timeout);
                        if events_tx.send(LifecycleEvent::IntentArrived(intent)).is_err() {
                            log::error!("[listener] lifecycle machine gone; stopping accept loop for port {}", mapping.listen_port);
                            return;
                        }
                    },
                    Err(e) => {
                        log::warn!("[listener] accept error on port {}: {} (retrying in {:?})", mapping.listen_port, e, backoff);
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {},
                        }
                        backoff = std::cmp::min(backoff * 2, ACCEPT_BACKOFF_CAP);
                    },
                }
            },
        }
    }
}
