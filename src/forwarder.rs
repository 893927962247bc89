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
//! The connection forwarder (C8): dials the backend and pumps bytes between it and the client,
//! byte-transparent in both directions.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::error::IntentFailure;
use crate::idle::ActivityStamp;
use crate::queue::{AdmissionQueue, PendingIntent};

/// Tracks every in-flight Forwarder task, so the lifecycle machine (C4) and the supervisor (C9)
/// both have a real handle to act on instead of a fire-and-forget `tokio::spawn`.
///
/// C4 uses [`ForwarderRegistry::abort_all`] to implement spec.md's "drop forwarders" on an
/// unexpected loss of backend power while READY; C9 uses [`ForwarderRegistry::drain`] to give
/// in-flight forwarders a grace period to finish on their own before the process exits.
#[derive(Default)]
pub struct ForwarderRegistry {
    set: Mutex<JoinSet<()>>,
}

impl ForwarderRegistry {
    pub fn new() -> Self { ForwarderRegistry { set: Mutex::new(JoinSet::new()) } }

    /// Spawns `task` and tracks it until it finishes, is aborted, or is drained.
    pub async fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.set.lock().await.spawn(task);
    }

    /// Aborts every still-running forwarder immediately, without waiting for it to finish.
    pub async fn abort_all(&self) {
        let mut set = self.set.lock().await;
        if set.is_empty() {
            return;
        }
        log::warn!("[forwarder] aborting {} forwarder(s)", set.len());
        set.abort_all();
        while set.join_next().await.is_some() {}
    }

    /// Waits up to `grace` for every still-running forwarder to finish on its own, then aborts
    /// whatever is left. Used by the supervisor on proxy shutdown.
    pub async fn drain(&self, grace: Duration) {
        let mut set = self.set.lock().await;
        if set.is_empty() {
            return;
        }
        log::info!("[forwarder] draining {} forwarder(s), grace period {:?}", set.len(), grace);

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    log::warn!("[forwarder] grace period elapsed with forwarders still running; aborting remainder");
                    set.abort_all();
                    while set.join_next().await.is_some() {}
                    break;
                },
                next = set.join_next() => {
                    if next.is_none() {
                        break;
                    }
                },
            }
        }
    }
}

/// Wraps a reader so the first successful read -- and only the first -- stamps the idle
/// accountant. Avoids a stamp on every single `poll_read`, which would otherwise dominate the
/// cost of an otherwise-idle long-lived connection.
#[pin_project]
struct StampOnFirstRead<R> {
    #[pin]
    inner: R,
    stamp: ActivityStamp,
    stamped: bool,
}

impl<R> StampOnFirstRead<R> {
    fn new(inner: R, stamp: ActivityStamp) -> Self { StampOnFirstRead { inner, stamp, stamped: false } }
}

impl<R: AsyncRead> AsyncRead for StampOnFirstRead<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if !*this.stamped && buf.filled().len() > before {
                this.stamp.stamp();
                *this.stamped = true;
            }
        }
        result
    }
}

/// Dials the backend for `intent` and, on success, pumps bytes bidirectionally until either side
/// closes. On dial failure, retries the hand-off exactly once (per the spec's STARTING-glitch
/// tolerance) before failing the intent with `BackendDialFailed`.
pub async fn spawn(mut intent: PendingIntent, target_host: Arc<str>, activity: ActivityStamp, queue: Arc<AdmissionQueue>) {
    let remaining = intent.deadline_at.saturating_duration_since(std::time::Instant::now());
    let dial_timeout = std::cmp::min(Duration::from_secs(5), remaining);

    let backend_port = intent.mapping.backend_port;
    let dial = tokio::time::timeout(dial_timeout, TcpStream::connect((target_host.as_ref(), backend_port))).await;

    let backend = match dial {
        Ok(Ok(stream)) => stream,
        _ => {
            if !intent.retried && !intent.is_expired(std::time::Instant::now()) {
                log::debug!("[forwarder] dial to backend port {} failed; re-enqueuing once", backend_port);
                intent.retried = true;
                if let Err((intent, _)) = queue.offer(intent).await {
                    intent.fail(IntentFailure::BackendDialFailed).await;
                }
            } else {
                log::warn!("[forwarder] dial to backend port {} failed after retry", backend_port);
                intent.fail(IntentFailure::BackendDialFailed).await;
            }
            return;
        },
    };

    activity.stamp();
    pump(intent.client, backend, activity).await;
}

async fn pump(client: TcpStream, backend: TcpStream, activity: ActivityStamp) {
    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let mut client_read = StampOnFirstRead::new(client_read, activity.clone());
    let mut backend_read = StampOnFirstRead::new(backend_read, activity);
    let mut client_write = client_write;
    let mut backend_write = backend_write;

    let client_to_backend = async {
        let result = io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        result
    };
    let backend_to_client = async {
        let result = io::copy(&mut backend_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (c2b, b2c) = tokio::join!(client_to_backend, backend_to_client);
    if let Err(e) = c2b {
        log::debug!("[forwarder] client->backend pump ended: {}", e);
    }
    if let Err(e) = b2c {
        log::debug!("[forwarder] backend->client pump ended: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortMapping;
    use crate::idle::new_stamp;
    use crate::queue::AdmissionQueue;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_bytes_both_ways() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_port = backend_listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut conn, _) = backend_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.write_all(b"world").await.unwrap();
        });

        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let mut test_client = TcpStream::connect(client_addr).await.unwrap();
        let (accepted, _) = client_listener.accept().await.unwrap();

        let mapping = PortMapping { listen_port: 1, backend_port };
        let intent = PendingIntent::new(accepted, mapping, Duration::from_secs(5));
        let queue = Arc::new(AdmissionQueue::new(10));
        let stamp = new_stamp();

        let handle = tokio::spawn(spawn(intent, Arc::from("127.0.0.1"), stamp, queue));

        test_client.write_all(b"hello").await.unwrap();
        let mut response = [0u8; 5];
        test_client.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"world");

        let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn dial_failure_is_retried_then_fails() {
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let mut test_client = TcpStream::connect(client_addr).await.unwrap();
        let (accepted, _) = client_listener.accept().await.unwrap();

        // Nothing listens on this port, so every dial attempt fails immediately.
        let unused_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused_listener.local_addr().unwrap().port();
        drop(unused_listener);

        let mapping = PortMapping { listen_port: 1, backend_port: dead_port };
        let intent = PendingIntent::new(accepted, mapping, Duration::from_secs(5));
        let queue = Arc::new(AdmissionQueue::new(10));
        let stamp = new_stamp();

        // First attempt: re-enqueued rather than failed.
        spawn(intent, Arc::from("127.0.0.1"), stamp.clone(), queue.clone()).await;
        assert_eq!(queue.len().await, 1);

        // Second attempt on the now-`retried` intent: fails outright.
        let (requeued, _) = queue.release_all().await;
        let intent = requeued.into_iter().next().unwrap();
        spawn(intent, Arc::from("127.0.0.1"), stamp, queue.clone()).await;
        assert_eq!(queue.len().await, 0);

        let mut buf = [0u8; 32];
        let n = test_client.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("502"));
    }

    #[tokio::test]
    async fn abort_all_stops_a_long_running_task() {
        let registry = ForwarderRegistry::new();
        let ran_to_completion = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran_to_completion.clone();
        registry
            .spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;

        registry.abort_all().await;

        assert!(!ran_to_completion.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_waits_for_quick_tasks_and_aborts_slow_ones() {
        let registry = ForwarderRegistry::new();
        let quick_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = quick_done.clone();
        registry
            .spawn(async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;

        let slow_finished = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = slow_finished.clone();
        registry
            .spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            })
            .await;

        registry.drain(Duration::from_millis(50)).await;

        assert!(quick_done.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!slow_finished.load(std::sync::atomic::Ordering::SeqCst));
    }
}
