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
use std::error::Error;
use std::fmt;

/// Configuration could not be loaded or failed validation. Fatal at startup.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid(reason) => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl Error for ConfigError {}

/// One of the configured listeners could not be bound. Fatal at startup.
#[derive(Debug)]
pub struct ListenerBindError {
    pub listen_port: u16,
    pub source: std::io::Error,
}

impl fmt::Display for ListenerBindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to bind listener on port {}: {}", self.listen_port, self.source)
    }
}

impl Error for ListenerBindError {
    fn source(&self) -> Option<&(dyn Error + 'static)> { Some(&self.source) }
}

/// Surfaced by a [`crate::queue::AdmissionQueue`] offer when the queue is already at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "admission queue is full") }
}

impl Error for QueueFull {}

/// Why a held client connection was never forwarded to the backend.
///
/// This is the terminal outcome for a [`crate::queue::PendingIntent`] that doesn't make it to a
/// [`crate::forwarder`] -- every variant here maps to one of the byte-exact responses in
/// [`crate::responses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentFailure {
    /// `request_timeout` elapsed before the backend became reachable.
    DeadlineExpired,
    /// `startup_timeout` elapsed before the backend reported `OBSERVED_READY`.
    BackendStartTimeout,
    /// The admission queue was already at `max_queue_size`.
    QueueFull,
    /// The backend refused or failed to accept a connection while READY.
    BackendDialFailed,
    /// The proxy is shutting down and will not start a new backend session.
    ShuttingDown,
}

impl fmt::Display for IntentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            IntentFailure::DeadlineExpired => "intent deadline expired",
            IntentFailure::BackendStartTimeout => "backend did not start in time",
            IntentFailure::QueueFull => "admission queue is full",
            IntentFailure::BackendDialFailed => "backend dial failed",
            IntentFailure::ShuttingDown => "proxy is shutting down",
        };
        write!(f, "{}", msg)
    }
}

impl Error for IntentFailure {}

/// A top-level runtime error that the supervisor treats as unrecoverable (process exit code 2).
///
/// Everything else -- dial failures, IPMI hiccups, expired intents -- is absorbed and handled
/// per the component tables; only a genuinely broken internal wiring (e.g. every sender for the
/// lifecycle event channel has been dropped) belongs here.
#[derive(Debug)]
pub enum RuntimeError {
    EventChannelClosed,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::EventChannelClosed => write!(f, "lifecycle event channel closed unexpectedly"),
        }
    }
}

impl Error for RuntimeError {}

/// Everything `supervisor::run`/`run_with_effector` can fail with: a fatal startup error (exit
/// code 1) or an unrecoverable runtime error (exit code 2).
#[derive(Debug)]
pub enum SupervisorError {
    ListenerBind(ListenerBindError),
    Runtime(RuntimeError),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::ListenerBind(e) => write!(f, "{}", e),
            SupervisorError::Runtime(e) => write!(f, "{}", e),
        }
    }
}

impl Error for SupervisorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SupervisorError::ListenerBind(e) => Some(e),
            SupervisorError::Runtime(e) => Some(e),
        }
    }
}

impl From<ListenerBindError> for SupervisorError {
    fn from(e: ListenerBindError) -> Self { SupervisorError::ListenerBind(e) }
}

impl From<RuntimeError> for SupervisorError {
    fn from(e: RuntimeError) -> Self { SupervisorError::Runtime(e) }
}
