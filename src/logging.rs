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
//! Wires up `slog` as the process-wide logging backend.
//!
//! The rest of the crate logs through the plain `log` facade (`debug!`, `info!`, etc); this
//! module installs a `slog`-backed drain and bridges `log` into it via `slog-stdlog`, so call
//! sites don't need to know or care which backend ends up rendering the line.
use slog::{o, Drain};

/// Installs the global logger. Must be called exactly once, before any other component logs.
///
/// Returns the `slog::Logger` guard; it must be kept alive for the lifetime of the process (the
/// async drain's worker thread shuts down when it is dropped).
pub fn init() -> slog_scope::GlobalLoggerGuard {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let logger = slog::Logger::root(drain, o!("component" => "smartproxy"));

    let guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init().expect("failed to bridge log crate into slog");
    guard
}
