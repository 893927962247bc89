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

//! A reverse proxy that keeps a single backend host asleep until someone actually needs it.
//!
//! The proxy fuses request forwarding with out-of-band IPMI power control: while the backend is
//! off, connecting clients are held in a bounded queue instead of being refused, the backend is
//! powered on, and the queue is drained the moment the backend answers. After a period of
//! inactivity the backend is put back to sleep.

pub mod config;
pub mod error;
pub mod forwarder;
pub mod idle;
pub mod ipmi;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod oracle;
pub mod probe;
pub mod queue;
pub mod responses;
pub mod supervisor;
