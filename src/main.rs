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
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use smartproxy::config::Config;
use smartproxy::error::SupervisorError;

#[derive(Parser)]
#[command(name = "smartproxy", about = "a TCP/HTTP reverse proxy that wakes and sleeps its backend over IPMI")]
struct Args {
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config_path: PathBuf,
}

fn main() -> ExitCode {
    let _guard = smartproxy::logging::init();

    let args = Args::parse();
    let config = match Config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("[main] invalid configuration: {}", e);
            return ExitCode::from(1);
        },
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("[main] failed to start async runtime: {}", e);
            return ExitCode::from(2);
        },
    };

    let result = runtime.block_on(smartproxy::supervisor::run(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("[main] failed to install ctrl-c handler: {}", e);
        }
    }));

    match result {
        Ok(()) => ExitCode::from(0),
        Err(e @ SupervisorError::ListenerBind(_)) => {
            log::error!("[main] {}", e);
            ExitCode::from(1)
        },
        Err(e @ SupervisorError::Runtime(_)) => {
            log::error!("[main] {}", e);
            ExitCode::from(2)
        },
    }
}
