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
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

fn default_proxy_host() -> String { "0.0.0.0".to_owned() }

fn default_port_mappings() -> Vec<(u16, u16)> { vec![(8080, 80)] }

fn default_inactivity_timeout() -> u32 { 3600 }

fn default_startup_timeout() -> u32 { 300 }

fn default_check_interval() -> u32 { 30 }

fn default_max_queue_size() -> u32 { 1000 }

fn default_request_timeout() -> u32 { 60 }

/// A single `(listen_port -> backend_port)` mapping.
///
/// Immutable once loaded. Listen ports are unique across the whole configuration; this is
/// enforced at load time rather than left as an unchecked assumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub listen_port: u16,
    pub backend_port: u16,
}

/// Everything needed to address and authenticate against the backend's BMC.
///
/// `ipmi_password` is deliberately excluded from the `Debug` output; nothing in this crate should
/// ever need to print it, and a custom impl makes sure an errant `{:?}` doesn't leak it into logs.
#[derive(Clone)]
pub struct BackendIdentity {
    pub target_host: String,
    pub ipmi_host: String,
    pub ipmi_user: String,
    pub ipmi_password: String,
    pub ipmi_path: String,
}

impl fmt::Debug for BackendIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendIdentity")
            .field("target_host", &self.target_host)
            .field("ipmi_host", &self.ipmi_host)
            .field("ipmi_user", &self.ipmi_user)
            .field("ipmi_password", &"<redacted>")
            .field("ipmi_path", &self.ipmi_path)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default = "default_proxy_host")]
    proxy_host: String,
    #[serde(default = "default_port_mappings")]
    port_mappings: Vec<(u16, u16)>,
    target_host: String,
    ipmi_host: String,
    ipmi_user: String,
    ipmi_password: String,
    ipmi_path: String,
    #[serde(default = "default_inactivity_timeout")]
    inactivity_timeout: u32,
    #[serde(default = "default_startup_timeout")]
    startup_timeout: u32,
    #[serde(default = "default_check_interval")]
    check_interval: u32,
    #[serde(default = "default_max_queue_size")]
    max_queue_size: u32,
    #[serde(default = "default_request_timeout")]
    request_timeout: u32,
}

/// The fully validated, process-lifetime configuration.
///
/// Loaded once at startup by [`Config::load`]; nothing in the rest of the crate mutates it.
#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_host: String,
    pub port_mappings: Vec<PortMapping>,
    pub identity: BackendIdentity,
    pub inactivity_timeout: Duration,
    pub startup_timeout: Duration,
    pub check_interval: Duration,
    pub max_queue_size: usize,
    pub request_timeout: Duration,
}

impl Config {
    /// Loads configuration from the JSON file at `path`.
    ///
    /// The `IPMITOOL` environment variable, when set, overrides `ipmi_path` -- this is the one
    /// override the test harness relies on to point at a fake `ipmitool` binary.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .build()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut raw: RawConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if let Ok(ipmitool_override) = std::env::var("IPMITOOL") {
            raw.ipmi_path = ipmitool_override;
        }

        Config::try_from(raw)
    }

    fn try_from(raw: RawConfig) -> Result<Config, ConfigError> {
        if raw.target_host.trim().is_empty() {
            return Err(ConfigError::Invalid("target_host must not be empty".to_owned()));
        }
        if raw.ipmi_host.trim().is_empty() {
            return Err(ConfigError::Invalid("ipmi_host must not be empty".to_owned()));
        }
        if raw.ipmi_user.trim().is_empty() {
            return Err(ConfigError::Invalid("ipmi_user must not be empty".to_owned()));
        }
        if raw.ipmi_path.trim().is_empty() {
            return Err(ConfigError::Invalid("ipmi_path must not be empty".to_owned()));
        }
        if raw.port_mappings.is_empty() {
            return Err(ConfigError::Invalid("port_mappings must not be empty".to_owned()));
        }
        if raw.max_queue_size == 0 {
            return Err(ConfigError::Invalid("max_queue_size must be greater than zero".to_owned()));
        }

        let mut seen = HashSet::new();
        let mut port_mappings = Vec::with_capacity(raw.port_mappings.len());
        for (listen_port, backend_port) in raw.port_mappings {
            if !seen.insert(listen_port) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate listen_port {} in port_mappings",
                    listen_port
                )));
            }
            port_mappings.push(PortMapping { listen_port, backend_port });
        }

        Ok(Config {
            proxy_host: raw.proxy_host,
            port_mappings,
            identity: BackendIdentity {
                target_host: raw.target_host,
                ipmi_host: raw.ipmi_host,
                ipmi_user: raw.ipmi_user,
                ipmi_password: raw.ipmi_password,
                ipmi_path: raw.ipmi_path,
            },
            inactivity_timeout: Duration::from_secs(raw.inactivity_timeout as u64),
            startup_timeout: Duration::from_secs(raw.startup_timeout as u64),
            check_interval: Duration::from_secs(raw.check_interval as u64),
            max_queue_size: raw.max_queue_size as usize,
            request_timeout: Duration::from_secs(raw.request_timeout as u64),
        })
    }
}
