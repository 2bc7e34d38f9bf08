// tracefork - Transaction Replay and Path Forensics
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! an optional TOML file (`~/.tracefork.toml` unless a path is given), and the
//! `TRACEFORK_RPC_URL` environment variable. Programmatic callers can skip
//! the file entirely and use the `with_*` builders.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// Environment variable overriding the node URL
pub const RPC_URL_ENV: &str = "TRACEFORK_RPC_URL";

/// Name of the per-user configuration file
const CONFIG_FILE_NAME: &str = ".tracefork.toml";

/// What a hooked replay does with the effects of a sub-call that failed
///
/// A reverted call has no effects on chain, but the tracing backends report
/// the writes it attempted. Folding them forward keeps the replay close to
/// what the tracer saw; skipping them keeps revert semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedCallPolicy {
    /// Fold the failed call's reported state changes into the overlay
    #[default]
    FoldState,
    /// Leave the overlay untouched after a failed call
    SkipState,
}

/// Configuration for the replay engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Node endpoint (`http(s)://` or `ws(s)://`)
    pub rpc_url: String,
    /// Endpoint used to redial oversized responses; derived from a WebSocket
    /// `rpc_url` when absent
    pub fallback_rpc_url: Option<String>,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Largest HTTP response body accepted before treating it as oversized
    pub max_response_bytes: Option<usize>,
    /// RPC namespace of the state-injection methods (`anvil`, `hardhat`)
    pub admin_namespace: String,
    /// Handling of failed sub-calls during hooked replays
    pub failed_call_policy: FailedCallPolicy,
    /// Gas limit given to synthetic calls; the node default when absent
    pub call_gas_limit: Option<u64>,
    /// Keep every executed instruction when the step-level backend is used
    pub record_instruction_path: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".into(),
            fallback_rpc_url: None,
            request_timeout_secs: 300,
            max_response_bytes: None,
            admin_namespace: "anvil".into(),
            failed_call_policy: FailedCallPolicy::default(),
            call_gas_limit: None,
            record_instruction_path: false,
        }
    }
}

impl EngineConfig {
    /// Set the node endpoint
    pub fn with_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = url.into();
        self
    }

    /// Set the endpoint used when a response is too large for the primary transport
    pub fn with_fallback_rpc_url(mut self, url: impl Into<String>) -> Self {
        self.fallback_rpc_url = Some(url.into());
        self
    }

    /// Set the per-request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Cap HTTP response bodies
    pub fn with_max_response_bytes(mut self, limit: usize) -> Self {
        self.max_response_bytes = Some(limit);
        self
    }

    /// Set the state-injection namespace
    pub fn with_admin_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.admin_namespace = namespace.into();
        self
    }

    /// Choose how failed sub-calls affect hooked replays
    pub fn with_failed_call_policy(mut self, policy: FailedCallPolicy) -> Self {
        self.failed_call_policy = policy;
        self
    }

    /// Give synthetic calls a fixed gas limit
    pub fn with_call_gas_limit(mut self, gas: u64) -> Self {
        self.call_gas_limit = Some(gas);
        self
    }

    /// Keep the raw instruction path from step-level traces
    pub fn with_instruction_path(mut self, record: bool) -> Self {
        self.record_instruction_path = record;
        self
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Endpoint to redial oversized responses on, if any
    pub fn effective_fallback_url(&self) -> Option<String> {
        if let Some(url) = &self.fallback_rpc_url {
            return Some(url.clone());
        }
        let http = ws_to_http(&self.rpc_url);
        (http != self.rpc_url).then_some(http)
    }

    /// Default configuration file path (`~/.tracefork.toml`)
    pub fn config_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| eyre::eyre!("Unable to determine home directory"))?;
        Ok(home.join(CONFIG_FILE_NAME))
    }

    /// Load from the default path, falling back to defaults when the file is absent
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default().apply_env());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit TOML file, then apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| "Failed to parse config file as TOML")?;
        info!("Loaded configuration from {}", path.display());
        Ok(config.apply_env())
    }

    /// Apply environment overrides
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(RPC_URL_ENV) {
            if !url.trim().is_empty() {
                debug!("Using node URL from {RPC_URL_ENV}");
                self.rpc_url = url;
            }
        }
        self
    }
}

/// Map a WebSocket URL onto its HTTP counterpart; other URLs pass through
pub fn ws_to_http(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}
