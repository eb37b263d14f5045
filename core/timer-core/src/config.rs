//! Runtime configuration (`config.toml`).
//!
//! Every field has a default, so a missing file or a partial file is valid.
//!
//! ```toml
//! [engine]
//! max_elapsed_days = 30
//!
//! [phases]
//! known = ["Novo", "Triagem", "Backlog"]
//!
//! [observer]
//! retry_delays_ms = [3000, 5000, 10000, 15000, 30000, 60000]
//! debounce_ms = 500
//!
//! [lifecycle]
//! teardown_timeout_ms = 2000
//!
//! [export]
//! dir = "/home/me/reports"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;

use crate::error::{Result, TimerError};

pub const DEFAULT_MAX_ELAPSED_DAYS: i64 = 30;
/// Upper bound applied to `max_elapsed_days`; larger values mean "never discard".
pub const MAX_ELAPSED_DAYS_CEILING: i64 = 36_500;
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 6] = [3_000, 5_000, 10_000, 15_000, 30_000, 60_000];
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 2_000;

/// Pipeline columns of the HubSpot board, in board order.
pub const DEFAULT_KNOWN_PHASES: [&str; 12] = [
    "Novo",
    "Triagem",
    "Backlog",
    "Descoberta e Ideação",
    "Desenvolvimento",
    "Preenchimento de RFP",
    "Validação Inicial",
    "Apresentação",
    "Refinamento e Consolidação",
    "Impedidos",
    "Entregues",
    "Dispensados",
];

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub phases: PhasesConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Elapsed intervals longer than this are treated as broken timestamps.
    pub max_elapsed_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_elapsed_days: DEFAULT_MAX_ELAPSED_DAYS,
        }
    }
}

impl EngineConfig {
    pub fn max_elapsed(&self) -> Duration {
        Duration::days(self.max_elapsed_days.clamp(1, MAX_ELAPSED_DAYS_CEILING))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PhasesConfig {
    pub known: Vec<String>,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            known: DEFAULT_KNOWN_PHASES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Read by processes that embed a [`crate::PhaseObserver`]; the daemon
/// takes facts over the socket and ignores this section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ObserverConfig {
    pub retry_delays_ms: Vec<u64>,
    pub debounce_ms: u64,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            retry_delays_ms: DEFAULT_RETRY_DELAYS_MS.to_vec(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl ObserverConfig {
    pub fn retry_delays(&self) -> Vec<StdDuration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| StdDuration::from_millis(*ms))
            .collect()
    }

    pub fn debounce(&self) -> StdDuration {
        StdDuration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    pub teardown_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT_MS,
        }
    }
}

impl LifecycleConfig {
    pub fn teardown_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.teardown_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    /// Directory for saved reports; the storage default applies when unset.
    pub dir: Option<PathBuf>,
}

/// Loads the config file, returning defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<TimerConfig> {
    if !path.exists() {
        return Ok(TimerConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| TimerError::Io {
        context: format!("read config {}", path.display()),
        source,
    })?;
    parse_config(path, &content)
}

pub fn parse_config(path: &Path, content: &str) -> Result<TimerConfig> {
    toml::from_str::<TimerConfig>(content).map_err(|err| TimerError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
