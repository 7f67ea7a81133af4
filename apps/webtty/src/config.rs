use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::channel::DEFAULT_MAX_PENDING_BYTES;
use crate::transfer::DEFAULT_CHUNK_SIZE;

const DEFAULT_COLUMNS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// When the display is attached relative to bridge-message arrival.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeferralPolicy {
    /// Refresh, open and attach on start.
    #[default]
    Immediate,
    /// Refresh and open on start; attach once a bridge message supplies
    /// arguments. Output in the meantime is held by the channel.
    #[serde(alias = "gated-on-bridge-message")]
    GateAttach,
    /// Do nothing until a bridge message arrives, then refresh, open,
    /// inject and attach.
    GateAll,
}

impl DeferralPolicy {
    pub fn is_gated(self) -> bool {
        !matches!(self, DeferralPolicy::Immediate)
    }

    pub fn opens_on_start(self) -> bool {
        !matches!(self, DeferralPolicy::GateAll)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeferralPolicy::Immediate => "immediate",
            DeferralPolicy::GateAttach => "gate-attach",
            DeferralPolicy::GateAll => "gate-all",
        }
    }
}

impl fmt::Display for DeferralPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeferralPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(DeferralPolicy::Immediate),
            "gate-attach" | "gated" | "gated-on-bridge-message" => Ok(DeferralPolicy::GateAttach),
            "gate-all" => Ok(DeferralPolicy::GateAll),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown deferral policy '{0}' (expected immediate, gate-attach or gate-all)")]
    UnknownPolicy(String),
    #[error("session id cannot be empty")]
    EmptyId,
    #[error("terminal size must be non-zero, got {columns}x{rows}")]
    InvalidSize { columns: u16, rows: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayOptions {
    pub columns: u16,
    pub rows: u16,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            columns: DEFAULT_COLUMNS,
            rows: DEFAULT_ROWS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Display slot the surface is attached to.
    pub id: String,
    #[serde(default)]
    pub deferral_policy: DeferralPolicy,
    #[serde(default)]
    pub display: DisplayOptions,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_max_pending_bytes() -> usize {
    DEFAULT_MAX_PENDING_BYTES
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl SessionConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deferral_policy: DeferralPolicy::default(),
            display: DisplayOptions::default(),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_policy(mut self, policy: DeferralPolicy) -> Self {
        self.deferral_policy = policy;
        self
    }

    pub fn with_size(mut self, columns: u16, rows: u16) -> Self {
        self.display = DisplayOptions { columns, rows };
        self
    }

    pub fn with_max_pending_bytes(mut self, bytes: usize) -> Self {
        self.max_pending_bytes = bytes;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::EmptyId);
        }
        if self.display.columns == 0 || self.display.rows == 0 {
            return Err(ConfigError::InvalidSize {
                columns: self.display.columns,
                rows: self.display.rows,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_policy_names() {
        assert_eq!("immediate".parse(), Ok(DeferralPolicy::Immediate));
        assert_eq!("Gate-Attach".parse(), Ok(DeferralPolicy::GateAttach));
        assert_eq!(
            "gated-on-bridge-message".parse(),
            Ok(DeferralPolicy::GateAttach)
        );
        assert_eq!("gate-all".parse(), Ok(DeferralPolicy::GateAll));
        assert!(matches!(
            "later".parse::<DeferralPolicy>(),
            Err(ConfigError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn only_gate_all_defers_the_channel() {
        assert!(DeferralPolicy::Immediate.opens_on_start());
        assert!(DeferralPolicy::GateAttach.opens_on_start());
        assert!(!DeferralPolicy::GateAll.opens_on_start());
        assert!(!DeferralPolicy::Immediate.is_gated());
        assert!(DeferralPolicy::GateAll.is_gated());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"id":"terminal","deferral_policy":"gate-attach"}"#).unwrap();
        assert_eq!(config.deferral_policy, DeferralPolicy::GateAttach);
        assert_eq!(config.display, DisplayOptions::default());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_id_and_zero_size() {
        assert_eq!(SessionConfig::new(" ").validate(), Err(ConfigError::EmptyId));
        assert_eq!(
            SessionConfig::new("t").with_size(0, 24).validate(),
            Err(ConfigError::InvalidSize {
                columns: 0,
                rows: 24
            })
        );
    }
}
