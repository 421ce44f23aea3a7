//! Multiplexer configuration.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::backoff::ReconnectConfig;
use crate::chain::{chains, ChainConfig, ChainId};
use crate::error::MuxError;

/// Top-level configuration: the static chain registry plus transport knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Chains enumerated at startup; never changed at runtime.
    #[serde(default = "chains::all")]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Appended to every endpoint as `?api_key=...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            chains: chains::all(),
            reconnect: ReconnectConfig::default(),
            api_key: None,
        }
    }
}

impl MuxConfig {
    /// Create a config for a single chain.
    pub fn single_chain(chain: ChainConfig) -> Self {
        Self {
            chains: vec![chain],
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, MuxError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, MuxError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn chain(&self, id: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == id)
    }

    pub fn validate(&self) -> Result<(), MuxError> {
        if self.chains.is_empty() {
            return Err(MuxError::Config("no chains configured".into()));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.id) {
                return Err(MuxError::Config(format!("duplicate chain id {}", chain.id)));
            }
            chain.endpoint(self.api_key.as_deref())?;
        }
        let r = &self.reconnect;
        if r.initial_backoff_ms == 0 || r.max_backoff_ms < r.initial_backoff_ms {
            return Err(MuxError::Config(
                "reconnect backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms".into(),
            ));
        }
        if r.multiplier.is_nan() || r.multiplier < 1.0 {
            return Err(MuxError::Config("reconnect multiplier must be >= 1.0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let c = MuxConfig::from_json_str("{}").unwrap();
        assert_eq!(c.chains.len(), chains::all().len());
        assert_eq!(c.reconnect.max_backoff_ms, 30_000);
        assert!(c.api_key.is_none());
    }

    #[test]
    fn parses_custom_chain() {
        let c = MuxConfig::from_json_str(
            r#"{
                "chains": [{ "id": 1, "name": "local", "ws_url": "ws://127.0.0.1:9000" }],
                "reconnect": { "initial_backoff_ms": 50 },
                "api_key": "k"
            }"#,
        )
        .unwrap();
        assert_eq!(c.chains.len(), 1);
        assert_eq!(c.reconnect.initial_backoff_ms, 50);
        assert_eq!(c.reconnect.max_backoff_ms, 30_000);
        assert_eq!(c.chain(ChainId(1)).unwrap().name, "local");
        assert!(c.chain(ChainId(2)).is_none());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut c = MuxConfig::single_chain(chains::ethereum());
        c.chains.push(chains::ethereum());
        assert!(matches!(c.validate(), Err(MuxError::Config(_))));
    }

    #[test]
    fn rejects_bad_backoff() {
        let mut c = MuxConfig::default();
        c.reconnect.max_backoff_ms = 10;
        assert!(c.validate().is_err());

        let mut c = MuxConfig::default();
        c.reconnect.multiplier = 0.5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_non_ws_url() {
        let json = r#"{ "chains": [{ "id": 1, "name": "x", "ws_url": "http://x" }] }"#;
        assert!(MuxConfig::from_json_str(json).is_err());
    }
}
