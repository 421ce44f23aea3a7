//! Chain identifiers and the static chain registry.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::error::MuxError;

/// Numeric chain identifier, e.g. `1` for Ethereum mainnet.
///
/// Each chain has exactly one connection and one subscription registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ChainId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::str::FromStr for ChainId {
    type Err = MuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| MuxError::Config(format!("invalid chain id: {s}")))
    }
}

/// One entry of the chain registry: where that chain's event socket lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub id: ChainId,
    /// Human-readable name, e.g. "ethereum"
    pub name: String,
    /// WebSocket endpoint, e.g. "wss://ws.reservoir.tools"
    pub ws_url: String,
}

impl ChainConfig {
    pub fn new(id: u64, name: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            id: ChainId(id),
            name: name.into(),
            ws_url: ws_url.into(),
        }
    }

    /// Resolve the endpoint URL, appending `api_key` as a query parameter
    /// when one is configured.
    pub fn endpoint(&self, api_key: Option<&str>) -> Result<Url, MuxError> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| MuxError::Config(format!("chain {}: invalid ws_url: {e}", self.id)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(MuxError::Config(format!(
                "chain {}: ws_url must use ws:// or wss://, got {}://",
                self.id,
                url.scheme()
            )));
        }
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            url.query_pairs_mut().append_pair("api_key", key);
        }
        Ok(url)
    }
}

impl fmt::Display for ChainConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Built-in marketplace event endpoints.
pub mod chains {
    use super::ChainConfig;

    pub fn ethereum() -> ChainConfig { ChainConfig::new(1, "ethereum", "wss://ws.reservoir.tools") }
    pub fn polygon() -> ChainConfig { ChainConfig::new(137, "polygon", "wss://ws-polygon.reservoir.tools") }
    pub fn arbitrum() -> ChainConfig { ChainConfig::new(42161, "arbitrum", "wss://ws-arbitrum.reservoir.tools") }
    pub fn optimism() -> ChainConfig { ChainConfig::new(10, "optimism", "wss://ws-optimism.reservoir.tools") }
    pub fn base() -> ChainConfig { ChainConfig::new(8453, "base", "wss://ws-base.reservoir.tools") }
    pub fn zora() -> ChainConfig { ChainConfig::new(7777777, "zora", "wss://ws-zora.reservoir.tools") }

    /// Every built-in chain, mainnet first.
    pub fn all() -> Vec<ChainConfig> {
        vec![ethereum(), polygon(), arbitrum(), optimism(), base(), zora()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_id_display_and_parse() {
        assert_eq!(ChainId(1).to_string(), "1");
        assert_eq!("137".parse::<ChainId>().unwrap(), ChainId(137));
        assert!("mainnet".parse::<ChainId>().is_err());
    }

    #[test]
    fn chain_id_serde_is_a_bare_number() {
        let json = serde_json::to_string(&ChainId(8453)).unwrap();
        assert_eq!(json, "8453");
    }

    #[test]
    fn endpoint_appends_api_key() {
        let url = chains::ethereum().endpoint(Some("abc")).unwrap();
        assert_eq!(url.as_str(), "wss://ws.reservoir.tools/?api_key=abc");

        let bare = chains::ethereum().endpoint(None).unwrap();
        assert_eq!(bare.query(), None);
    }

    #[test]
    fn endpoint_rejects_http() {
        let cfg = ChainConfig::new(1, "bad", "https://api.reservoir.tools");
        assert!(matches!(cfg.endpoint(None), Err(MuxError::Config(_))));
    }

    #[test]
    fn built_in_ids_are_unique() {
        let mut ids: Vec<_> = chains::all().iter().map(|c| c.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), chains::all().len());
    }
}
