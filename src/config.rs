//! Store configuration
//!
//! ```
//! use wasmite::config::Config;
//! use wasmite::engine::EngineKind;
//!
//! let config = Config::from_json(r#"{ "engine": "interpreter", "max_call_depth": 64 }"#).unwrap();
//! assert_eq!(config.engine, EngineKind::Interpreter);
//! assert_eq!(config.max_call_depth, 64);
//! ```

use serde::{Deserialize, Serialize};

use crate::engine::EngineKind;

pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;
pub const DEFAULT_MAX_STACK_SLOTS: usize = 1 << 17;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Engine used by every module compiled in the store
    pub engine: EngineKind,
    /// Active guest frames allowed before `CallStackExhausted`
    pub max_call_depth: usize,
    /// Value slots (locals plus operands) allowed across all active frames
    pub max_stack_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            engine: EngineKind::host(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_stack_slots: DEFAULT_MAX_STACK_SLOTS,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Config, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_max_stack_slots(mut self, slots: usize) -> Self {
        self.max_stack_slots = slots;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.engine, EngineKind::host());
        assert_eq!(config.max_call_depth, DEFAULT_MAX_CALL_DEPTH);
        assert_eq!(Config::from_json("{}").unwrap(), config);
    }

    #[test]
    fn test_json_round_trip() {
        let config = Config::default()
            .with_engine(EngineKind::Interpreter)
            .with_max_stack_slots(4096);
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_rejects_unknown_fields_and_engines() {
        assert!(Config::from_json(r#"{ "fuel": 10 }"#).is_err());
        assert!(Config::from_json(r#"{ "engine": "llvm" }"#).is_err());
    }
}
