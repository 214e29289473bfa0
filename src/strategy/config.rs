//! Serializable strategy selection.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Batch, ChunkStrategy, Composite, Debounce, Immediate, Punctuation, WordBoundary};
use crate::error::TurnstileError;

/// Builds a fresh strategy for each connect cycle.
pub type StrategyFactory = Arc<dyn Fn() -> Box<dyn ChunkStrategy> + Send + Sync>;

/// Declarative choice of a built-in strategy, as found in config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StrategyConfig {
    #[default]
    Immediate,
    Punctuation,
    Batch {
        #[serde(default = "default_batch_size")]
        size: usize,
    },
    WordBoundary,
    Debounce {
        #[serde(default = "default_debounce_ms")]
        ms: u64,
    },
    Composite {
        strategies: Vec<StrategyConfig>,
    },
}

fn default_batch_size() -> usize {
    Batch::DEFAULT_SIZE
}

fn default_debounce_ms() -> u64 {
    Debounce::DEFAULT_DELAY.as_millis() as u64
}

impl StrategyConfig {
    pub fn build(&self) -> Box<dyn ChunkStrategy> {
        match self {
            Self::Immediate => Box::new(Immediate),
            Self::Punctuation => Box::new(Punctuation),
            Self::Batch { size } => Box::new(Batch::new(*size)),
            Self::WordBoundary => Box::new(WordBoundary),
            Self::Debounce { ms } => Box::new(Debounce::new(Duration::from_millis(*ms))),
            Self::Composite { strategies } => Box::new(Composite::new(
                strategies.iter().map(StrategyConfig::build).collect(),
            )),
        }
    }

    pub fn factory(&self) -> StrategyFactory {
        let config = self.clone();
        Arc::new(move || config.build())
    }
}

/// Compact text form used in environment variables:
/// `immediate`, `punctuation`, `word-boundary`, `batch[:n]`, `debounce[:ms]`,
/// and `+`-joined combinations such as `punctuation+batch:8`.
impl FromStr for StrategyConfig {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('+').map(str::trim).collect();
        if parts.len() > 1 {
            let strategies = parts
                .into_iter()
                .map(|part| part.parse::<StrategyConfig>())
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Composite { strategies });
        }

        let (name, arg) = match s.trim().split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s.trim(), None),
        };
        let number = |arg: Option<&str>, default: u64| -> Result<u64, TurnstileError> {
            arg.map(|a| {
                a.parse::<u64>().map_err(|_| {
                    TurnstileError::Configuration(format!("invalid strategy argument: {s}"))
                })
            })
            .unwrap_or(Ok(default))
        };

        match name {
            "immediate" => Ok(Self::Immediate),
            "punctuation" => Ok(Self::Punctuation),
            "word-boundary" => Ok(Self::WordBoundary),
            "batch" => Ok(Self::Batch {
                size: number(arg, default_batch_size() as u64)? as usize,
            }),
            "debounce" => Ok(Self::Debounce {
                ms: number(arg, default_debounce_ms())?,
            }),
            other => Err(TurnstileError::Configuration(format!(
                "unknown chunk strategy: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_forms() {
        assert_eq!("batch".parse::<StrategyConfig>().unwrap(), StrategyConfig::Batch { size: 5 });
        assert_eq!(
            "debounce:250".parse::<StrategyConfig>().unwrap(),
            StrategyConfig::Debounce { ms: 250 }
        );
        assert_eq!(
            "punctuation + batch:8".parse::<StrategyConfig>().unwrap(),
            StrategyConfig::Composite {
                strategies: vec![StrategyConfig::Punctuation, StrategyConfig::Batch { size: 8 }],
            }
        );
    }

    #[test]
    fn rejects_unknown_names_and_bad_arguments() {
        assert!("sometimes".parse::<StrategyConfig>().is_err());
        assert!("batch:many".parse::<StrategyConfig>().is_err());
    }

    #[test]
    fn deserializes_tagged_form_with_defaults() {
        let config: StrategyConfig = serde_json::from_str(r#"{"type":"debounce"}"#).unwrap();
        assert_eq!(config, StrategyConfig::Debounce { ms: 100 });
    }

    #[test]
    fn factory_builds_independent_instances() {
        let factory = StrategyConfig::Batch { size: 2 }.factory();
        let mut first = factory();
        assert!(!first.should_emit("a", ""));
        let mut second = factory();
        assert!(!second.should_emit("a", ""));
        assert!(first.should_emit("b", ""));
    }
}
