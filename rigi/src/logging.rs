use std::{
    collections::HashMap,
    ops::Deref,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Deserializer};
use tracing::Level;

use crate::GenericConfig;

/// Default severity for a log target, registered by crates which know their
/// dependencies are noisy (e.g. the serial backend). Merged into the filter
/// string unless the configuration overrides the same target.
#[derive(Debug, Clone)]
pub struct LogTopic {
    pub target: &'static str,
    pub level: Level,
}

impl LogTopic {
    pub fn new(target: &'static str, level: Level) -> Self {
        Self { target, level }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    default_level: Level,
    structured: bool,
    filters: HashMap<String, Level>,
    file: Option<LogFileConfig>,
}

impl<'a> From<&'a GenericConfig> for LogConfig {
    fn from(value: &'a GenericConfig) -> Self {
        let p = value.get_or_default::<LogConfigPrivate>("log");
        Self {
            default_level: p.level.0,
            structured: p.structured,
            filters: p.filters.into_iter().map(|(k, v)| (k, v.0)).collect(),
            file: p.file,
        }
        .instrument_path(value)
    }
}

impl LogConfig {
    /// EnvFilter-compatible directive string, topics with explicit config
    /// winning over registered defaults.
    pub fn filter_string<'a>(&self, topics: impl Iterator<Item = &'a LogTopic>) -> String {
        let mut merged: HashMap<&str, Level> =
            topics.map(|t| (t.target, t.level)).collect();
        for (target, level) in &self.filters {
            merged.insert(target.as_str(), *level);
        }
        std::iter::once(self.default_level.to_string())
            .chain(
                merged
                    .into_iter()
                    .map(|(target, level)| format!("{target}={level}")),
            )
            .collect::<Vec<_>>()
            .join(",")
    }

    fn instrument_path(mut self, root: &GenericConfig) -> Self {
        if let Some(file_config) = self.file.as_mut() {
            file_config.path = root.instrument_relative(&file_config.path);
        }
        self
    }

    pub fn structured(&self) -> bool {
        self.structured
    }

    pub fn directory(&self) -> Option<&Path> {
        self.file.as_ref().map(|x| x.path.deref())
    }

    pub fn file(&self) -> Option<&LogFileConfig> {
        self.file.as_ref()
    }
}

#[derive(Debug, Clone)]
struct LevelWrapper(Level);

impl<'de> Deserialize<'de> for LevelWrapper {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Accepts both tracing and syslog-style names. Unknown levels fall
        // back to INFO instead of refusing to boot: a typo in the log
        // config must never take the broker down.
        let variant = String::deserialize(deserializer)?;
        let level = match variant.to_ascii_uppercase().as_str() {
            "WARNING" => Level::WARN,
            "CRITICAL" => Level::ERROR,
            other => Level::from_str(other).unwrap_or(Level::INFO),
        };
        Ok(LevelWrapper(level))
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct LogConfigPrivate {
    level: LevelWrapper,
    structured: bool,
    filters: HashMap<String, LevelWrapper>,
    file: Option<LogFileConfig>,
}

impl Default for LogConfigPrivate {
    fn default() -> Self {
        Self {
            level: LevelWrapper(Level::INFO),
            structured: false,
            filters: Default::default(),
            file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogFileConfig {
    pub path: PathBuf,
    pub max_bytes: u64,
    pub backups: usize,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            path: "./logs".into(),
            max_bytes: 10 * 1024 * 1024,
            backups: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deserialize_log_config() {
        let generic = GenericConfig::mock(json!({
            "log": {
                "level": "debug",
                "structured": true,
                "filters": {
                    "tokio": "warn"
                },
            }
        }));

        assert_eq!(
            LogConfig {
                default_level: Level::DEBUG,
                structured: true,
                filters: HashMap::from([("tokio".to_owned(), Level::WARN)]),
                file: None,
            },
            LogConfig::from(&generic)
        );
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        let generic = GenericConfig::mock(json!({ "log": { "level": "chatty" } }));
        let config = LogConfig::from(&generic);
        assert_eq!(config.default_level, Level::INFO);
    }

    #[test]
    fn level_parsing_is_case_insensitive() {
        let generic = GenericConfig::mock(json!({ "log": { "level": "WARNING" } }));
        assert_eq!(LogConfig::from(&generic).default_level, Level::WARN);

        let generic = GenericConfig::mock(json!({ "log": { "level": "error" } }));
        assert_eq!(LogConfig::from(&generic).default_level, Level::ERROR);
    }

    #[test]
    fn file_sink_defaults() {
        let generic = GenericConfig::mock(json!({ "log": { "file": { "path": "./mylog" } } }));
        let config = LogConfig::from(&generic);
        let file = config.file().unwrap();
        assert_eq!(file.max_bytes, 10 * 1024 * 1024);
        assert_eq!(file.backups, 5);
        assert_eq!(file.path, PathBuf::from("./test_data/mylog"));
    }

    #[test]
    fn config_filter_overrides_registered_topic() {
        let generic = GenericConfig::mock(json!({
            "log": { "level": "info", "filters": { "mio_serial": "debug" } }
        }));
        let topics = [LogTopic::new("mio_serial", Level::WARN)];
        let filter = LogConfig::from(&generic).filter_string(topics.iter());
        assert!(filter.starts_with("INFO"));
        assert!(filter.contains("mio_serial=DEBUG"));
    }
}
