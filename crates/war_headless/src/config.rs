//! Loading [`WarConfig`] files for the runner.

use std::path::Path;

use thiserror::Error;
use war_core::config::WarConfig;
use war_core::error::WarError;

/// Error type for config loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File not found.
    #[error("Config file not found: {0}")]
    FileNotFound(String),
    /// Failed to read file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    /// Failed to parse RON.
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] ron::error::SpannedError),
    /// Parsed, but a value would wedge a component.
    #[error("Invalid config: {0}")]
    Invalid(WarError),
}

/// Load and validate a config file; defaults when `path` is `None`.
pub fn load_config(path: Option<&Path>) -> Result<WarConfig, ConfigError> {
    let Some(path) = path else {
        return Ok(WarConfig::default());
    };
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }
    let contents = std::fs::read_to_string(path)?;
    let config: WarConfig = ron::from_str(&contents)?;
    config.validate().map_err(ConfigError::Invalid)?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Render a config as pretty RON.
pub fn to_ron(config: &WarConfig) -> Result<String, ron::Error> {
    ron::ser::to_string_pretty(config, ron::ser::PrettyConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_no_path_gives_defaults() {
        assert_eq!(load_config(None).unwrap(), WarConfig::default());
    }

    #[test]
    fn test_partial_file_overrides() {
        let file = write_temp("(battle: (tick_ms: 20), dispatcher: (workers: 2))");
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.battle.tick_ms, 20);
        assert_eq!(config.dispatcher.workers, 2);
        assert_eq!(config.units.inbox_capacity, 10);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.ron"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_parse_and_validation_errors() {
        let garbage = write_temp("(battle: (tick_ms: ");
        assert!(matches!(
            load_config(Some(garbage.path())),
            Err(ConfigError::ParseError(_))
        ));

        let zero = write_temp("(dispatcher: (workers: 0))");
        assert!(matches!(
            load_config(Some(zero.path())),
            Err(ConfigError::Invalid(WarError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn test_shipped_fast_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/fast.ron");
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.battle.tick_ms, 50);
        assert_eq!(config.dispatcher.workers, 8);
        assert!(config.resources.rate_limit.is_some());
    }

    #[test]
    fn test_ron_round_trip() {
        let mut config = WarConfig::default();
        config.resources.reservation_ttl_ms = 1234;
        let text = to_ron(&config).unwrap();
        let file = write_temp(&text);
        assert_eq!(load_config(Some(file.path())).unwrap(), config);
    }
}
