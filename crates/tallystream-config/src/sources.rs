// Configuration source loading.
//
// Priority order:
// 1. Environment variables (TALLYSTREAM_* overrides)
// 2. Config file path from TALLYSTREAM_CONFIG
// 3. Inline config content from TALLYSTREAM_CONFIG_CONTENT
// 4. Default config files (./config.toml, ./.tallystream.toml)
// 5. Built-in defaults

use crate::RuntimeConfig;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

/// Load configuration from the standard source chain.
pub fn load_config() -> Result<RuntimeConfig> {
    let mut config = load_from_file()?.unwrap_or_default();
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific file path (for the CLI --config
/// flag). Errors if the file is missing or unparseable.
pub fn load_from_file_path(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config: RuntimeConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn load_from_file() -> Result<Option<RuntimeConfig>> {
    if let Ok(path) = env::var("TALLYSTREAM_CONFIG") {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;
        return Ok(Some(config));
    }

    if let Ok(content) = env::var("TALLYSTREAM_CONFIG_CONTENT") {
        let config: RuntimeConfig = toml::from_str(&content)
            .context("Failed to parse inline config from TALLYSTREAM_CONFIG_CONTENT")?;
        return Ok(Some(config));
    }

    for path in &["./config.toml", "./.tallystream.toml"] {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config: RuntimeConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok(Some(config));
        }
    }

    Ok(None)
}

fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    if let Ok(addr) = env::var("TALLYSTREAM_LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    if let Ok(name) = env::var("TALLYSTREAM_SERVER_NAME") {
        config.server.server_name = name;
    }
    if let Ok(level) = env::var("TALLYSTREAM_LOG_LEVEL") {
        config.server.log_level = level;
    }
    if let Ok(format) = env::var("TALLYSTREAM_LOG_FORMAT") {
        config.server.log_format = format
            .parse()
            .context("Invalid TALLYSTREAM_LOG_FORMAT value")?;
    }
    if let Ok(workers) = env::var("TALLYSTREAM_WORKERS") {
        config.server.worker_count = workers
            .parse()
            .context("Invalid TALLYSTREAM_WORKERS value")?;
    }
    if let Ok(path) = env::var("TALLYSTREAM_DUMP_PATH") {
        config.server.dump_path = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn explicit_path_round_trips() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [ingest]
            max_buffer_bytes = 1024
            buffer_idle_secs = 60
            "#
        )
        .unwrap();

        let config = load_from_file_path(file.path()).unwrap();
        assert_eq!(config.ingest.max_buffer_bytes, 1024);
        assert_eq!(config.server.worker_count, 1);
    }

    #[test]
    fn missing_explicit_path_errors() {
        assert!(load_from_file_path("/nonexistent/tallystream.toml").is_err());
    }
}
