use std::path::{Path, PathBuf};

use crate::config::types::RunletConfig;
use crate::error::{Result, RunletError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "runlet", "runlet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".runlet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<RunletConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // Return defaults if no config file exists
        return Ok(RunletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: RunletConfig =
        toml::from_str(&content).map_err(|e| RunletError::TomlParse(e.to_string()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/runlet.toml"))).unwrap();
        assert_eq!(config.sandbox.timeout_seconds, 30);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[autofix]\nmax_attempts = 3").unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.autofix.max_attempts, 3);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not [valid toml").unwrap();
        assert!(matches!(
            load_config(Some(file.path())),
            Err(RunletError::TomlParse(_))
        ));
    }
}
