//! Configuration loading

use crate::{Config, ConfigFormat};
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;
use tiller_core::{Error, Result};

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}")
        .map_err(|e| Error::Config(format!("invalid regex: {e}")))?;

    let mut result = String::new();
    let mut last_match = 0;

    for cap in re.captures_iter(content) {
        let (Some(full_match), Some(var)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var.as_str();
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match default_value {
                Some(default) => default.to_string(),
                None => {
                    return Err(Error::Config(format!(
                        "environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<Config> {
    let expanded_content = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("failed to parse JSON: {e}")))?,
    };

    Ok(config)
}

/// Load and validate a configuration file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML_CONFIG: &str = r#"
core:
  worker_processes: 4
  shutdown_timeout: "10s"
  pid: "/run/tiller.pid"

events:
  connections: 1024

listen:
  - addr: "127.0.0.1:8080"
  - addr: "127.0.0.1:8443"
    backlog: 128

zones:
  - name: "limits"
    size: 65536
    owner: "core"
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.core.worker_processes, 4);
        assert_eq!(config.events.connections, 1024);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[1].backlog, 128);
        assert_eq!(config.zones[0].size, 65536);
        assert!(!config.zones[0].noreuse);
    }

    #[test]
    fn test_load_toml() {
        let toml_config = r#"
[core]
worker_processes = 2

[events]
connections = 256

[[listen]]
addr = "127.0.0.1:9000"
"#;
        let config = load_from_str(toml_config, ConfigFormat::Toml).unwrap();
        assert_eq!(config.core.worker_processes, 2);
        assert_eq!(config.events.connections, 256);
    }

    #[test]
    fn test_invalid_yaml() {
        let invalid = "core: [yaml";
        assert!(load_from_str(invalid, ConfigFormat::Yaml).is_err());
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TILLER_TEST_PID", "/tmp/t.pid");

        let config = load_from_str(
            "core:\n  pid: \"${TILLER_TEST_PID}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.core.pid, std::path::PathBuf::from("/tmp/t.pid"));

        env::remove_var("TILLER_TEST_PID");
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("TILLER_UNDEFINED_VAR");

        let config = load_from_str(
            "core:\n  pid: \"${TILLER_UNDEFINED_VAR:-/run/default.pid}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(
            config.core.pid,
            std::path::PathBuf::from("/run/default.pid")
        );
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("TILLER_MISSING_VAR");

        let result = load_from_str("core:\n  pid: \"${TILLER_MISSING_VAR}\"\n", ConfigFormat::Yaml);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("TILLER_MISSING_VAR"));
    }
}
