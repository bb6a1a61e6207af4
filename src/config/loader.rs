use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ServerConfig;

/// Load configuration from a file using the config crate, then apply the
/// process environment overrides (`FORWARDED_*`, `ALLOWED_ORIGINS`, `ALLOW_TRACE`).
/// Supports multiple formats: YAML, JSON, TOML, etc.
pub async fn load_config(config_path: &str) -> Result<ServerConfig> {
    let mut config = load_config_sync(config_path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    Ok(config)
}

/// Configuration with no file at all: defaults plus environment overrides.
pub fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config
}

/// Load configuration synchronously, without environment overrides
pub fn load_config_sync(config_path: &str) -> Result<ServerConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("ini") => FileFormat::Ini,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let server_config: ServerConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(server_config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_load_toml_config() {
        let toml_content = r#"
listen_addr = "127.0.0.1:8443"
server_name = "api.example"
allow_trace = true

[tls]
certificate_dir = "/etc/h2core"
credentials = ["api.example", "localhost"]

[forwarded]
required = true
skip_list = ["10.0.0.1"]

[cors]
allowed_origins = ["https://a.example"]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let config = load_config_sync(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8443");
        assert_eq!(config.server_name.as_deref(), Some("api.example"));
        assert!(config.allow_trace);
        assert_eq!(config.tls.credentials.len(), 2);
        assert!(config.forwarded.required);
        assert_eq!(config.forwarded.secret, None);
        assert_eq!(config.cors.allowed_origins, vec!["https://a.example"]);
        // sections left out fall back to defaults
        assert_eq!(config.negotiation.encodings, vec!["identity"]);
        assert_eq!(config.shutdown_timeout, "30s");
    }

    #[test]
    fn test_load_yaml_config() {
        let yaml_content = r#"
listen_addr: "127.0.0.1:9443"
tls:
  credentials: ["localhost"]
negotiation:
  media_types: ["application/json"]
  encodings: ["identity"]
  languages: ["en"]
"#;

        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = load_config_sync(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9443");
        assert_eq!(config.tls.certificate_dir, "./certificates");
        assert_eq!(config.negotiation.media_types, vec!["application/json"]);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(load_config_sync("/definitely/not/here.toml").is_err());
    }
}
