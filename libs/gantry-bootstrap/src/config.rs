use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Name of the environment variable selecting the active environment.
pub const ENV_VAR: &str = "APP_ENV";

/// Default environment when [`ENV_VAR`] is not set.
pub const DEFAULT_ENV: &str = "production";

/// Returns the active environment name, defaulting to `production`.
pub fn current_env() -> String {
    match std::env::var(ENV_VAR) {
        Ok(env) if !env.trim().is_empty() => env.trim().to_string(),
        _ => {
            tracing::info!("no {ENV_VAR} set, defaulting to `{DEFAULT_ENV}`");
            DEFAULT_ENV.to_string()
        }
    }
}

/// Main application configuration.
///
/// The `modules` and `extensions` sections are kept as raw JSON values;
/// the kernel owns their typed decoding so this crate stays decoupled
/// from kernel declaration types.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration; defaults apply if absent.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    /// Free-form framework options (error pages and friends).
    #[serde(default)]
    pub options: serde_json::Value,
    /// Globally declared extensions, in declaration order.
    #[serde(default)]
    pub extensions: Vec<serde_json::Value>,
    /// Module table: module name → module options.
    #[serde(default)]
    pub modules: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Request timeout in seconds; 0 disables the timeout layer.
    #[serde(default)]
    pub timeout_sec: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            timeout_sec: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Console log level: "trace", "debug", "info", "warn", "error" or "off".
    pub console_level: String,
    /// Optional log file path, relative to the working directory.
    #[serde(default)]
    pub file: Option<String>,
    /// Level for the file layer; falls back to `console_level`.
    #[serde(default)]
    pub file_level: Option<String>,
    /// How many rotated files to keep.
    #[serde(default)]
    pub max_backups: Option<usize>,
    /// Rotate after the file grows past this size in megabytes.
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            console_level: "info".to_string(),
            file: None,
            file_level: None,
            max_backups: Some(3),
            max_size_mb: Some(100),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: Some(LoggingConfig::default()),
            options: serde_json::Value::Null,
            extensions: Vec::new(),
            modules: BTreeMap::new(),
        }
    }
}

/// CLI arguments that flow into the config merge logic.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub port: Option<u16>,
    pub print_config: bool,
    pub verbose: u8,
}

impl AppConfig {
    /// Layered loading: defaults → YAML file → environment-directory YAML
    /// overlay (`<dir>/<env>/<file>`) → `APP__`-prefixed environment
    /// variables (`APP__SERVER__PORT=8080` maps to `server.port`).
    pub fn load_layered<P: AsRef<Path>>(config_path: P, env: &str) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path));

        // Environment-specific overlay next to the main file wins over it.
        if let (Some(dir), Some(file)) = (path.parent(), path.file_name()) {
            let env_path = dir.join(env).join(file);
            if env_path.is_file() {
                figment = figment.merge(Yaml::file(env_path));
            }
        }

        figment
            .merge(Env::prefixed("APP__").split("__"))
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    }

    /// Load from an optional path, falling back to pure defaults + env vars.
    pub fn load_or_default(config_path: Option<&Path>, env: &str) -> Result<Self> {
        use figment::{
            providers::{Env, Serialized},
            Figment,
        };

        match config_path {
            Some(path) => Self::load_layered(path, env),
            None => Figment::new()
                .merge(Serialized::defaults(AppConfig::default()))
                .merge(Env::prefixed("APP__").split("__"))
                .extract()
                .context("failed to load default configuration"),
        }
    }

    /// Apply CLI overrides on top of the layered result.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if args.verbose > 0 {
            let level = match args.verbose {
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            self.logging
                .get_or_insert_with(LoggingConfig::default)
                .console_level = level.to_string();
        }
    }

    /// Render the effective configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 3000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert!(cfg.modules.is_empty());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.yaml");
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(f, "server:\n  host: 0.0.0.0\n  port: 8087").expect("write");

        let cfg = AppConfig::load_layered(&path, "production").expect("load");
        assert_eq!(cfg.server.port, 8087);
        assert_eq!(cfg.server.host, "0.0.0.0");
    }

    #[test]
    fn environment_directory_overlay_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("app.yaml");
        std::fs::write(&path, "server:\n  host: 127.0.0.1\n  port: 8087\n").expect("write");
        std::fs::create_dir(dir.path().join("development")).expect("mkdir");
        std::fs::write(
            dir.path().join("development").join("app.yaml"),
            "server:\n  host: 127.0.0.1\n  port: 9999\n",
        )
        .expect("write env");

        let cfg = AppConfig::load_layered(&path, "development").expect("load");
        assert_eq!(cfg.server.port, 9999);

        let prod = AppConfig::load_layered(&path, "production").expect("load");
        assert_eq!(prod.server.port, 8087);
    }

    #[test]
    fn cli_overrides_apply_last() {
        let mut cfg = AppConfig::default();
        cfg.apply_cli_overrides(&CliArgs {
            port: Some(4444),
            verbose: 2,
            ..CliArgs::default()
        });
        assert_eq!(cfg.server.port, 4444);
        assert_eq!(
            cfg.logging.as_ref().map(|l| l.console_level.as_str()),
            Some("debug")
        );
    }
}
