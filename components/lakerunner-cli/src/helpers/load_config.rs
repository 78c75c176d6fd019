// External crates
use config::{Config, Environment, File, Map};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::instrument;

/// Prefix of the environment variables read into [`Settings`]
/// (`LAKERUNNER_QUERY_URL`, `LAKERUNNER_API_KEY`, ...).
pub const ENV_PREFIX: &str = "LAKERUNNER";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Resolved client configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub query_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
}

/// Values supplied on the command line. They win over the environment,
/// which wins over the optional configuration file.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub config_file: Option<PathBuf>,
    pub query_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(
        "API endpoint is required: set LAKERUNNER_QUERY_URL environment variable or use --endpoint flag"
    )]
    MissingQueryUrl,
    #[error(
        "API key is required: set LAKERUNNER_API_KEY environment variable or use --api-key flag"
    )]
    MissingApiKey,
    #[error("request timeout must be greater than zero")]
    ZeroTimeout,
    #[error("failed to load configuration: {0}")]
    Config(#[from] config::ConfigError),
}

impl Settings {
    /// Load settings from the process environment.
    pub fn load(overrides: &SettingsOverrides) -> Result<Self, SettingsError> {
        Self::load_with_env(overrides, None)
    }

    /// Load settings, reading environment variables from `env` instead of the
    /// process environment when given.
    #[instrument(
        name = "settings_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load_with_env(
        overrides: &SettingsOverrides,
        env: Option<Map<String, String>>,
    ) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            .set_default("query_url", "")?
            .set_default("api_key", "")?
            .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?;

        if let Some(path) = &overrides.config_file {
            tracing::trace!(
                configuration_file_path = %path.display(),
                "Adding configuration file source"
            );
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }

        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .source(env),
            )
            .set_override_option("query_url", non_empty(&overrides.query_url))?
            .set_override_option("api_key", non_empty(&overrides.api_key))?
            .build()
            .inspect_err(|e| tracing::error!(error = %e, "Failed to build configuration"))?
            .try_deserialize()?;

        settings.validate()?;

        tracing::trace!(query_url = %settings.query_url, "Settings loaded successfully");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.query_url.trim().is_empty() {
            return Err(SettingsError::MissingQueryUrl);
        }
        if self.api_key.trim().is_empty() {
            return Err(SettingsError::MissingApiKey);
        }
        if self.request_timeout_secs == 0 {
            return Err(SettingsError::ZeroTimeout);
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn reads_environment() {
        let settings = Settings::load_with_env(
            &SettingsOverrides::default(),
            env(&[
                ("LAKERUNNER_QUERY_URL", "https://query.example.com"),
                ("LAKERUNNER_API_KEY", "secret"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.query_url, "https://query.example.com");
        assert_eq!(settings.api_key, "secret");
        assert_eq!(settings.request_timeout_secs, 60);
    }

    #[test]
    fn flags_win_over_environment() {
        let overrides = SettingsOverrides {
            query_url: Some("http://localhost:7101".into()),
            api_key: Some(String::new()),
            ..SettingsOverrides::default()
        };
        let settings = Settings::load_with_env(
            &overrides,
            env(&[
                ("LAKERUNNER_QUERY_URL", "https://query.example.com"),
                ("LAKERUNNER_API_KEY", "from-env"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.query_url, "http://localhost:7101");
        // An empty flag does not mask the environment.
        assert_eq!(settings.api_key, "from-env");
    }

    #[test]
    fn missing_values_are_reported() {
        let err = Settings::load_with_env(&SettingsOverrides::default(), env(&[])).unwrap_err();
        assert!(matches!(err, SettingsError::MissingQueryUrl));

        let err = Settings::load_with_env(
            &SettingsOverrides::default(),
            env(&[("LAKERUNNER_QUERY_URL", "http://x")]),
        )
        .unwrap_err();
        assert!(matches!(err, SettingsError::MissingApiKey));
        assert!(err.to_string().contains("--api-key"));
    }

    #[test]
    fn config_file_is_lowest_precedence() {
        let path = std::env::temp_dir().join(format!(
            "lakerunner-settings-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "query_url = \"http://from-file\"\napi_key = \"file-key\"\nrequest_timeout_secs = 5"
        )
        .unwrap();

        let overrides = SettingsOverrides {
            config_file: Some(path.clone()),
            ..SettingsOverrides::default()
        };
        let settings =
            Settings::load_with_env(&overrides, env(&[("LAKERUNNER_API_KEY", "env-key")])).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.query_url, "http://from-file");
        assert_eq!(settings.api_key, "env-key");
        assert_eq!(settings.request_timeout_secs, 5);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let overrides = SettingsOverrides {
            config_file: Some(PathBuf::from("/nonexistent/lakerunner.toml")),
            ..SettingsOverrides::default()
        };
        let err = Settings::load_with_env(&overrides, env(&[])).unwrap_err();
        assert!(matches!(err, SettingsError::Config(_)));
    }
}
