use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use studyhub_connect::{ConnectSettings, ModePreference, WindowFeatures};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub connect: ConnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    pub timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub closed_check_interval_ms: u64,
    pub popup_width: u32,
    pub popup_height: u32,
    pub mode: ModePreference,
    pub restrictive: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api/oauth".to_string(),
            access_token: None,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            poll_interval_ms: 1000,
            closed_check_interval_ms: 500,
            popup_width: 500,
            popup_height: 600,
            mode: ModePreference::Auto,
            restrictive: false,
        }
    }
}

impl ConnectConfig {
    pub fn settings(&self) -> ConnectSettings {
        ConnectSettings {
            timeout: Duration::from_secs(self.timeout_seconds),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            closed_check_interval: Duration::from_millis(self.closed_check_interval_ms.max(1)),
            window: WindowFeatures {
                width: self.popup_width,
                height: self.popup_height,
            },
            mode: self.mode,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Using default config ({}): {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// `STUDYHUB_API_URL` and `STUDYHUB_ACCESS_TOKEN` win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("STUDYHUB_API_URL") {
            if !url.trim().is_empty() {
                self.backend.base_url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("STUDYHUB_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                self.backend.access_token = Some(token.trim().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            base_url = "https://api.studyhub.io/oauth"

            [connect]
            mode = "redirect"
            timeout_seconds = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.base_url, "https://api.studyhub.io/oauth");
        assert_eq!(config.backend.access_token, None);
        assert_eq!(config.connect.mode, ModePreference::Redirect);
        assert_eq!(config.connect.poll_interval_ms, 1000);

        let settings = config.connect.settings();
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.closed_check_interval, Duration::from_millis(500));
        assert_eq!(settings.window, WindowFeatures::default());
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let config = Config::load_or_default(Path::new("/nonexistent/studyhub/config.toml"));
        assert_eq!(config.connect.timeout_seconds, 120);
        assert_eq!(config.connect.mode, ModePreference::Auto);
    }
}
