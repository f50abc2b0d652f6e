use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Popup,
    /// Full navigation to the authorization URL. Terminal for the current
    /// page; completion comes back through the callback route.
    Redirect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModePreference {
    #[default]
    Auto,
    Popup,
    Redirect,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeEnvironment {
    pub host: String,
    pub restrictive: bool,
}

impl RuntimeEnvironment {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            restrictive: false,
        }
    }

    pub fn restrictive(mut self, restrictive: bool) -> Self {
        self.restrictive = restrictive;
        self
    }

    fn is_dev_host(&self) -> bool {
        let host = self
            .host
            .trim()
            .trim_start_matches('[')
            .split(']')
            .next()
            .unwrap_or_default();
        // strip a trailing port unless the host is a bare IPv6 literal
        let host = match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
            _ => host,
        };
        let host = host.to_ascii_lowercase();
        host == "localhost"
            || host == "127.0.0.1"
            || host == "::1"
            || host == "0.0.0.0"
            || host.ends_with(".localhost")
            || host.ends_with(".local")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ModeSelector {
    preference: ModePreference,
}

impl ModeSelector {
    pub fn new(preference: ModePreference) -> Self {
        Self { preference }
    }

    pub fn select(&self, env: &RuntimeEnvironment) -> LaunchMode {
        match self.preference {
            ModePreference::Popup => LaunchMode::Popup,
            ModePreference::Redirect => LaunchMode::Redirect,
            ModePreference::Auto if env.restrictive || env.is_dev_host() => LaunchMode::Redirect,
            ModePreference::Auto => LaunchMode::Popup,
        }
    }
}
