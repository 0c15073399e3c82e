//! Typed configuration.
//!
//! Values come from an optional TOML file and from `EXECQ_*` environment
//! variables, the environment winning. Loads once at startup and fails fast
//! on missing or malformed values. Tokens are wrapped in
//! `secrecy::SecretString` to keep them out of logs.

pub mod secrets;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};
use crate::gate::MaintenanceWindow;
use crate::store::StorePaths;

/// Path of the OpenID token endpoint, relative to the API host.
pub const DEFAULT_AUTH_PATH: &str = "/auth/realms/shanoir-ng/protocol/openid-connect/token";

/// Environment variable, TOML section, TOML key.
const KEYS: &[(&str, &str, &str)] = &[
    ("EXECQ_API_URL", "api", "url"),
    ("EXECQ_AUTH_URL", "api", "auth_url"),
    ("EXECQ_CLIENT_ID", "api", "client_id"),
    ("EXECQ_ACCESS_TOKEN", "api", "access_token"),
    ("EXECQ_REFRESH_TOKEN", "api", "refresh_token"),
    ("EXECQ_REQUEST_TIMEOUT_SECS", "api", "timeout_secs"),
    ("EXECQ_MAX_THREAD", "execution", "max_thread"),
    ("EXECQ_PAUSE_BEGIN_HOUR", "execution", "server_reboot_beginning_hour"),
    ("EXECQ_PAUSE_END_HOUR", "execution", "server_reboot_ending_hour"),
    ("EXECQ_POLL_DEADLINE_SECS", "execution", "poll_deadline_secs"),
    ("EXECQ_WORK_DIR", "paths", "work_dir"),
    ("EXECQ_PROJECT", "paths", "project"),
    ("EXECQ_TRACKING_FILE", "paths", "tracking_file"),
    ("EXECQ_ERROR_FILE", "paths", "error_file"),
    ("OTEL_ENDPOINT", "telemetry", "otel_endpoint"),
    ("LOG_LEVEL", "telemetry", "log_level"),
];

#[derive(Debug)]
pub struct Config {
    /// Base URL of the platform REST API, e.g. `https://host/shanoir-ng`.
    pub api_url: String,
    /// Explicit token endpoint; derived from `api_url` when unset.
    pub auth_url: Option<String>,
    pub client_id: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: SecretString,
    pub request_timeout: Duration,
    pub max_thread: usize,
    pub pause_window: Option<MaintenanceWindow>,
    pub work_dir: PathBuf,
    pub project: String,
    pub tracking_file: PathBuf,
    pub error_file: PathBuf,
    pub poll_deadline: Option<Duration>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables only.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_sources(&Sources::default())
    }

    /// Load configuration from a TOML file, overridden by the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let sources = match file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read config file {}: {e}", path.display()))
                })?;
                Sources::from_toml(&text).map_err(|e| {
                    Error::Config(format!("bad config file {}: {e}", path.display()))
                })?
            }
            None => Sources::default(),
        };
        Self::from_sources(&sources)
    }

    fn from_sources(src: &Sources) -> Result<Self> {
        let project = src.get("EXECQ_PROJECT").unwrap_or_else(|| "execq".to_string());

        let max_thread: usize = src.parsed("EXECQ_MAX_THREAD")?.unwrap_or(4);
        if max_thread == 0 {
            return Err(Error::Config("EXECQ_MAX_THREAD must be at least 1".to_string()));
        }

        let pause_window = match (
            src.parsed::<u32>("EXECQ_PAUSE_BEGIN_HOUR")?,
            src.parsed::<u32>("EXECQ_PAUSE_END_HOUR")?,
        ) {
            (Some(begin), Some(end)) => Some(MaintenanceWindow::new(begin, end)?),
            (None, None) => None,
            _ => {
                return Err(Error::Config(
                    "EXECQ_PAUSE_BEGIN_HOUR and EXECQ_PAUSE_END_HOUR must be set together"
                        .to_string(),
                ));
            }
        };

        let api_url = src.required("EXECQ_API_URL")?;
        origin(&api_url)?;

        Ok(Self {
            api_url,
            auth_url: src.get("EXECQ_AUTH_URL"),
            client_id: src
                .get("EXECQ_CLIENT_ID")
                .unwrap_or_else(|| "shanoir-uploader".to_string()),
            access_token: src.get("EXECQ_ACCESS_TOKEN").map(SecretString::from),
            refresh_token: SecretString::from(src.required("EXECQ_REFRESH_TOKEN")?),
            request_timeout: Duration::from_secs(
                src.parsed("EXECQ_REQUEST_TIMEOUT_SECS")?.unwrap_or(30),
            ),
            max_thread,
            pause_window,
            work_dir: src
                .get("EXECQ_WORK_DIR")
                .map_or_else(|| PathBuf::from("resources/WIP_files"), PathBuf::from),
            tracking_file: src.get("EXECQ_TRACKING_FILE").map_or_else(
                || PathBuf::from(format!("resources/tracking_files/{project}.json")),
                PathBuf::from,
            ),
            error_file: src.get("EXECQ_ERROR_FILE").map_or_else(
                || PathBuf::from(format!("resources/errors/{project}.txt")),
                PathBuf::from,
            ),
            poll_deadline: src
                .parsed("EXECQ_POLL_DEADLINE_SECS")?
                .map(Duration::from_secs),
            otel_endpoint: src.get("OTEL_ENDPOINT"),
            log_level: src.get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            project,
        })
    }

    /// Token endpoint: the explicit one, or the default realm path on the API host.
    pub fn auth_url(&self) -> Result<String> {
        match &self.auth_url {
            Some(url) => Ok(url.clone()),
            None => Ok(format!("{}{DEFAULT_AUTH_PATH}", origin(&self.api_url)?)),
        }
    }

    pub fn store_paths(&self) -> StorePaths {
        StorePaths::for_project(&self.work_dir, &self.project)
    }
}

/// `scheme://host[:port]` part of a URL, default ports omitted.
fn origin(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Config(format!("EXECQ_API_URL={url:?} is not a valid URL: {e}")))?;
    if !parsed.has_host() {
        return Err(Error::Config(format!("EXECQ_API_URL={url:?} has no host")));
    }
    Ok(parsed.origin().ascii_serialization())
}

/// Lookup across the environment and an optional file, environment first.
#[derive(Debug, Default)]
struct Sources {
    file: HashMap<&'static str, String>,
}

impl Sources {
    fn from_toml(text: &str) -> std::result::Result<Self, toml::de::Error> {
        let table: toml::Table = toml::from_str(text)?;
        let mut file = HashMap::new();
        for (var, section, key) in KEYS {
            let value = table
                .get(*section)
                .and_then(|s| s.get(*key))
                .and_then(|v| match v {
                    toml::Value::String(s) => Some(s.clone()),
                    toml::Value::Integer(i) => Some(i.to_string()),
                    toml::Value::Float(f) => Some(f.to_string()),
                    toml::Value::Boolean(b) => Some(b.to_string()),
                    _ => None,
                });
            if let Some(value) = value {
                file.insert(*var, value);
            }
        }
        Ok(Self { file })
    }

    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.file.get(name).cloned())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.get(name)
            .ok_or_else(|| Error::Config(format!("required setting {name} is not set")))
    }

    fn parsed<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_strips_path_query_and_fragment() {
        let cases = [
            ("https://shanoir.example.org/shanoir-ng", "https://shanoir.example.org"),
            ("http://localhost:8080/", "http://localhost:8080"),
            ("http://localhost:8080", "http://localhost:8080"),
            ("https://host?x=1", "https://host"),
            ("https://host#top", "https://host"),
            ("https://host:443/api?x=1", "https://host"),
        ];
        for (url, expected) in cases {
            assert_eq!(origin(url).unwrap(), expected, "{url}");
        }
    }

    #[test]
    fn origin_rejects_unparseable_urls() {
        assert!(matches!(origin("shanoir.example.org/api"), Err(Error::Config(_))));
        assert!(matches!(origin("not a url"), Err(Error::Config(_))));
        assert!(matches!(origin("mailto:ops@example.org"), Err(Error::Config(_))));
    }

    #[test]
    fn toml_sections_map_to_settings() {
        let src = Sources::from_toml(
            r#"
            [api]
            url = "https://host/api"
            timeout_secs = 12

            [execution]
            max_thread = 3
            "#,
        )
        .unwrap();
        assert_eq!(src.file.get("EXECQ_API_URL").map(String::as_str), Some("https://host/api"));
        assert_eq!(src.file.get("EXECQ_REQUEST_TIMEOUT_SECS").map(String::as_str), Some("12"));
        assert_eq!(src.file.get("EXECQ_MAX_THREAD").map(String::as_str), Some("3"));
        assert!(!src.file.contains_key("EXECQ_PROJECT"));
    }
}
