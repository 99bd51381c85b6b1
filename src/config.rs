use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub static CONFIG: OnceCell<Config> = OnceCell::new();

const ENV_PREFIX: &str = "WEBSENTINEL_";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoggingConfig {
    pub websentinel: String,
    pub reqwest: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const WEBSENTINEL_LEVEL: &str = "info";
    const REQWEST_LEVEL: &str = "warn";

    fn default() -> Self {
        LoggingConfig {
            websentinel: Self::WEBSENTINEL_LEVEL.to_string(),
            reqwest: Self::REQWEST_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        Self::ensure_level("websentinel", &mut self.websentinel, Self::WEBSENTINEL_LEVEL);
        Self::ensure_level("reqwest", &mut self.reqwest, Self::REQWEST_LEVEL);
    }

    fn ensure_level(name: &str, level: &mut String, default: &str) {
        let original = level.clone();
        *level = level.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&level.as_str()) {
            eprintln!(
                "Config error: {} log level of '{}' is invalid - using default of '{}'",
                name, original, default
            );
            *level = default.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    const BASE_URL: &str = "http://127.0.0.1:5000";
    const REQUEST_TIMEOUT_SECS: u64 = 30;

    fn default() -> Self {
        ServerConfig {
            base_url: Self::BASE_URL.to_owned(),
            request_timeout_secs: Self::REQUEST_TIMEOUT_SECS,
        }
    }

    fn ensure_valid(&mut self) {
        let trimmed = self.base_url.trim().trim_end_matches('/').to_owned();
        match Url::parse(&trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => self.base_url = trimmed,
            _ => {
                eprintln!(
                    "Config error: server base_url of '{}' is invalid - using default of '{}'",
                    self.base_url,
                    Self::BASE_URL
                );
                self.base_url = Self::BASE_URL.to_owned();
            }
        }

        if self.request_timeout_secs == 0 {
            eprintln!(
                "Config error: request_timeout_secs must be positive - using default of {}",
                Self::REQUEST_TIMEOUT_SECS
            );
            self.request_timeout_secs = Self::REQUEST_TIMEOUT_SECS;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub progress_tick_ms: u64,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub grace_ms: u64,
    pub max_record_age_secs: u64,
    pub min_step: u8,
    pub max_step: u8,
}

impl ScanConfig {
    const PROGRESS_TICK_MS: u64 = 1_000;
    const POLL_INTERVAL_MS: u64 = 5_000;
    const TIMEOUT_SECS: u64 = 30 * 60;
    const GRACE_MS: u64 = 2_000;
    const MAX_RECORD_AGE_SECS: u64 = 6 * 60 * 60;
    const MIN_STEP: u8 = 1;
    const MAX_STEP: u8 = 3;

    fn default() -> Self {
        ScanConfig {
            progress_tick_ms: Self::PROGRESS_TICK_MS,
            poll_interval_ms: Self::POLL_INTERVAL_MS,
            timeout_secs: Self::TIMEOUT_SECS,
            grace_ms: Self::GRACE_MS,
            max_record_age_secs: Self::MAX_RECORD_AGE_SECS,
            min_step: Self::MIN_STEP,
            max_step: Self::MAX_STEP,
        }
    }

    fn ensure_valid(&mut self) {
        // Zero periods would spin the timers
        Self::ensure_positive("progress_tick_ms", &mut self.progress_tick_ms, Self::PROGRESS_TICK_MS);
        Self::ensure_positive("poll_interval_ms", &mut self.poll_interval_ms, Self::POLL_INTERVAL_MS);
        Self::ensure_positive("timeout_secs", &mut self.timeout_secs, Self::TIMEOUT_SECS);
        Self::ensure_positive(
            "max_record_age_secs",
            &mut self.max_record_age_secs,
            Self::MAX_RECORD_AGE_SECS,
        );

        if self.min_step == 0 || self.min_step > self.max_step || self.max_step > 90 {
            eprintln!(
                "Config error: step range {}..={} is invalid - using default of {}..={}",
                self.min_step,
                self.max_step,
                Self::MIN_STEP,
                Self::MAX_STEP
            );
            self.min_step = Self::MIN_STEP;
            self.max_step = Self::MAX_STEP;
        }
    }

    fn ensure_positive(name: &str, value: &mut u64, default: u64) {
        if *value == 0 {
            eprintln!(
                "Config error: {} must be positive - using default of {}",
                name, default
            );
            *value = default;
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct StoreConfig {
    /// Database holding the active scan slot. Defaults to the data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_file: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub scan: ScanConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            scan: ScanConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from a TOML file located in the app's data directory,
    /// with `WEBSENTINEL_` environment variables layered on top.
    /// If the file is missing or fails to parse, defaults are used.
    /// Additionally, writes the default config to disk if no file exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        if !config_path.exists() {
            Self::write_default(&config_path);
        }

        Self::load_from(&config_path)
    }

    fn write_default(config_path: &Path) {
        if let Some(parent) = config_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!(
                    "Failed to create configuration directory {}: {}",
                    parent.display(),
                    e
                );
            }
        }
        match toml::to_string_pretty(&Config::default()) {
            Ok(toml_string) => {
                if let Err(e) = fs::write(config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            }
            Err(_) => eprintln!("Failed to serialize default config."),
        }
    }

    fn load_from(config_path: &Path) -> Self {
        let default_config = Config::default();

        // Nested keys use a double underscore: WEBSENTINEL_SCAN__TIMEOUT_SECS
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config = figment.extract().unwrap_or_else(|err| {
            eprintln!(
                "Could not load config file {}: {}. Using default configuration.",
                config_path.display(),
                err
            );
            default_config
        });

        config.ensure_valid();

        config
    }

    /// Path of the state database, honoring `store.db_file` when set
    pub fn db_path(&self, project_dirs: &ProjectDirs) -> PathBuf {
        match &self.store.db_file {
            Some(db_file) => PathBuf::from(db_file),
            None => project_dirs.data_local_dir().join("websentinel.db"),
        }
    }

    /// Logger spec string for flexi_logger
    pub fn log_spec(&self) -> String {
        format!(
            "websentinel={}, reqwest={}",
            self.logging.websentinel, self.logging.reqwest
        )
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.server.ensure_valid();
        self.scan.ensure_valid();
    }
}
