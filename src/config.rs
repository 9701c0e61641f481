use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::db::DB_FILENAME;

pub static CONFIG: OnceCell<Config> = OnceCell::new();

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoggingConfig {
    pub anitrack: String,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const ANITRACK_LEVEL: &str = "info";

    fn default() -> Self {
        LoggingConfig {
            anitrack: Self::ANITRACK_LEVEL.to_string(),
        }
    }

    fn ensure_valid(&mut self) {
        // Trim and lowercase, then confirm it's a valid log level. If not,
        // inform the user and use the default.
        let str_original = self.anitrack.clone();
        self.anitrack = self.anitrack.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.anitrack.as_str()) {
            eprintln!(
                "Config error: anitrack log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::ANITRACK_LEVEL
            );
            self.anitrack = Self::ANITRACK_LEVEL.to_owned();
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseConfig {
    /// Explicit database file path; the per-user data directory when unset.
    pub path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MigrationConfig {
    /// Abort a transition on the first row-level migration failure.
    pub strict: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub migration: MigrationConfig,
}

impl Config {
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| match Self::project_dirs() {
            Some(dirs) => Config::load_config(&dirs),
            None => Config::default_config(),
        })
    }

    fn project_dirs() -> Option<ProjectDirs> {
        ProjectDirs::from("", "", "anitrack")
    }

    fn default_config() -> Self {
        Config {
            logging: LoggingConfig::default(),
            database: DatabaseConfig { path: None },
            migration: MigrationConfig { strict: false },
        }
    }

    /// Loads the configuration from a TOML file located in the app's data
    /// directory. If the file is missing or fails to parse, defaults are
    /// used. Additionally, writes the default config to disk if no file
    /// exists.
    pub fn load_config(project_dirs: &ProjectDirs) -> Self {
        let config_path = project_dirs.data_local_dir().join("config.toml");

        let default_config = Self::default_config();

        // If the config file doesn't exist, write the default configuration to disk.
        if !config_path.exists() {
            if let Some(parent) = config_path.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    eprintln!(
                        "Failed to create configuration directory {}: {}",
                        parent.display(),
                        e
                    );
                }
            }
            if let Ok(toml_string) = toml::to_string_pretty(&default_config) {
                if let Err(e) = fs::write(&config_path, toml_string) {
                    eprintln!(
                        "Failed to write default config to {}: {}",
                        config_path.display(),
                        e
                    );
                }
            } else {
                eprintln!("Failed to serialize default config.");
            }
        }

        // Defaults merged with the TOML file (if it exists) and environment overrides
        let figment = Figment::from(Serialized::defaults(default_config.clone()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("ANITRACK_").split("__"));

        // Attempt to extract the configuration; on error, log a message and fall back to defaults.
        let mut config: Config = figment.extract().unwrap_or_else(|err| {
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

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
    }

    /// Database location: the explicit config value, else the per-user data
    /// directory.
    pub fn db_path(&self) -> PathBuf {
        if let Some(path) = &self.database.path {
            return PathBuf::from(path);
        }
        match Self::project_dirs() {
            Some(dirs) => dirs.data_local_dir().join(DB_FILENAME),
            None => PathBuf::from(DB_FILENAME),
        }
    }

    /// Module filter string handed to flexi_logger.
    pub fn log_spec(&self) -> String {
        format!("anitrack={}", self.logging.anitrack)
    }
}
