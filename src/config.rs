use std::{env, path::PathBuf, sync::OnceLock};

use config::{Environment, File};
use directories::ProjectDirs;
use lazy_static::lazy_static;
use serde::Deserialize;

const DEFAULT_CONFIG: &str = include_str!("../.config/config.json5");

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub config_dir: PathBuf,
}

/// Named report endpoints; the remote side is an opaque spreadsheet-backed
/// collaborator, so all the app knows is a URL per concern.
#[derive(Clone, Debug, Deserialize, Default)]
pub struct EndpointConfig {
    pub user_directory: String,
    pub vehicle_directory: String,
    pub task_log: String,
    pub event_log: String,
    pub shift_report: String,
    pub delivery_report: String,
    pub mechanic_report: String,
    pub photo_upload: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NetworkConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            retries: 2,
            backoff_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default, flatten)]
    pub config: AppConfig,
    #[serde(default)]
    pub endpoints: EndpointConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_max_shift_distance_km")]
    pub max_shift_distance_km: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config: AppConfig::default(),
            endpoints: EndpointConfig::default(),
            network: NetworkConfig::default(),
            max_shift_distance_km: default_max_shift_distance_km(),
        }
    }
}

fn default_max_shift_distance_km() -> i64 {
    250
}

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase().to_string();
    pub static ref DATA_FOLDER: Option<PathBuf> =
        env::var(format!("{}_DATA", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
    pub static ref CONFIG_FOLDER: Option<PathBuf> =
        env::var(format!("{}_CONFIG", PROJECT_NAME.clone()))
            .ok()
            .map(PathBuf::from);
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn new() -> Result<Self, config::ConfigError> {
        let data_dir = get_data_dir();
        let config_dir = get_config_dir();

        let mut builder = config::Config::builder()
            .set_default("data_dir", data_dir.to_str().unwrap())?
            .set_default("config_dir", config_dir.to_str().unwrap())?
            .add_source(File::from_str(DEFAULT_CONFIG, config::FileFormat::Json5));

        let config_files = [
            ("config.json5", config::FileFormat::Json5),
            ("config.json", config::FileFormat::Json),
            ("config.yaml", config::FileFormat::Yaml),
            ("config.toml", config::FileFormat::Toml),
        ];
        for (file, format) in &config_files {
            let source = config::File::from(config_dir.join(file))
                .format(*format)
                .required(false);
            builder = builder.add_source(source);
        }

        let cfg: Self = builder
            .add_source(Environment::with_prefix("FIELDSHIFT").separator("__"))
            .build()?
            .try_deserialize()?;

        CONFIG.set(cfg.clone()).expect("no config set yet");

        Ok(cfg)
    }

    pub fn get() -> &'static Self {
        CONFIG.get().expect("config loaded")
    }

    #[cfg(test)]
    pub fn set_for_tests(cfg: Self) {
        let _ = CONFIG.set(cfg);
    }
}

pub fn get_data_dir() -> PathBuf {
    if let Some(s) = DATA_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(s) = CONFIG_FOLDER.clone() {
        s
    } else if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    }
}

fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("plus.lit", "", env!("CARGO_PKG_NAME"))
}
