// Configuration loading and parsing (predictor.toml).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },
}

// ---------------------------------------------------------------------------
// Config structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataPaths,
    pub geo: GeoConfig,
    pub model: ModelConfig,
}

/// Locations of the input tables and where generated artifacts go.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataPaths {
    pub circuits: PathBuf,
    pub drivers: PathBuf,
    pub races: PathBuf,
    pub results: PathBuf,
    pub driver_standings: PathBuf,
    pub weather: PathBuf,
    pub output_dir: PathBuf,
}

impl Default for DataPaths {
    fn default() -> Self {
        Self {
            circuits: PathBuf::from("data/circuits.csv"),
            drivers: PathBuf::from("data/drivers.csv"),
            races: PathBuf::from("data/races.csv"),
            results: PathBuf::from("data/results.csv"),
            driver_standings: PathBuf::from("data/driver_standings.csv"),
            weather: PathBuf::from("data/weather.csv"),
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Half-width of the bounding box, in degrees.
    pub margin: f64,
    /// Fraction of filtered rows kept in the weather extract.
    pub sample_fraction: f64,
    pub seed: u64,
    /// Ignore `seed` and draw a fresh sample every run.
    pub unseeded: bool,
}

impl GeoConfig {
    /// Seed for the extract sampler; `None` when `unseeded` is set.
    pub fn sampling_seed(&self) -> Option<u64> {
        (!self.unseeded).then_some(self.seed)
    }
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            margin: 50.0,
            sample_fraction: 0.1,
            seed: 42,
            unseeded: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub n_trees: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub test_ratio: f64,
    pub seed: u64,
    pub artifact: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            test_ratio: 0.2,
            seed: 42,
            artifact: PathBuf::from("output/position_model.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from a TOML file. Missing sections and
/// keys fall back to their defaults.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config = parse_config(&text).map_err(|e| match e {
        ParseOrValidate::Parse(source) => ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        },
        ParseOrValidate::Validate(err) => err,
    })?;
    Ok(config)
}

enum ParseOrValidate {
    Parse(toml::de::Error),
    Validate(ConfigError),
}

fn parse_config(text: &str) -> Result<Config, ParseOrValidate> {
    let config: Config = toml::from_str(text).map_err(ParseOrValidate::Parse)?;
    validate(&config).map_err(ParseOrValidate::Validate)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let geo = &config.geo;
    if !geo.margin.is_finite() || geo.margin < 0.0 {
        return Err(validation("geo.margin", "must be a finite, non-negative number of degrees"));
    }
    if !(geo.sample_fraction > 0.0 && geo.sample_fraction <= 1.0) {
        return Err(validation("geo.sample_fraction", "must be in (0, 1]"));
    }

    let model = &config.model;
    if model.n_trees == 0 {
        return Err(validation("model.n_trees", "must be at least 1"));
    }
    if model.min_samples_split < 2 {
        return Err(validation("model.min_samples_split", "must be at least 2"));
    }
    if model.max_depth == Some(0) {
        return Err(validation("model.max_depth", "must be at least 1 when set"));
    }
    if !(model.test_ratio > 0.0 && model.test_ratio < 1.0) {
        return Err(validation("model.test_ratio", "must be in (0, 1)"));
    }
    Ok(())
}

fn validation(field: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.to_string(),
    }
}
