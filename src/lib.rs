// Library root: weather-conditioned finishing-position prediction. The binary
// in main.rs and the integration tests both go through these modules.

pub mod config;
pub mod data;
pub mod error;
pub mod geo;
pub mod history;
pub mod model;
pub mod predictor;

pub use error::{PipelineError, Result};
pub use predictor::{Position, WeatherControls};
