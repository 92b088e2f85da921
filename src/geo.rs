// Weather observations near a circuit: bounding-box filter, optional
// down-sampling, and the zipped per-circuit extract.

use crate::data::{Catalog, Circuit, WeatherObservation};
use crate::error::{PipelineError, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Axis-aligned box of `±margin` degrees around a point.
///
/// This is not a great-circle distance: it over-selects near the poles and
/// does not wrap at the date line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoWindow {
    pub latitude: f64,
    pub longitude: f64,
    pub margin: f64,
}

impl GeoWindow {
    pub fn new(latitude: f64, longitude: f64, margin: f64) -> Result<Self> {
        if !margin.is_finite() || margin < 0.0 {
            return Err(PipelineError::invalid(
                "margin",
                format!("expected a finite value >= 0, got {margin}"),
            ));
        }
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(PipelineError::invalid(
                "coordinates",
                format!("non-finite target ({latitude}, {longitude})"),
            ));
        }
        Ok(Self {
            latitude,
            longitude,
            margin,
        })
    }

    pub fn around(circuit: &Circuit, margin: f64) -> Result<Self> {
        Self::new(circuit.latitude, circuit.longitude, margin)
    }

    /// Inclusive on all four edges.
    pub fn contains(&self, obs: &WeatherObservation) -> bool {
        let lat_ok = obs.latitude >= self.latitude - self.margin
            && obs.latitude <= self.latitude + self.margin;
        let lng_ok = obs.longitude >= self.longitude - self.margin
            && obs.longitude <= self.longitude + self.margin;
        lat_ok && lng_ok
    }

    /// Observations inside the window, in input order.
    pub fn filter<'a>(&self, observations: &'a [WeatherObservation]) -> Vec<&'a WeatherObservation> {
        observations.iter().filter(|o| self.contains(o)).collect()
    }
}

/// Window around the circuit called `name`.
pub fn window_for_circuit(catalog: &Catalog, name: &str, margin: f64) -> Result<GeoWindow> {
    let circuit = catalog.circuit_by_name(name)?;
    debug!(
        "circuit {} at ({}, {}), margin ±{}°",
        circuit.name, circuit.latitude, circuit.longitude, margin
    );
    GeoWindow::around(circuit, margin)
}

/// Weather near the named circuit. Fails with `NoData` when nothing falls
/// inside the window.
pub fn circuit_weather<'a>(
    catalog: &Catalog,
    observations: &'a [WeatherObservation],
    name: &str,
    margin: f64,
) -> Result<Vec<&'a WeatherObservation>> {
    let window = window_for_circuit(catalog, name, margin)?;
    let filtered = window.filter(observations);
    info!(
        "{} of {} weather rows within ±{}° of {}",
        filtered.len(),
        observations.len(),
        margin,
        name
    );
    if filtered.is_empty() {
        return Err(PipelineError::no_data(format!(
            "no weather observations within ±{margin}° of {name}"
        )));
    }
    Ok(filtered)
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Uniform down-sampling without replacement, used to bound extract size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub fraction: f64,
    /// `None` samples from OS entropy and is not reproducible.
    pub seed: Option<u64>,
}

impl Sampling {
    pub fn new(fraction: f64, seed: Option<u64>) -> Result<Self> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(PipelineError::invalid(
                "sample_fraction",
                format!("expected a value in (0, 1], got {fraction}"),
            ));
        }
        Ok(Self { fraction, seed })
    }

    /// Keep `floor(len * fraction)` rows, preserving their relative order.
    pub fn apply<T>(&self, rows: Vec<T>) -> Vec<T> {
        if self.fraction >= 1.0 {
            return rows;
        }
        let n = rows.len();
        let k = (n as f64 * self.fraction).floor() as usize;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut keep = vec![false; n];
        for idx in rand::seq::index::sample(&mut rng, n, k).iter() {
            keep[idx] = true;
        }
        rows.into_iter()
            .zip(keep)
            .filter_map(|(row, k)| k.then_some(row))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Extract archive
// ---------------------------------------------------------------------------

// Column names follow the source weather dataset so the extract can be read
// back by anything that reads the full table.
#[derive(Serialize)]
struct ExtractRow {
    fact_latitude: f64,
    fact_longitude: f64,
    fact_temperature: f64,
    gfs_pressure: f64,
    gfs_humidity: f64,
    gfs_wind_speed: f64,
}

impl From<&WeatherObservation> for ExtractRow {
    fn from(o: &WeatherObservation) -> Self {
        Self {
            fact_latitude: o.latitude,
            fact_longitude: o.longitude,
            fact_temperature: o.temperature,
            gfs_pressure: o.pressure,
            gfs_humidity: o.humidity,
            gfs_wind_speed: o.wind_speed,
        }
    }
}

/// A zip archive holding one CSV of the weather near a circuit.
#[derive(Debug, Clone)]
pub struct WeatherExtract {
    pub circuit: String,
    pub entry_name: String,
    pub rows: usize,
    pub archive: Vec<u8>,
}

fn file_stem(circuit: &str) -> String {
    circuit.replace(['/', '\\'], "_")
}

pub fn extract_circuit_weather(
    catalog: &Catalog,
    observations: &[WeatherObservation],
    circuit: &str,
    margin: f64,
    sampling: Sampling,
) -> Result<WeatherExtract> {
    let filtered = circuit_weather(catalog, observations, circuit, margin)?;
    let sampled = sampling.apply(filtered);
    info!("kept {} weather rows for {} after sampling", sampled.len(), circuit);
    if sampled.is_empty() {
        return Err(PipelineError::no_data(format!(
            "sampling left no weather rows for {circuit}"
        )));
    }

    let entry_name = format!("{}_weather.csv", file_stem(circuit));
    let mut writer = csv::Writer::from_writer(Vec::new());
    for obs in &sampled {
        writer
            .serialize(ExtractRow::from(*obs))
            .map_err(|e| PipelineError::Csv {
                path: entry_name.clone(),
                source: e,
            })?;
    }
    let csv_bytes = writer.into_inner().map_err(|e| PipelineError::Io {
        path: PathBuf::from(&entry_name),
        source: e.into_error(),
    })?;

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    // Fixed timestamp so identical rows always give identical archives.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    zip.start_file(entry_name.as_str(), options)?;
    zip.write_all(&csv_bytes).map_err(ZipError::Io)?;
    let archive = zip.finish()?.into_inner();

    Ok(WeatherExtract {
        circuit: circuit.to_string(),
        entry_name,
        rows: sampled.len(),
        archive,
    })
}

/// Save the archive as `<dir>/<circuit>_weather.zip`.
pub fn write_extract(extract: &WeatherExtract, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).map_err(|e| PipelineError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let path = dir.join(format!("{}_weather.zip", file_stem(&extract.circuit)));
    std::fs::write(&path, &extract.archive).map_err(|e| PipelineError::Io {
        path: path.clone(),
        source: e,
    })?;
    info!("wrote {} ({} rows)", path.display(), extract.rows);
    Ok(path)
}
