use crate::config::DataPaths;
use crate::error::{PipelineError, Result};
use csv::{ReaderBuilder, StringRecord};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, info, warn};

// Ergast exports write missing values as `\N`; treat those and empty cells as null.
fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = String::deserialize(deserializer)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "\\N" {
        return Ok(None);
    }
    trimmed.parse::<T>().map(Some).map_err(D::Error::custom)
}

// Timestamps show up both as integers and as floats (`1546300800.0`).
fn nullable_timestamp<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<f64> = nullable(deserializer)?;
    match secs {
        Some(s) if !s.is_finite() => Err(D::Error::custom("non-finite timestamp")),
        Some(s) => Ok(Some(s.trunc() as i64)),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Table rows
// ---------------------------------------------------------------------------

/// A row type read from one of the input CSV tables.
pub trait Table: DeserializeOwned {
    const NAME: &'static str;
    /// Columns that must be present; each entry lists the accepted spellings.
    const REQUIRED: &'static [&'static [&'static str]];
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Circuit {
    #[serde(rename = "circuitId")]
    pub id: u32,
    pub name: String,
    #[serde(rename = "lat")]
    pub latitude: f64,
    #[serde(rename = "lng")]
    pub longitude: f64,
}

impl Table for Circuit {
    const NAME: &'static str = "circuits";
    const REQUIRED: &'static [&'static [&'static str]] =
        &[&["circuitId"], &["name"], &["lat"], &["lng"]];
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Driver {
    #[serde(rename = "driverId")]
    pub id: u32,
    pub surname: String,
}

impl Table for Driver {
    const NAME: &'static str = "drivers";
    const REQUIRED: &'static [&'static [&'static str]] = &[&["driverId"], &["surname"]];
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Race {
    #[serde(rename = "raceId")]
    pub race_id: u32,
    #[serde(rename = "circuitId")]
    pub circuit_id: u32,
    pub year: i32,
    /// Calendar date, `YYYY-MM-DD`.
    #[serde(default, deserialize_with = "nullable")]
    pub date: Option<String>,
}

impl Table for Race {
    const NAME: &'static str = "races";
    const REQUIRED: &'static [&'static [&'static str]] = &[&["raceId"], &["circuitId"], &["year"]];
}

/// One driver's classification in one race.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RaceResult {
    #[serde(rename = "raceId")]
    pub race_id: u32,
    #[serde(rename = "driverId")]
    pub driver_id: u32,
    #[serde(default, deserialize_with = "nullable")]
    pub grid: Option<u32>,
    /// Classified position; null for drivers who were not classified.
    #[serde(default, deserialize_with = "nullable")]
    pub position: Option<u32>,
    #[serde(rename = "positionOrder")]
    pub position_order: u32,
    pub points: f64,
    pub laps: u32,
    #[serde(rename = "milliseconds", default, deserialize_with = "nullable")]
    pub duration_ms: Option<u64>,
}

impl Table for RaceResult {
    const NAME: &'static str = "results";
    const REQUIRED: &'static [&'static [&'static str]] = &[
        &["raceId"],
        &["driverId"],
        &["positionOrder"],
        &["points"],
        &["laps"],
    ];
}

/// A driver's championship standing after one race.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Standing {
    #[serde(rename = "driverId")]
    pub driver_id: u32,
    pub wins: u32,
    pub points: f64,
    pub position: u32,
}

impl Table for Standing {
    const NAME: &'static str = "driver_standings";
    const REQUIRED: &'static [&'static [&'static str]] =
        &[&["driverId"], &["wins"], &["points"], &["position"]];
}

/// A single weather reading. Accepts the generic column names as well as the
/// `fact_*` / `gfs_*` names used by the source weather dataset.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WeatherObservation {
    #[serde(alias = "fact_latitude")]
    pub latitude: f64,
    #[serde(alias = "fact_longitude")]
    pub longitude: f64,
    #[serde(alias = "fact_temperature")]
    pub temperature: f64,
    #[serde(alias = "gfs_pressure")]
    pub pressure: f64,
    #[serde(alias = "gfs_humidity")]
    pub humidity: f64,
    #[serde(alias = "gfs_wind_speed")]
    pub wind_speed: f64,
    /// Unix seconds.
    #[serde(alias = "fact_time", default, deserialize_with = "nullable_timestamp")]
    pub timestamp: Option<i64>,
}

impl WeatherObservation {
    /// UTC calendar date of the reading, `YYYY-MM-DD`.
    pub fn date(&self) -> Option<String> {
        let ts = self.timestamp?;
        chrono::DateTime::from_timestamp(ts, 0).map(|dt| dt.format("%Y-%m-%d").to_string())
    }
}

impl Table for WeatherObservation {
    const NAME: &'static str = "weather";
    const REQUIRED: &'static [&'static [&'static str]] = &[
        &["latitude", "fact_latitude"],
        &["longitude", "fact_longitude"],
        &["temperature", "fact_temperature"],
        &["pressure", "gfs_pressure"],
        &["humidity", "gfs_humidity"],
        &["wind_speed", "gfs_wind_speed"],
    ];
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

fn require_columns<T: Table>(headers: &StringRecord) -> Result<()> {
    let present: HashSet<&str> = headers.iter().map(str::trim).collect();
    let missing: Vec<&str> = T::REQUIRED
        .iter()
        .filter(|names| !names.iter().any(|n| present.contains(n)))
        .map(|names| names[0])
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::schema(
            T::NAME,
            format!("missing column(s): {}", missing.join(", ")),
        ))
    }
}

/// Read a table from any reader. `source` only labels errors and log lines.
/// Rows that fail to deserialize are skipped with a warning; a missing
/// required column fails the whole table.
pub fn read_table<T: Table, R: Read>(rdr: R, source: &str) -> Result<Vec<T>> {
    let mut reader = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(rdr);
    let headers = reader
        .headers()
        .map_err(|e| PipelineError::Csv {
            path: source.to_string(),
            source: e,
        })?
        .clone();
    require_columns::<T>(&headers)?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for res in reader.deserialize::<T>() {
        match res {
            Ok(row) => rows.push(row),
            Err(e) => {
                skipped += 1;
                warn!("skipping malformed {} row in {}: {}", T::NAME, source, e);
            }
        }
    }
    debug!("read {} {} rows from {} ({} skipped)", rows.len(), T::NAME, source, skipped);
    Ok(rows)
}

pub fn load_table<T: Table, P: AsRef<Path>>(path: P) -> Result<Vec<T>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let rows = read_table::<T, _>(file, &path.display().to_string())?;
    info!("loaded {} {} rows from {}", rows.len(), T::NAME, path.display());
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Caching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Read each path once per process and share the rows afterwards.
    #[default]
    LoadOnce,
    AlwaysReload,
}

/// Path-keyed memo of loaded tables.
pub struct TableCache<T> {
    policy: CachePolicy,
    entries: HashMap<PathBuf, Rc<Vec<T>>>,
}

impl<T> TableCache<T> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            entries: HashMap::new(),
        }
    }

    /// Return the cached rows for `path`, calling `loader` on a miss.
    pub fn get_with<F>(&mut self, path: &Path, loader: F) -> Result<Rc<Vec<T>>>
    where
        F: FnOnce(&Path) -> Result<Vec<T>>,
    {
        if self.policy == CachePolicy::LoadOnce {
            if let Some(rows) = self.entries.get(path) {
                return Ok(Rc::clone(rows));
            }
        }
        let rows = Rc::new(loader(path)?);
        if self.policy == CachePolicy::LoadOnce {
            self.entries.insert(path.to_path_buf(), Rc::clone(&rows));
        }
        Ok(rows)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Table> TableCache<T> {
    pub fn get(&mut self, path: &Path) -> Result<Rc<Vec<T>>> {
        self.get_with(path, |p| load_table::<T, _>(p))
    }
}

/// One cache per input table.
pub struct DataCache {
    pub circuits: TableCache<Circuit>,
    pub drivers: TableCache<Driver>,
    pub races: TableCache<Race>,
    pub results: TableCache<RaceResult>,
    pub standings: TableCache<Standing>,
    pub weather: TableCache<WeatherObservation>,
}

impl DataCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            circuits: TableCache::new(policy),
            drivers: TableCache::new(policy),
            races: TableCache::new(policy),
            results: TableCache::new(policy),
            standings: TableCache::new(policy),
            weather: TableCache::new(policy),
        }
    }

    pub fn catalog(&mut self, paths: &DataPaths) -> Result<Catalog> {
        Ok(Catalog {
            circuits: self.circuits.get(&paths.circuits)?,
            drivers: self.drivers.get(&paths.drivers)?,
            races: self.races.get(&paths.races)?,
            results: self.results.get(&paths.results)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Reference lookups
// ---------------------------------------------------------------------------

/// Read-only reference tables shared by every query in a session.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub circuits: Rc<Vec<Circuit>>,
    pub drivers: Rc<Vec<Driver>>,
    pub races: Rc<Vec<Race>>,
    pub results: Rc<Vec<RaceResult>>,
}

impl Catalog {
    pub fn new(
        circuits: Vec<Circuit>,
        drivers: Vec<Driver>,
        races: Vec<Race>,
        results: Vec<RaceResult>,
    ) -> Self {
        Self {
            circuits: Rc::new(circuits),
            drivers: Rc::new(drivers),
            races: Rc::new(races),
            results: Rc::new(results),
        }
    }

    pub fn circuit_by_name(&self, name: &str) -> Result<&Circuit> {
        self.circuits
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| PipelineError::not_found("circuit", name))
    }

    /// First driver with the given surname, matching the order of the table.
    pub fn driver_by_surname(&self, surname: &str) -> Result<&Driver> {
        self.drivers
            .iter()
            .find(|d| d.surname == surname)
            .ok_or_else(|| PipelineError::not_found("driver", surname))
    }

    pub fn races_at(&self, circuit_id: u32) -> impl Iterator<Item = &Race> + '_ {
        self.races.iter().filter(move |r| r.circuit_id == circuit_id)
    }
}
