// Closed-form finishing-position heuristic: a driver's mean finishing position
// at a circuit, nudged linearly by how far the chosen weather sits from the
// circuit's average weather.

use crate::data::{Catalog, WeatherObservation};
use crate::error::{PipelineError, Result};
use crate::geo;
use crate::history;
use std::fmt;
use tracing::{debug, info};

pub const MIN_POSITION: u32 = 1;
/// Field-size ceiling.
pub const MAX_POSITION: u32 = 20;

// Hand-tuned, not learned.
pub const TEMPERATURE_COEF: f64 = 0.05;
pub const PRESSURE_COEF: f64 = 0.01;
pub const HUMIDITY_COEF: f64 = 0.02;
pub const WIND_SPEED_COEF: f64 = 0.03;

/// A predicted finishing position, always within `[MIN_POSITION, MAX_POSITION]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u32);

impl Position {
    /// Round half-to-even, then clamp into the classification range.
    pub fn from_estimate(estimate: f64) -> Result<Self> {
        if estimate.is_nan() {
            return Err(PipelineError::invalid("estimate", "position estimate is NaN"));
        }
        let rounded = estimate
            .round_ties_even()
            .clamp(f64::from(MIN_POSITION), f64::from(MAX_POSITION));
        Ok(Position(rounded as u32))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Values of the four weather inputs, either user-chosen or reference means.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherControls {
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub wind_speed: f64,
}

impl WeatherControls {
    fn check_finite(&self, what: &'static str) -> Result<()> {
        let all = [self.temperature, self.pressure, self.humidity, self.wind_speed];
        if all.iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(PipelineError::invalid(what, format!("non-finite value in {self:?}")))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stat {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Stat {
    /// Non-finite values are skipped; `None` when nothing finite is left.
    fn of(values: impl Iterator<Item = f64>) -> Option<Stat> {
        let mut n = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values.filter(|v| v.is_finite()) {
            n += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        (n > 0).then(|| Stat {
            min,
            max,
            mean: sum / n as f64,
        })
    }
}

/// Range and mean of each weather variable near a circuit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherSummary {
    pub temperature: Stat,
    pub pressure: Stat,
    pub humidity: Stat,
    pub wind_speed: Stat,
}

impl WeatherSummary {
    pub fn from_observations<'a, I>(observations: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a WeatherObservation>,
        I::IntoIter: Clone,
    {
        let it = observations.into_iter();
        let stat = |name: &str, f: fn(&WeatherObservation) -> f64| {
            Stat::of(it.clone().map(f))
                .ok_or_else(|| PipelineError::no_data(format!("no finite {name} observations to summarize")))
        };
        Ok(Self {
            temperature: stat("temperature", |o| o.temperature)?,
            pressure: stat("pressure", |o| o.pressure)?,
            humidity: stat("humidity", |o| o.humidity)?,
            wind_speed: stat("wind speed", |o| o.wind_speed)?,
        })
    }

    /// Exact means, used both as the reference point and as the default
    /// controls. Defaults are not truncated to whole units, so a prediction
    /// at the defaults carries a zero weather adjustment.
    pub fn means(&self) -> WeatherControls {
        WeatherControls {
            temperature: self.temperature.mean,
            pressure: self.pressure.mean,
            humidity: self.humidity.mean,
            wind_speed: self.wind_speed.mean,
        }
    }

    /// Pin each control into the observed `[min, max]` range.
    pub fn clamp_controls(&self, c: WeatherControls) -> WeatherControls {
        let pin = |v: f64, s: &Stat| v.clamp(s.min, s.max);
        WeatherControls {
            temperature: pin(c.temperature, &self.temperature),
            pressure: pin(c.pressure, &self.pressure),
            humidity: pin(c.humidity, &self.humidity),
            wind_speed: pin(c.wind_speed, &self.wind_speed),
        }
    }
}

/// Mean historical finishing position; `NoData` when there is no history.
pub fn baseline_position(positions: &[u32]) -> Result<f64> {
    if positions.is_empty() {
        return Err(PipelineError::no_data("no historical results for driver at circuit"));
    }
    let sum: u64 = positions.iter().map(|&p| u64::from(p)).sum();
    Ok(sum as f64 / positions.len() as f64)
}

pub fn weather_adjustment(controls: &WeatherControls, means: &WeatherControls) -> f64 {
    TEMPERATURE_COEF * (controls.temperature - means.temperature)
        + PRESSURE_COEF * (controls.pressure - means.pressure)
        + HUMIDITY_COEF * (controls.humidity - means.humidity)
        + WIND_SPEED_COEF * (controls.wind_speed - means.wind_speed)
}

pub fn predict_position(
    baseline: f64,
    controls: &WeatherControls,
    means: &WeatherControls,
) -> Result<Position> {
    if !baseline.is_finite() {
        return Err(PipelineError::invalid("baseline", format!("non-finite value {baseline}")));
    }
    controls.check_finite("controls")?;
    means.check_finite("means")?;
    let adjustment = weather_adjustment(controls, means);
    debug!("baseline {:.3} adjusted by {:+.3}", baseline, adjustment);
    Position::from_estimate(baseline + adjustment)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything the heuristic needs for one (circuit, driver) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub circuit: String,
    pub driver: String,
    pub races: usize,
    pub baseline: f64,
    pub weather: WeatherSummary,
}

impl Selection {
    pub fn predict(&self, controls: &WeatherControls) -> Result<Position> {
        predict_position(self.baseline, controls, &self.weather.means())
    }

    pub fn predict_at_means(&self) -> Result<Position> {
        self.predict(&self.weather.means())
    }
}

/// Resolves selections against read-only reference data, recomputing only
/// when the (circuit, driver) key differs from the previous call.
pub struct PredictionSession<'a> {
    catalog: &'a Catalog,
    weather: &'a [WeatherObservation],
    margin: f64,
    current: Option<Selection>,
    recomputations: usize,
}

impl<'a> PredictionSession<'a> {
    pub fn new(catalog: &'a Catalog, weather: &'a [WeatherObservation], margin: f64) -> Self {
        Self {
            catalog,
            weather,
            margin,
            current: None,
            recomputations: 0,
        }
    }

    pub fn select(&mut self, circuit: &str, driver: &str) -> Result<&Selection> {
        let hit = self
            .current
            .as_ref()
            .is_some_and(|s| s.circuit == circuit && s.driver == driver);
        if !hit {
            self.current = None;
            self.recomputations += 1;
            self.current = Some(self.compute(circuit, driver)?);
        }
        self.current
            .as_ref()
            .ok_or_else(|| PipelineError::no_data("selection unavailable"))
    }

    /// How many times a selection has been computed from scratch.
    pub fn recomputations(&self) -> usize {
        self.recomputations
    }

    fn compute(&self, circuit: &str, driver: &str) -> Result<Selection> {
        let nearby = geo::circuit_weather(self.catalog, self.weather, circuit, self.margin)?;
        let weather = WeatherSummary::from_observations(nearby.iter().copied())?;

        let circuit_id = self.catalog.circuit_by_name(circuit)?.id;
        let driver_id = self.catalog.driver_by_surname(driver)?.id;
        let results = history::results_for_circuit(self.catalog, circuit_id);
        let positions = history::driver_positions(&results, driver_id);
        let baseline = baseline_position(&positions).map_err(|_| {
            PipelineError::no_data(format!("no results for {driver} at {circuit}"))
        })?;
        info!(
            "{} at {}: baseline {:.2} over {} races",
            driver,
            circuit,
            baseline,
            positions.len()
        );

        Ok(Selection {
            circuit: circuit.to_string(),
            driver: driver.to_string(),
            races: positions.len(),
            baseline,
            weather,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{read_table, Circuit, Driver, Race, RaceResult};

    fn at_means() -> WeatherControls {
        WeatherControls {
            temperature: 28.0,
            pressure: 1010.0,
            humidity: 75.0,
            wind_speed: 6.0,
        }
    }

    #[test]
    fn zero_deltas_return_rounded_baseline() {
        let m = at_means();
        assert_eq!(predict_position(5.0, &m, &m).unwrap().get(), 5);
    }

    #[test]
    fn warmer_than_average_pushes_back() {
        let m = at_means();
        let c = WeatherControls {
            temperature: m.temperature + 20.0,
            ..m
        };
        assert!((weather_adjustment(&c, &m) - 1.0).abs() < 1e-12);
        assert_eq!(predict_position(10.0, &c, &m).unwrap().get(), 11);
    }

    #[test]
    fn each_coefficient_applies_to_its_variable() {
        let m = at_means();
        let bump = |c: WeatherControls| weather_adjustment(&c, &m);
        assert!((bump(WeatherControls { pressure: m.pressure + 100.0, ..m }) - 1.0).abs() < 1e-9);
        assert!((bump(WeatherControls { humidity: m.humidity + 50.0, ..m }) - 1.0).abs() < 1e-9);
        assert!((bump(WeatherControls { wind_speed: m.wind_speed - 10.0, ..m }) + 0.3).abs() < 1e-9);
    }

    #[test]
    fn result_is_always_clamped() {
        let m = at_means();
        let hot = WeatherControls {
            temperature: 1e6,
            ..m
        };
        assert_eq!(predict_position(25.7, &hot, &m).unwrap().get(), MAX_POSITION);
        let cold = WeatherControls {
            temperature: -1e6,
            ..m
        };
        assert_eq!(predict_position(-3.0, &cold, &m).unwrap().get(), MIN_POSITION);
        assert_eq!(predict_position(-3.0, &hot, &m).unwrap().get(), MAX_POSITION);
        assert_eq!(predict_position(-3.0, &m, &m).unwrap().get(), MIN_POSITION);
    }

    #[test]
    fn ties_round_to_even() {
        assert_eq!(Position::from_estimate(2.5).unwrap().get(), 2);
        assert_eq!(Position::from_estimate(3.5).unwrap().get(), 4);
        assert_eq!(Position::from_estimate(3.49).unwrap().get(), 3);
        assert_eq!(Position::from_estimate(f64::INFINITY).unwrap().get(), 20);
        assert!(Position::from_estimate(f64::NAN).is_err());
    }

    #[test]
    fn prediction_is_deterministic() {
        let m = at_means();
        let c = WeatherControls {
            temperature: 31.3,
            pressure: 1003.1,
            humidity: 88.0,
            wind_speed: 2.2,
        };
        let first = predict_position(7.4, &c, &m).unwrap();
        for _ in 0..10 {
            assert_eq!(predict_position(7.4, &c, &m).unwrap(), first);
        }
    }

    #[test]
    fn non_finite_inputs_are_rejected() {
        let m = at_means();
        assert!(predict_position(f64::NAN, &m, &m).is_err());
        let bad = WeatherControls {
            humidity: f64::INFINITY,
            ..m
        };
        assert!(matches!(
            predict_position(5.0, &bad, &m),
            Err(PipelineError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn empty_history_is_no_data() {
        assert!(matches!(baseline_position(&[]), Err(PipelineError::NoData { .. })));
        assert_eq!(baseline_position(&[3, 4, 8]).unwrap(), 5.0);
    }

    fn obs(temperature: f64, pressure: f64, humidity: f64, wind_speed: f64) -> WeatherObservation {
        WeatherObservation {
            latitude: 1.3,
            longitude: 103.9,
            temperature,
            pressure,
            humidity,
            wind_speed,
            timestamp: None,
        }
    }

    #[test]
    fn summary_tracks_range_and_mean() {
        let rows = [obs(26.0, 1000.0, 60.0, 2.0), obs(30.0, 1010.0, 90.0, 8.0)];
        let s = WeatherSummary::from_observations(rows.iter()).unwrap();
        assert_eq!(s.temperature, Stat { min: 26.0, max: 30.0, mean: 28.0 });
        assert_eq!(s.means().pressure, 1005.0);
        let pinned = s.clamp_controls(WeatherControls {
            temperature: 45.0,
            pressure: 900.0,
            humidity: 75.0,
            wind_speed: 8.0,
        });
        assert_eq!(pinned.temperature, 30.0);
        assert_eq!(pinned.pressure, 1000.0);
        assert_eq!(pinned.humidity, 75.0);
        assert!(WeatherSummary::from_observations(std::iter::empty()).is_err());
    }

    #[test]
    fn summary_skips_nan_cells() {
        let csv = "\
latitude,longitude,temperature,pressure,humidity,wind_speed
1.3,103.9,28,1008,80,4
1.3,103.9,30,1010,NaN,6
";
        let rows: Vec<WeatherObservation> = read_table(csv.as_bytes(), "weather.csv").unwrap();
        assert_eq!(rows.len(), 2);
        let s = WeatherSummary::from_observations(rows.iter()).unwrap();
        assert_eq!(s.humidity, Stat { min: 80.0, max: 80.0, mean: 80.0 });
        assert_eq!(s.temperature.mean, 29.0);
        let m = s.means();
        assert_eq!(predict_position(3.0, &s.clamp_controls(m), &m).unwrap().get(), 3);
    }

    #[test]
    fn all_nan_variable_is_no_data() {
        let csv = "\
latitude,longitude,temperature,pressure,humidity,wind_speed
1.3,103.9,28,1008,NaN,4
";
        let rows: Vec<WeatherObservation> = read_table(csv.as_bytes(), "weather.csv").unwrap();
        let err = WeatherSummary::from_observations(rows.iter()).unwrap_err();
        assert!(matches!(err, PipelineError::NoData { .. }));
    }

    fn session_catalog() -> Catalog {
        let result = |race_id, driver_id, position_order| RaceResult {
            race_id,
            driver_id,
            grid: None,
            position: Some(position_order),
            position_order,
            points: 0.0,
            laps: 61,
            duration_ms: None,
        };
        Catalog::new(
            vec![
                Circuit { id: 15, name: "Marina Bay".into(), latitude: 1.29, longitude: 103.86 },
                Circuit { id: 14, name: "Monza".into(), latitude: 45.6, longitude: 9.28 },
            ],
            vec![
                Driver { id: 1, surname: "Hamilton".into() },
                Driver { id: 2, surname: "Alonso".into() },
            ],
            vec![
                Race { race_id: 1, circuit_id: 15, year: 2018, date: None },
                Race { race_id: 2, circuit_id: 15, year: 2019, date: None },
                Race { race_id: 3, circuit_id: 14, year: 2019, date: None },
            ],
            vec![result(1, 1, 1), result(2, 1, 4), result(1, 2, 7), result(3, 2, 3)],
        )
    }

    #[test]
    fn session_recomputes_only_on_new_selection() {
        let catalog = session_catalog();
        let weather = [obs(26.0, 1000.0, 60.0, 2.0), obs(30.0, 1010.0, 90.0, 8.0)];
        let mut session = PredictionSession::new(&catalog, &weather, 5.0);

        let sel = session.select("Marina Bay", "Hamilton").unwrap();
        assert_eq!(sel.baseline, 2.5);
        assert_eq!(sel.races, 2);
        assert_eq!(sel.predict_at_means().unwrap().get(), 2);
        session.select("Marina Bay", "Hamilton").unwrap();
        assert_eq!(session.recomputations(), 1);

        let sel = session.select("Marina Bay", "Alonso").unwrap();
        assert_eq!(sel.baseline, 7.0);
        assert_eq!(session.recomputations(), 2);
    }

    #[test]
    fn session_reports_missing_data() {
        let catalog = session_catalog();
        let weather = [obs(26.0, 1000.0, 60.0, 2.0)];
        let mut session = PredictionSession::new(&catalog, &weather, 5.0);

        // no weather near Monza
        assert!(matches!(session.select("Monza", "Alonso"), Err(PipelineError::NoData { .. })));
        assert!(matches!(
            session.select("Marina Bay", "Verstappen"),
            Err(PipelineError::ReferenceNotFound { .. })
        ));
        assert!(matches!(
            session.select("Nürburgring", "Hamilton"),
            Err(PipelineError::ReferenceNotFound { .. })
        ));

        let mut session = PredictionSession::new(&catalog, &weather, 50.0);
        let catalog_without_results = Catalog::new(
            catalog.circuits.to_vec(),
            catalog.drivers.to_vec(),
            catalog.races.to_vec(),
            vec![],
        );
        let mut empty = PredictionSession::new(&catalog_without_results, &weather, 50.0);
        assert!(matches!(empty.select("Marina Bay", "Hamilton"), Err(PipelineError::NoData { .. })));
        assert!(session.select("Marina Bay", "Hamilton").is_ok());
    }
}
