// Driver history aggregates and the joins that attach them (and the weather
// of the race day) to circuit race results.

use crate::data::{Catalog, RaceResult, Standing, WeatherObservation};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use tracing::{debug, info};

/// Career aggregates for one driver over their standings records.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverHistory {
    pub driver_id: u32,
    pub total_wins: u32,
    pub total_points: f64,
    pub average_position: f64,
}

/// One aggregate per distinct driver. Always a full recomputation; the result
/// does not depend on the order of `standings` (points are summed in sorted
/// order so floating-point rounding is order-independent too).
pub fn aggregate_histories(standings: &[Standing]) -> HashMap<u32, DriverHistory> {
    struct Acc {
        wins: u32,
        points: Vec<f64>,
        position_sum: u64,
        count: u64,
    }

    let mut acc: HashMap<u32, Acc> = HashMap::new();
    for s in standings {
        let a = acc.entry(s.driver_id).or_insert(Acc {
            wins: 0,
            points: Vec::new(),
            position_sum: 0,
            count: 0,
        });
        a.wins += s.wins;
        a.points.push(s.points);
        a.position_sum += u64::from(s.position);
        a.count += 1;
    }

    let histories: HashMap<u32, DriverHistory> = acc
        .into_iter()
        .map(|(driver_id, mut a)| {
            a.points.sort_by(f64::total_cmp);
            let history = DriverHistory {
                driver_id,
                total_wins: a.wins,
                total_points: a.points.iter().sum(),
                average_position: a.position_sum as f64 / a.count as f64,
            };
            (driver_id, history)
        })
        .collect();
    debug!("aggregated history for {} drivers", histories.len());
    histories
}

/// A row paired with its driver's history, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Joined<T> {
    pub row: T,
    pub history: Option<DriverHistory>,
}

/// Left join on driver id: every input row comes out exactly once, with
/// `history: None` when the driver has no standings.
pub fn left_join<T, F>(rows: Vec<T>, histories: &HashMap<u32, DriverHistory>, driver_of: F) -> Vec<Joined<T>>
where
    F: Fn(&T) -> u32,
{
    rows.into_iter()
        .map(|row| {
            let history = histories.get(&driver_of(&row)).cloned();
            Joined { row, history }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Circuit results
// ---------------------------------------------------------------------------

/// A race result together with the calendar data of its race.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitResult {
    pub result: RaceResult,
    pub year: i32,
    pub date: Option<String>,
}

/// All results of races held at `circuit_id`.
pub fn results_for_circuit(catalog: &Catalog, circuit_id: u32) -> Vec<CircuitResult> {
    let races: HashMap<u32, (i32, Option<String>)> = catalog
        .races_at(circuit_id)
        .map(|r| (r.race_id, (r.year, r.date.clone())))
        .collect();
    let results: Vec<CircuitResult> = catalog
        .results
        .iter()
        .filter_map(|r| {
            races.get(&r.race_id).map(|(year, date)| CircuitResult {
                result: r.clone(),
                year: *year,
                date: date.clone(),
            })
        })
        .collect();
    info!(
        "{} results from {} races at circuit {}",
        results.len(),
        races.len(),
        circuit_id
    );
    results
}

/// The finishing-position order of one driver's results at a circuit.
pub fn driver_positions(results: &[CircuitResult], driver_id: u32) -> Vec<u32> {
    results
        .iter()
        .filter(|r| r.result.driver_id == driver_id)
        .map(|r| r.result.position_order)
        .collect()
}

// ---------------------------------------------------------------------------
// Combined feature table
// ---------------------------------------------------------------------------

/// A race result joined with a weather reading from the same day and,
/// optionally, the driver's history. This is the row of the combined CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub race_id: u32,
    pub driver_id: u32,
    pub year: i32,
    pub date: String,
    pub grid: Option<u32>,
    pub position: Option<u32>,
    pub position_order: u32,
    pub points: f64,
    pub laps: u32,
    pub duration_ms: Option<u64>,
    pub latitude: f64,
    pub longitude: f64,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: f64,
    pub wind_speed: f64,
    pub total_wins: Option<u32>,
    pub total_points: Option<f64>,
    pub average_position: Option<f64>,
}

impl FeatureRow {
    fn new(r: &CircuitResult, date: &str, w: &WeatherObservation) -> Self {
        Self {
            race_id: r.result.race_id,
            driver_id: r.result.driver_id,
            year: r.year,
            date: date.to_string(),
            grid: r.result.grid,
            position: r.result.position,
            position_order: r.result.position_order,
            points: r.result.points,
            laps: r.result.laps,
            duration_ms: r.result.duration_ms,
            latitude: w.latitude,
            longitude: w.longitude,
            temperature: w.temperature,
            pressure: w.pressure,
            humidity: w.humidity,
            wind_speed: w.wind_speed,
            total_wins: None,
            total_points: None,
            average_position: None,
        }
    }

    /// The attached history, when all three aggregate columns are present.
    pub fn history(&self) -> Option<DriverHistory> {
        Some(DriverHistory {
            driver_id: self.driver_id,
            total_wins: self.total_wins?,
            total_points: self.total_points?,
            average_position: self.average_position?,
        })
    }

    fn set_history(&mut self, history: Option<DriverHistory>) {
        self.total_wins = history.as_ref().map(|h| h.total_wins);
        self.total_points = history.as_ref().map(|h| h.total_points);
        self.average_position = history.as_ref().map(|h| h.average_position);
    }

    // Identity used to drop exact duplicates produced by duplicated weather rows.
    fn dedup_key(&self) -> (u32, u32, u32, [u64; 6]) {
        (
            self.race_id,
            self.driver_id,
            self.position_order,
            [
                self.latitude.to_bits(),
                self.longitude.to_bits(),
                self.temperature.to_bits(),
                self.pressure.to_bits(),
                self.humidity.to_bits(),
                self.wind_speed.to_bits(),
            ],
        )
    }
}

/// Inner join of circuit results with weather readings taken on the race day.
///
/// Results whose race has no date and readings without a timestamp cannot
/// match and are dropped. Exact duplicate rows are removed.
pub fn combine_by_date(results: &[CircuitResult], weather: &[&WeatherObservation]) -> Vec<FeatureRow> {
    let mut by_date: HashMap<String, Vec<&WeatherObservation>> = HashMap::new();
    for w in weather {
        if let Some(date) = w.date() {
            by_date.entry(date).or_default().push(w);
        }
    }

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for r in results {
        let Some(date) = r.date.as_deref() else {
            continue;
        };
        let Some(readings) = by_date.get(date) else {
            continue;
        };
        for w in readings {
            let row = FeatureRow::new(r, date, w);
            if seen.insert(row.dedup_key()) {
                rows.push(row);
            }
        }
    }
    info!(
        "combined {} results with weather on {} distinct days into {} rows",
        results.len(),
        by_date.len(),
        rows.len()
    );
    rows
}

/// Attach driver histories to combined rows (left join).
pub fn join_histories(rows: Vec<FeatureRow>, histories: &HashMap<u32, DriverHistory>) -> Vec<FeatureRow> {
    let joined = left_join(rows, histories, |r| r.driver_id);
    let matched = joined.iter().filter(|j| j.history.is_some()).count();
    debug!("{} of {} rows matched a driver history", matched, joined.len());
    joined
        .into_iter()
        .map(|Joined { mut row, history }| {
            row.set_history(history);
            row
        })
        .collect()
}

pub fn write_feature_rows(rows: &[FeatureRow], path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    let csv_err = |e: csv::Error| PipelineError::Csv {
        path: path.display().to_string(),
        source: e,
    };
    let mut writer = csv::Writer::from_path(path).map_err(csv_err)?;
    for row in rows {
        writer.serialize(row).map_err(csv_err)?;
    }
    writer.flush().map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    info!("wrote {} feature rows to {}", rows.len(), path.display());
    Ok(())
}

pub fn read_feature_rows(path: &Path) -> Result<Vec<FeatureRow>> {
    let file = File::open(path).map_err(|e| PipelineError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = csv::Reader::from_reader(file);
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<FeatureRow>, _>>()
        .map_err(|e| PipelineError::Csv {
            path: path.display().to_string(),
            source: e,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Circuit, Driver, Race};
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn standing(driver_id: u32, wins: u32, points: f64, position: u32) -> Standing {
        Standing {
            driver_id,
            wins,
            points,
            position,
        }
    }

    fn result(race_id: u32, driver_id: u32, position_order: u32) -> RaceResult {
        RaceResult {
            race_id,
            driver_id,
            grid: Some(position_order),
            position: Some(position_order),
            position_order,
            points: 0.0,
            laps: 61,
            duration_ms: None,
        }
    }

    fn weather(timestamp: i64, temperature: f64) -> WeatherObservation {
        WeatherObservation {
            latitude: 1.3,
            longitude: 103.9,
            temperature,
            pressure: 1008.0,
            humidity: 80.0,
            wind_speed: 4.0,
            timestamp: Some(timestamp),
        }
    }

    fn catalog() -> Catalog {
        Catalog::new(
            vec![Circuit { id: 15, name: "Marina Bay".into(), latitude: 1.29, longitude: 103.86 }],
            vec![Driver { id: 1, surname: "Hamilton".into() }],
            vec![
                Race { race_id: 100, circuit_id: 15, year: 2018, date: Some("2018-09-16".into()) },
                Race { race_id: 101, circuit_id: 15, year: 2019, date: Some("2019-09-22".into()) },
                Race { race_id: 200, circuit_id: 3, year: 2019, date: Some("2019-03-31".into()) },
            ],
            vec![result(100, 1, 1), result(100, 2, 4), result(101, 1, 4), result(200, 1, 2)],
        )
    }

    #[test]
    fn aggregates_per_driver() {
        let standings = vec![
            standing(1, 2, 25.0, 1),
            standing(1, 1, 18.5, 3),
            standing(2, 0, 4.0, 9),
        ];
        let histories = aggregate_histories(&standings);
        assert_eq!(histories.len(), 2);
        let h = &histories[&1];
        assert_eq!(h.total_wins, 3);
        assert_eq!(h.total_points, 43.5);
        assert_eq!(h.average_position, 2.0);
        assert_eq!(histories[&2].average_position, 9.0);
    }

    #[test]
    fn aggregation_ignores_row_order() {
        let mut standings: Vec<Standing> = (0..200)
            .map(|i| standing(7, i % 3, 0.1 * i as f64 + 1e-9 * (i * i) as f64, 1 + i % 20))
            .collect();
        let expected = aggregate_histories(&standings);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..5 {
            standings.shuffle(&mut rng);
            assert_eq!(aggregate_histories(&standings), expected);
        }
    }

    #[test]
    fn left_join_keeps_rows_without_history() {
        let histories = aggregate_histories(&[standing(1, 5, 100.0, 2)]);
        let rows = vec![result(1, 1, 3), result(1, 99, 5), result(2, 1, 1)];
        let joined = left_join(rows, &histories, |r| r.driver_id);
        assert_eq!(joined.len(), 3);
        assert!(joined[0].history.is_some());
        assert!(joined[1].history.is_none());
        assert_eq!(joined[2].history.as_ref().unwrap().total_wins, 5);
    }

    #[test]
    fn circuit_results_carry_race_dates() {
        let results = results_for_circuit(&catalog(), 15);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.result.race_id != 200));
        assert_eq!(driver_positions(&results, 1), vec![1, 4]);
        assert!(driver_positions(&results, 42).is_empty());
    }

    #[test]
    fn combine_matches_on_utc_date_and_drops_duplicates() {
        let results = results_for_circuit(&catalog(), 15);
        // 2018-09-16 twice (identical), 2019-09-22 once, an unrelated day, and no timestamp
        let w = [
            weather(1_537_056_000, 30.0),
            weather(1_537_056_000, 30.0),
            weather(1_569_110_400, 28.0),
            weather(1_500_000_000, 20.0),
            WeatherObservation { timestamp: None, ..weather(0, 25.0) },
        ];
        let refs: Vec<&WeatherObservation> = w.iter().collect();
        let rows = combine_by_date(&results, &refs);
        // race 100 has two drivers, race 101 one
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().filter(|r| r.race_id == 100).all(|r| r.temperature == 30.0));
        assert_eq!(rows.iter().find(|r| r.race_id == 101).unwrap().date, "2019-09-22");
    }

    #[test]
    fn join_histories_fills_columns() {
        let results = results_for_circuit(&catalog(), 15);
        let w = [weather(1_537_056_000, 30.0)];
        let refs: Vec<&WeatherObservation> = w.iter().collect();
        let rows = combine_by_date(&results, &refs);
        let histories = aggregate_histories(&[standing(1, 3, 50.0, 2)]);
        let rows = join_histories(rows, &histories);
        assert_eq!(rows.len(), 2);
        let hamilton = rows.iter().find(|r| r.driver_id == 1).unwrap();
        assert_eq!(hamilton.history().unwrap().total_wins, 3);
        let other = rows.iter().find(|r| r.driver_id == 2).unwrap();
        assert!(other.history().is_none());
        assert_eq!(other.total_points, None);
    }

    #[test]
    fn feature_rows_survive_a_csv_file() {
        let results = results_for_circuit(&catalog(), 15);
        let w = [weather(1_537_056_000, 30.0)];
        let refs: Vec<&WeatherObservation> = w.iter().collect();
        let rows = join_histories(
            combine_by_date(&results, &refs),
            &aggregate_histories(&[standing(1, 3, 50.5, 2)]),
        );
        let path = std::env::temp_dir().join(format!("feature_rows_{}.csv", std::process::id()));
        write_feature_rows(&rows, &path).unwrap();
        let back = read_feature_rows(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, rows);
    }
}
