// Command-line entry point. Each subcommand is one step of the pipeline:
// weather extract, combined feature table, model training, and the two
// kinds of prediction.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use weather_predict::config::{self, Config};
use weather_predict::data::{CachePolicy, DataCache};
use weather_predict::geo::{self, Sampling};
use weather_predict::history;
use weather_predict::model::{self, ModelArtifact, NamedFeatures, TrainedModelAdapter, TrainingParams};
use weather_predict::predictor::{PredictionSession, WeatherControls};
use weather_predict::PipelineError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Weather-conditioned finishing position predictions", long_about = None)]
struct Cli {
    /// TOML configuration; built-in defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Zip the weather observed around a circuit.
    Extract {
        #[arg(long)]
        circuit: String,
        /// Overrides `geo.margin`.
        #[arg(long)]
        margin: Option<f64>,
        /// Directory for the archive; defaults to `data.output_dir`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Join a circuit's results with race-day weather and driver history.
    Combine {
        #[arg(long)]
        circuit: String,
        #[arg(long)]
        output: PathBuf,
    },
    /// Fit the position model on a combined feature table.
    Train {
        #[arg(long)]
        input: PathBuf,
        /// Overrides `model.artifact`.
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Heuristic prediction for a driver at a circuit. Weather values
    /// default to the circuit's averages.
    Predict {
        #[arg(long)]
        circuit: String,
        #[arg(long)]
        driver: String,
        #[arg(long)]
        temperature: Option<f64>,
        #[arg(long)]
        pressure: Option<f64>,
        #[arg(long)]
        humidity: Option<f64>,
        #[arg(long)]
        wind_speed: Option<f64>,
    },
    /// Trained-model estimate for a driver starting from a grid slot.
    Estimate {
        #[arg(long)]
        artifact: Option<PathBuf>,
        #[arg(long)]
        driver: String,
        #[arg(long)]
        grid: u32,
        #[arg(long)]
        temperature: f64,
        #[arg(long)]
        humidity: f64,
        #[arg(long)]
        wind_speed: f64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing() {
        eprintln!("warning: logging disabled: {e:#}");
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<PipelineError>() {
            // The pipeline never invents a value; say so plainly.
            Some(err) => {
                println!("no data available: {err}");
                ExitCode::from(2)
            }
            None => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => config::load_config(path).context("failed to load configuration")?,
        None => Config::default(),
    };
    let mut cache = DataCache::new(CachePolicy::LoadOnce);

    match cli.command {
        Command::Extract {
            circuit,
            margin,
            output,
        } => {
            let catalog = cache.catalog(&config.data)?;
            let weather = cache.weather.get(&config.data.weather)?;
            let sampling = Sampling::new(config.geo.sample_fraction, config.geo.sampling_seed())?;
            let margin = margin.unwrap_or(config.geo.margin);

            let extract = geo::extract_circuit_weather(&catalog, &weather, &circuit, margin, sampling)?;
            let dir = output.unwrap_or_else(|| config.data.output_dir.clone());
            let path = geo::write_extract(&extract, &dir)?;
            println!("{} weather rows for {} -> {}", extract.rows, circuit, path.display());
        }

        Command::Combine { circuit, output } => {
            let catalog = cache.catalog(&config.data)?;
            let weather = cache.weather.get(&config.data.weather)?;
            let standings = cache.standings.get(&config.data.driver_standings)?;

            let circuit_id = catalog.circuit_by_name(&circuit)?.id;
            let nearby = geo::circuit_weather(&catalog, &weather, &circuit, config.geo.margin)?;
            let results = history::results_for_circuit(&catalog, circuit_id);
            let combined = history::combine_by_date(&results, &nearby);
            if combined.is_empty() {
                return Err(PipelineError::no_data(format!(
                    "no race day at {circuit} has matching weather"
                ))
                .into());
            }
            let histories = history::aggregate_histories(&standings);
            let rows = history::join_histories(combined, &histories);
            history::write_feature_rows(&rows, &output)?;
            println!("{} combined rows -> {}", rows.len(), output.display());
        }

        Command::Train { input, artifact } => {
            let rows = history::read_feature_rows(&input)?;
            info!("read {} feature rows from {}", rows.len(), input.display());
            let params = TrainingParams::from(&config.model);
            let (forest, report) = model::train(&rows, &params)?;

            println!(
                "trained {} trees on {} rows ({} held out, {} dropped)",
                forest.n_trees(),
                report.train_rows,
                report.test_rows,
                report.dropped_rows
            );
            println!("RMSE: {:.3}", report.rmse);
            if let Some(baseline) = report.baseline_rmse {
                println!("linear baseline RMSE: {:.3}", baseline);
            }
            println!("feature importance:");
            for (name, importance) in &report.importances {
                println!("  {:18} {:.4}", name, importance);
            }

            let path = artifact.unwrap_or_else(|| config.model.artifact.clone());
            ModelArtifact::new(forest, &report)?.save(&path)?;
            println!("model -> {}", path.display());
        }

        Command::Predict {
            circuit,
            driver,
            temperature,
            pressure,
            humidity,
            wind_speed,
        } => {
            let catalog = cache.catalog(&config.data)?;
            let weather = cache.weather.get(&config.data.weather)?;
            let mut session = PredictionSession::new(&catalog, &weather, config.geo.margin);
            let selection = session.select(&circuit, &driver)?;

            let means = selection.weather.means();
            let requested = WeatherControls {
                temperature: temperature.unwrap_or(means.temperature),
                pressure: pressure.unwrap_or(means.pressure),
                humidity: humidity.unwrap_or(means.humidity),
                wind_speed: wind_speed.unwrap_or(means.wind_speed),
            };
            let controls = selection.weather.clamp_controls(requested);
            if controls != requested {
                info!("weather controls pinned to the observed range: {:?}", controls);
            }
            let position = selection.predict(&controls)?;

            println!(
                "{} at {}: mean finish {:.2} over {} races",
                driver, circuit, selection.baseline, selection.races
            );
            println!(
                "weather: {:.1} °C, {:.1} hPa, {:.0} %, {:.1} km/h (averages {:.1}, {:.1}, {:.0}, {:.1})",
                controls.temperature,
                controls.pressure,
                controls.humidity,
                controls.wind_speed,
                means.temperature,
                means.pressure,
                means.humidity,
                means.wind_speed
            );
            println!("predicted position: {}", position.get());
        }

        Command::Estimate {
            artifact,
            driver,
            grid,
            temperature,
            humidity,
            wind_speed,
        } => {
            let path = artifact.unwrap_or_else(|| config.model.artifact.clone());
            let adapter = TrainedModelAdapter::from_artifact(ModelArtifact::load(&path)?)?;

            let catalog = cache.catalog(&config.data)?;
            let driver_id = catalog.driver_by_surname(&driver)?.id;
            let standings = cache.standings.get(&config.data.driver_standings)?;
            let histories = history::aggregate_histories(&standings);
            let record = histories
                .get(&driver_id)
                .ok_or_else(|| PipelineError::no_data(format!("no standings for {driver}")))?;
            println!(
                "{}: {} wins, {:.1} points, average position {:.2}",
                driver, record.total_wins, record.total_points, record.average_position
            );

            let features = NamedFeatures::for_driver(temperature, wind_speed, humidity, grid, record);
            let estimate = adapter.predict(&features)?;
            let position = adapter.predict_position(&features)?;
            println!("estimated finish: {:.2} (position {})", estimate, position.get());
        }
    }
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("weather_predict=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
