use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::history::{DriverHistory, FeatureRow};
use crate::predictor::Position;
use chrono::{DateTime, Utc};
use linfa::prelude::*;
use linfa::traits::PredictInplace;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix1, Ix2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{debug, info, warn};

/// Feature matrix with one finishing position per row.
pub type PositionDataset = Dataset<f64, f64, Ix1>;

/// Training-time column order of the position model.
pub const FEATURE_NAMES: [&str; 7] = [
    "temperature",
    "wind_speed",
    "humidity",
    "grid",
    "total_wins",
    "total_points",
    "average_position",
];

/// Below this many usable rows an 80/20 split says nothing.
pub const MIN_TRAINING_ROWS: usize = 10;

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Feature values keyed by name. Models look values up by name, so the order
/// in which they were inserted never matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamedFeatures(BTreeMap<String, f64>);

impl NamedFeatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The seven model inputs for one driver, grid slot and weather.
    pub fn for_driver(
        temperature: f64,
        wind_speed: f64,
        humidity: f64,
        grid: u32,
        history: &DriverHistory,
    ) -> Self {
        Self::new()
            .with("temperature", temperature)
            .with("wind_speed", wind_speed)
            .with("humidity", humidity)
            .with("grid", f64::from(grid))
            .with("total_wins", f64::from(history.total_wins))
            .with("total_points", history.total_points)
            .with("average_position", history.average_position)
    }

    /// `None` when the row has no grid slot or no driver history.
    pub fn from_row(row: &FeatureRow) -> Option<Self> {
        let history = row.history()?;
        Some(Self::for_driver(
            row.temperature,
            row.wind_speed,
            row.humidity,
            row.grid?,
            &history,
        ))
    }
}

/// Ordered feature names a model was trained on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(PipelineError::schema("features", "empty feature schema"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(PipelineError::schema("features", format!("duplicate feature `{dup}`")));
        }
        Ok(Self { names })
    }

    pub fn canonical() -> Self {
        Self {
            names: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Lay `features` out in schema order. Every schema name must be present;
    /// names the schema does not know are ignored.
    pub fn arrange(&self, features: &NamedFeatures) -> Result<Vec<f64>> {
        let missing: Vec<&str> = self
            .names
            .iter()
            .filter(|n| features.get(n).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::schema(
                "features",
                format!("missing feature(s): {}", missing.join(", ")),
            ));
        }
        Ok(self.names.iter().filter_map(|n| features.get(n)).collect())
    }

    fn unknown<'a>(&self, features: &'a NamedFeatures) -> Vec<&'a str> {
        features
            .names()
            .filter(|n| !self.names.iter().any(|s| s == n))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Regression trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: f64,
    },
    /// Rows with `x[feature] <= threshold` go left.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A CART regression tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<Node>,
}

impl RegressionTree {
    fn evaluate(&self, feature: impl Fn(usize) -> f64) -> f64 {
        let mut i = 0;
        loop {
            match &self.nodes[i] {
                Node::Leaf { value } => return *value,
                Node::Split {
                    feature: f,
                    threshold,
                    left,
                    right,
                } => i = if feature(*f) <= *threshold { *left } else { *right },
            }
        }
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], i: usize) -> usize {
            match &nodes[i] {
                Node::Leaf { .. } => 0,
                Node::Split { left, right, .. } => 1 + walk(nodes, *left).max(walk(nodes, *right)),
            }
        }
        walk(&self.nodes, 0)
    }

    fn is_well_formed(&self, n_features: usize) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().all(|n| match n {
                Node::Leaf { value } => value.is_finite(),
                Node::Split {
                    feature,
                    left,
                    right,
                    ..
                } => *feature < n_features && *left < self.nodes.len() && *right < self.nodes.len(),
            })
    }
}

struct TreeBuilder<'a> {
    x: ArrayView2<'a, f64>,
    y: &'a Array1<f64>,
    max_depth: Option<usize>,
    min_samples_split: usize,
    nodes: Vec<Node>,
    // Sum of squared-error reductions per feature.
    gains: Vec<f64>,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    left_len: usize,
    sse: f64,
}

fn mean_and_sse(idx: &[usize], y: &Array1<f64>) -> (f64, f64) {
    let n = idx.len() as f64;
    let sum: f64 = idx.iter().map(|&i| y[i]).sum();
    let sum_sq: f64 = idx.iter().map(|&i| y[i] * y[i]).sum();
    (sum / n, (sum_sq - sum * sum / n).max(0.0))
}

impl<'a> TreeBuilder<'a> {
    fn grow(&mut self, idx: &mut [usize], depth: usize) -> usize {
        let (mean, parent_sse) = mean_and_sse(idx, self.y);
        let node = self.nodes.len();
        self.nodes.push(Node::Leaf { value: mean });

        let depth_left = self.max_depth.map_or(true, |d| depth < d);
        if idx.len() < self.min_samples_split || !depth_left || parent_sse <= f64::EPSILON {
            return node;
        }
        let Some(best) = self.best_split(idx) else {
            return node;
        };
        let gain = parent_sse - best.sse;
        if gain <= f64::EPSILON {
            return node;
        }
        self.gains[best.feature] += gain;

        let x = self.x;
        idx.sort_by(|&a, &b| x[[a, best.feature]].total_cmp(&x[[b, best.feature]]));
        let (left_idx, right_idx) = idx.split_at_mut(best.left_len);
        let left = self.grow(left_idx, depth + 1);
        let right = self.grow(right_idx, depth + 1);
        self.nodes[node] = Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left,
            right,
        };
        node
    }

    fn best_split(&self, idx: &mut [usize]) -> Option<BestSplit> {
        let n = idx.len();
        let x = self.x;
        let y = self.y;
        let total: f64 = idx.iter().map(|&i| y[i]).sum();
        let total_sq: f64 = idx.iter().map(|&i| y[i] * y[i]).sum();

        let mut best: Option<BestSplit> = None;
        for f in 0..x.ncols() {
            idx.sort_by(|&a, &b| x[[a, f]].total_cmp(&x[[b, f]]));
            let mut sum_l = 0.0;
            let mut sq_l = 0.0;
            for split in 1..n {
                let prev = idx[split - 1];
                sum_l += y[prev];
                sq_l += y[prev] * y[prev];
                let (lo, hi) = (x[[prev, f]], x[[idx[split], f]]);
                if lo >= hi {
                    continue;
                }
                let n_l = split as f64;
                let n_r = (n - split) as f64;
                let sum_r = total - sum_l;
                let sq_r = total_sq - sq_l;
                let cost = (sq_l - sum_l * sum_l / n_l) + (sq_r - sum_r * sum_r / n_r);
                if best.as_ref().map_or(true, |b| cost < b.sse) {
                    best = Some(BestSplit {
                        feature: f,
                        threshold: lo + (hi - lo) / 2.0,
                        left_len: split,
                        sse: cost.max(0.0),
                    });
                }
            }
        }
        best
    }
}

/// Hyper-parameters of a bagged regression-tree ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: Option<usize>,
    pub min_samples_split: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: None,
            min_samples_split: 2,
            seed: 42,
        }
    }
}

impl ForestParams {
    /// Fit one tree per bootstrap resample of `dataset`. Every feature is a
    /// split candidate at every node.
    pub fn fit(&self, dataset: &PositionDataset, schema: &FeatureSchema) -> Result<RegressionForest> {
        let x = dataset.records();
        let y = dataset.targets();
        let n = x.nrows();
        if n == 0 {
            return Err(PipelineError::no_data("empty training set"));
        }
        if x.ncols() != schema.len() {
            return Err(PipelineError::schema(
                "training set",
                format!("{} columns but {} feature names", x.ncols(), schema.len()),
            ));
        }
        if self.n_trees == 0 || self.min_samples_split < 2 {
            return Err(PipelineError::invalid(
                "forest",
                "need at least one tree and min_samples_split >= 2",
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut trees = Vec::with_capacity(self.n_trees);
        let mut importances = vec![0.0; schema.len()];
        for _ in 0..self.n_trees {
            let mut idx: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let mut builder = TreeBuilder {
                x: x.view(),
                y,
                max_depth: self.max_depth,
                min_samples_split: self.min_samples_split,
                nodes: Vec::new(),
                gains: vec![0.0; schema.len()],
            };
            builder.grow(&mut idx, 0);
            let total: f64 = builder.gains.iter().sum();
            if total > 0.0 {
                for (imp, g) in importances.iter_mut().zip(&builder.gains) {
                    *imp += g / total;
                }
            }
            trees.push(RegressionTree {
                nodes: builder.nodes,
            });
        }
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            importances.iter_mut().for_each(|v| *v /= total);
        }
        debug!(
            "fitted {} trees on {} rows, max depth {}",
            trees.len(),
            n,
            trees.iter().map(RegressionTree::depth).max().unwrap_or(0)
        );

        Ok(RegressionForest {
            feature_names: schema.names().to_vec(),
            trees,
            importances,
        })
    }
}

/// Bagged regression trees; the estimate is the mean of the trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionForest {
    feature_names: Vec<String>,
    trees: Vec<RegressionTree>,
    importances: Vec<f64>,
}

impl RegressionForest {
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Impurity-based importances, normalized to sum to 1, highest first.
    pub fn feature_importances(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.importances.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    fn estimate(&self, feature: impl Fn(usize) -> f64 + Copy) -> f64 {
        let sum: f64 = self.trees.iter().map(|t| t.evaluate(feature)).sum();
        sum / self.trees.len() as f64
    }

    fn validate(&self) -> Result<()> {
        let n = self.feature_names.len();
        if self.trees.is_empty() {
            return Err(PipelineError::schema("model", "forest has no trees"));
        }
        if self.importances.len() != n {
            return Err(PipelineError::schema(
                "model",
                format!("{} importances for {} features", self.importances.len(), n),
            ));
        }
        if !self.trees.iter().all(|t| t.is_well_formed(n)) {
            return Err(PipelineError::schema("model", "tree references an unknown feature or node"));
        }
        Ok(())
    }
}

impl<D: Data<Elem = f64>> PredictInplace<ArrayBase<D, Ix2>, Array1<f64>> for RegressionForest {
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<f64>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        for (row, target) in x.rows().into_iter().zip(y.iter_mut()) {
            *target = self.estimate(|f| row[f]);
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<f64> {
        Array1::zeros(x.nrows())
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// A fitted model that maps a feature row, in its own training order, to a
/// continuous finishing-position estimate.
pub trait PositionRegressor {
    fn feature_names(&self) -> &[String];
    fn predict_row(&self, row: &[f64]) -> f64;
}

impl PositionRegressor for RegressionForest {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.estimate(|f| row[f])
    }
}

/// Inference wrapper that feeds a regressor by feature name, never by
/// position, so a reordered or incomplete input fails loudly.
pub struct TrainedModelAdapter<R> {
    regressor: R,
    schema: FeatureSchema,
}

impl<R: PositionRegressor> TrainedModelAdapter<R> {
    pub fn new(regressor: R) -> Result<Self> {
        let schema = FeatureSchema::new(regressor.feature_names().to_vec())?;
        Ok(Self { regressor, schema })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn predict(&self, features: &NamedFeatures) -> Result<f64> {
        let unknown = self.schema.unknown(features);
        if !unknown.is_empty() {
            warn!("ignoring features the model was not trained on: {}", unknown.join(", "));
        }
        let row = self.schema.arrange(features)?;
        if let Some(pos) = row.iter().position(|v| !v.is_finite()) {
            return Err(PipelineError::invalid(
                "features",
                format!("non-finite value for `{}`", self.schema.names()[pos]),
            ));
        }
        Ok(self.regressor.predict_row(&row))
    }

    pub fn predict_position(&self, features: &NamedFeatures) -> Result<Position> {
        Position::from_estimate(self.predict(features)?)
    }
}

impl TrainedModelAdapter<RegressionForest> {
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self> {
        if artifact.schema.names() != artifact.forest.feature_names.as_slice() {
            return Err(PipelineError::schema(
                "model",
                "artifact schema does not match the forest's training columns",
            ));
        }
        Self::new(artifact.forest)
    }
}

// ---------------------------------------------------------------------------
// Training
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingParams {
    pub forest: ForestParams,
    /// Held-out share of the rows.
    pub test_ratio: f64,
    pub seed: u64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            forest: ForestParams::default(),
            test_ratio: 0.2,
            seed: 42,
        }
    }
}

impl From<&ModelConfig> for TrainingParams {
    fn from(c: &ModelConfig) -> Self {
        Self {
            forest: ForestParams {
                n_trees: c.n_trees,
                max_depth: c.max_depth,
                min_samples_split: c.min_samples_split,
                seed: c.seed,
            },
            test_ratio: c.test_ratio,
            seed: c.seed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub usable_rows: usize,
    pub dropped_rows: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub rmse: f64,
    /// Held-out RMSE of an ordinary least-squares fit, when one exists.
    pub baseline_rmse: Option<f64>,
    pub importances: Vec<(String, f64)>,
}

/// Rows with a classified finishing position, a grid slot and a driver
/// history, as a linfa dataset in schema order. Also returns how many rows
/// were dropped.
pub fn training_dataset(rows: &[FeatureRow], schema: &FeatureSchema) -> Result<(PositionDataset, usize)> {
    let mut records = Vec::new();
    let mut targets = Vec::new();
    for row in rows {
        let (Some(position), Some(features)) = (row.position, NamedFeatures::from_row(row)) else {
            continue;
        };
        records.extend(schema.arrange(&features)?);
        targets.push(f64::from(position));
    }
    let usable = targets.len();
    let x = Array2::from_shape_vec((usable, schema.len()), records)
        .map_err(|e| PipelineError::schema("training set", e.to_string()))?;
    Ok((Dataset::new(x, Array1::from_vec(targets)), rows.len() - usable))
}

fn rmse(predicted: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    let diff = predicted - truth;
    diff.mapv(|e| e * e).mean().unwrap_or(f64::NAN).sqrt()
}

/// Shuffle, split, fit the forest and score it on the held-out rows.
pub fn train(rows: &[FeatureRow], params: &TrainingParams) -> Result<(RegressionForest, TrainingReport)> {
    let schema = FeatureSchema::canonical();
    let (dataset, dropped) = training_dataset(rows, &schema)?;
    let usable = dataset.nsamples();
    if usable < MIN_TRAINING_ROWS {
        return Err(PipelineError::no_data(format!(
            "{usable} usable training rows ({dropped} dropped), need at least {MIN_TRAINING_ROWS}"
        )));
    }
    if !(params.test_ratio > 0.0 && params.test_ratio < 1.0) {
        return Err(PipelineError::invalid("test_ratio", format!("{} not in (0, 1)", params.test_ratio)));
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let (train, valid) = dataset
        .shuffle(&mut rng)
        .split_with_ratio((1.0 - params.test_ratio) as f32);
    if train.nsamples() == 0 || valid.nsamples() == 0 {
        return Err(PipelineError::invalid(
            "test_ratio",
            format!("split of {usable} rows left one side empty"),
        ));
    }
    info!(
        "training on {} rows, holding out {} ({} dropped)",
        train.nsamples(),
        valid.nsamples(),
        dropped
    );

    let forest = params.forest.fit(&train, &schema)?;
    let predicted = forest.predict(valid.records());
    let error = rmse(&predicted, valid.targets());
    info!("forest RMSE on held-out rows: {:.3}", error);

    let baseline_rmse = match LinearRegression::new().fit(&train) {
        Ok(linear) => {
            let e = rmse(&linear.predict(valid.records()), valid.targets());
            info!("linear baseline RMSE: {:.3}", e);
            Some(e)
        }
        Err(e) => {
            warn!("linear baseline could not be fitted: {}", e);
            None
        }
    };

    let report = TrainingReport {
        usable_rows: usable,
        dropped_rows: dropped,
        train_rows: train.nsamples(),
        test_rows: valid.nsamples(),
        rmse: error,
        baseline_rmse,
        importances: forest.feature_importances(),
    };
    Ok((forest, report))
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Persisted output of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub schema: FeatureSchema,
    pub forest: RegressionForest,
    pub rmse: f64,
    pub baseline_rmse: Option<f64>,
    pub importances: Vec<(String, f64)>,
    pub trained_at: DateTime<Utc>,
}

impl ModelArtifact {
    pub fn new(forest: RegressionForest, report: &TrainingReport) -> Result<Self> {
        Ok(Self {
            schema: FeatureSchema::new(forest.feature_names.clone())?,
            forest,
            rmse: report.rmse,
            baseline_rmse: report.baseline_rmse,
            importances: report.importances.clone(),
            trained_at: Utc::now(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file = File::create(path).map_err(|e| PipelineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        info!("saved model artifact to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| PipelineError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let artifact: ModelArtifact = serde_json::from_reader(BufReader::new(file))?;
        artifact.forest.validate()?;
        if artifact.schema.len() != artifact.forest.feature_names.len() {
            return Err(PipelineError::schema(
                "model",
                format!(
                    "schema has {} features, forest was trained on {}",
                    artifact.schema.len(),
                    artifact.forest.feature_names.len()
                ),
            ));
        }
        Ok(artifact)
    }
}
