//! Collaborative Filtering Model
//!
//! Biased latent-factor rating predictor over an accumulated user × item
//! matrix. A trained model is an immutable snapshot: retraining builds a new
//! snapshot from the merged matrix and [`ModelSlot`] swaps it in, so readers
//! never observe a half-fitted model.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::RatingTriple;
use crate::config::MlConfig;

use super::metrics::PerformanceTimer;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("model has not been trained yet")]
    NotTrained,

    #[error("no usable ratings to fit")]
    EmptyMatrix,

    #[error("fit diverged (non-finite parameters)")]
    Diverged,
}

/// Hyper-parameters for the SGD fit
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub factors: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub regularization: f64,
    pub rating_min: f64,
    pub rating_max: f64,
    pub seed: u64,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self::from(&MlConfig::default())
    }
}

impl From<&MlConfig> for ModelParams {
    fn from(config: &MlConfig) -> Self {
        Self {
            factors: config.factors,
            epochs: config.epochs,
            learning_rate: config.learning_rate,
            regularization: config.regularization,
            rating_min: config.rating_min,
            rating_max: config.rating_max,
            seed: config.seed,
        }
    }
}

/// Accumulated ratings keyed by `(user, item)`; a later write replaces the cell
#[derive(Debug, Clone, Default)]
pub struct RatingMatrix {
    cells: BTreeMap<(String, String), f64>,
}

impl RatingMatrix {
    pub fn merge(&mut self, triples: &[RatingTriple]) {
        for triple in triples {
            self.cells
                .insert((triple.user_id.clone(), triple.item_id.clone()), triple.rate);
        }
    }

    pub fn get(&self, user_id: &str, item_id: &str) -> Option<f64> {
        self.cells
            .get(&(user_id.to_string(), item_id.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn users(&self) -> BTreeSet<&str> {
        self.cells.keys().map(|(user, _)| user.as_str()).collect()
    }

    pub fn items(&self) -> BTreeSet<&str> {
        self.cells.keys().map(|(_, item)| item.as_str()).collect()
    }

    /// Items the user has a rating for
    pub fn seen_by(&self, user_id: &str) -> HashSet<&str> {
        let start = (user_id.to_string(), String::new());
        self.cells
            .range(start..)
            .take_while(|((user, _), _)| user == user_id)
            .map(|((_, item), _)| item.as_str())
            .collect()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.cells
            .iter()
            .map(|((user, item), rate)| (user.as_str(), item.as_str(), *rate))
    }
}

/// Fitted parameters: `mu + b_u + b_i + p_u · q_i`
#[derive(Debug, Clone)]
struct Factors {
    global_mean: f64,
    user_index: HashMap<String, usize>,
    item_index: HashMap<String, usize>,
    user_bias: Vec<f64>,
    item_bias: Vec<f64>,
    user_factors: Vec<Vec<f64>>,
    item_factors: Vec<Vec<f64>>,
}

impl Factors {
    fn fit(matrix: &RatingMatrix, params: &ModelParams) -> Result<Self, ModelError> {
        if matrix.is_empty() {
            return Err(ModelError::EmptyMatrix);
        }

        let user_index: HashMap<String, usize> = matrix
            .users()
            .into_iter()
            .enumerate()
            .map(|(idx, user)| (user.to_string(), idx))
            .collect();
        let item_index: HashMap<String, usize> = matrix
            .items()
            .into_iter()
            .enumerate()
            .map(|(idx, item)| (item.to_string(), idx))
            .collect();

        let cells: Vec<(usize, usize, f64)> = matrix
            .iter()
            .map(|(user, item, rate)| (user_index[user], item_index[item], rate))
            .collect();

        let global_mean = cells.iter().map(|(_, _, r)| r).sum::<f64>() / cells.len() as f64;

        let mut rng = StdRng::seed_from_u64(params.seed);
        let k = params.factors;
        let mut init = |n: usize| -> Vec<Vec<f64>> {
            (0..n)
                .map(|_| (0..k).map(|_| rng.gen_range(-0.1..0.1)).collect())
                .collect()
        };
        let mut user_factors = init(user_index.len());
        let mut item_factors = init(item_index.len());
        let mut user_bias = vec![0.0; user_index.len()];
        let mut item_bias = vec![0.0; item_index.len()];

        let lr = params.learning_rate;
        let reg = params.regularization;

        for _ in 0..params.epochs {
            for &(u, i, rate) in &cells {
                let dot: f64 = user_factors[u]
                    .iter()
                    .zip(&item_factors[i])
                    .map(|(p, q)| p * q)
                    .sum();
                let err = rate - (global_mean + user_bias[u] + item_bias[i] + dot);

                user_bias[u] += lr * (err - reg * user_bias[u]);
                item_bias[i] += lr * (err - reg * item_bias[i]);

                for f in 0..k {
                    let p = user_factors[u][f];
                    let q = item_factors[i][f];
                    user_factors[u][f] += lr * (err * q - reg * p);
                    item_factors[i][f] += lr * (err * p - reg * q);
                }
            }
        }

        let finite = global_mean.is_finite()
            && user_bias.iter().chain(&item_bias).all(|v| v.is_finite())
            && user_factors
                .iter()
                .chain(&item_factors)
                .all(|row| row.iter().all(|v| v.is_finite()));
        if !finite {
            return Err(ModelError::Diverged);
        }

        Ok(Self {
            global_mean,
            user_index,
            item_index,
            user_bias,
            item_bias,
            user_factors,
            item_factors,
        })
    }

    /// Unknown user or item contributes no bias and no interaction term
    fn estimate(&self, user_id: &str, item_id: &str) -> f64 {
        let user = self.user_index.get(user_id).copied();
        let item = self.item_index.get(item_id).copied();

        let mut estimate = self.global_mean;
        if let Some(u) = user {
            estimate += self.user_bias[u];
        }
        if let Some(i) = item {
            estimate += self.item_bias[i];
        }
        if let (Some(u), Some(i)) = (user, item) {
            estimate += self.user_factors[u]
                .iter()
                .zip(&self.item_factors[i])
                .map(|(p, q)| p * q)
                .sum::<f64>();
        }
        estimate
    }
}

/// Immutable model snapshot: accumulated matrix plus (optionally) a fit
#[derive(Debug, Clone)]
pub struct CollaborativeModel {
    params: ModelParams,
    matrix: RatingMatrix,
    factors: Option<Arc<Factors>>,
}

impl CollaborativeModel {
    pub fn new(params: ModelParams) -> Self {
        Self {
            params,
            matrix: RatingMatrix::default(),
            factors: None,
        }
    }

    /// Merge `triples` into a copy of the matrix and fit a new snapshot over
    /// the whole accumulated matrix. `self` is left untouched.
    pub fn retrained(&self, triples: &[RatingTriple]) -> Result<Self, ModelError> {
        let mut matrix = self.matrix.clone();
        matrix.merge(triples);
        let factors = Factors::fit(&matrix, &self.params)?;
        Ok(Self {
            params: self.params.clone(),
            matrix,
            factors: Some(Arc::new(factors)),
        })
    }

    pub fn is_trained(&self) -> bool {
        self.factors.is_some()
    }

    /// Predicted rating clamped to the rating scale. Pairs absent from
    /// training get the baseline estimate.
    pub fn predict_rating(&self, user_id: &str, item_id: &str) -> Result<f64, ModelError> {
        let factors = self.factors.as_ref().ok_or(ModelError::NotTrained)?;
        Ok(factors
            .estimate(user_id, item_id)
            .clamp(self.params.rating_min, self.params.rating_max))
    }

    /// Top `top_n` items by predicted rating; ties go to the smaller item id.
    /// Without `include_seen` the user's already rated items are skipped.
    pub fn recommend(
        &self,
        user_id: &str,
        top_n: usize,
        include_seen: bool,
    ) -> Result<Vec<(String, f64)>, ModelError> {
        if !self.is_trained() {
            return Err(ModelError::NotTrained);
        }

        let seen = if include_seen {
            HashSet::new()
        } else {
            self.matrix.seen_by(user_id)
        };
        let candidates: Vec<&str> = self
            .matrix
            .items()
            .into_iter()
            .filter(|item| !seen.contains(item))
            .collect();

        let mut scored: Vec<(String, f64)> = candidates
            .par_iter()
            .map(|item| {
                self.predict_rating(user_id, item)
                    .map(|score| (item.to_string(), score))
            })
            .collect::<Result<_, _>>()?;

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_n);
        Ok(scored)
    }

    /// Effective accumulated rating for a cell
    pub fn rating(&self, user_id: &str, item_id: &str) -> Option<f64> {
        self.matrix.get(user_id, item_id)
    }

    pub fn user_count(&self) -> usize {
        self.matrix.users().len()
    }

    pub fn item_count(&self) -> usize {
        self.matrix.items().len()
    }
}

/// Owned slot holding the current model snapshot
pub struct ModelSlot {
    name: &'static str,
    current: RwLock<Arc<CollaborativeModel>>,
    train_lock: Mutex<()>,
}

impl ModelSlot {
    pub fn new(name: &'static str, params: ModelParams) -> Self {
        Self {
            name,
            current: RwLock::new(Arc::new(CollaborativeModel::new(params))),
            train_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The snapshot in effect right now
    pub fn snapshot(&self) -> Arc<CollaborativeModel> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fit a new snapshot from the current one plus `triples`, then swap it
    /// in. Empty input is a no-op. On failure the current snapshot stays.
    /// Returns whether the slot holds a trained model afterwards.
    pub fn train(&self, triples: &[RatingTriple]) -> Result<bool, ModelError> {
        // Serialise writers so no merge is lost between concurrent trains
        let _guard = match self.train_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let base = self.snapshot();
        if triples.is_empty() {
            debug!("{} model: no triples, training skipped", self.name);
            return Ok(base.is_trained());
        }

        let _timer = PerformanceTimer::new(self.name);
        let next = match base.retrained(triples) {
            Ok(next) => next,
            Err(e) => {
                warn!("{} model training failed: {}", self.name, e);
                return Err(e);
            }
        };

        info!(
            "{} model trained: {} users, {} items, {} ratings",
            self.name,
            next.user_count(),
            next.item_count(),
            next.matrix.len()
        );

        let next = Arc::new(next);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(true)
    }
}
