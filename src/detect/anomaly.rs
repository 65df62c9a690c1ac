//! Isolation-forest anomaly scoring over time buckets.
//!
//! Each tree recursively partitions a random subsample on a random feature at
//! a uniform random threshold. Points that are easy to separate end up at
//! shallow depth; the score is `2^(-E[h(x)] / c(n))`, so shorter average
//! paths give higher scores and a point no tree can separate scores 0.5.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::analysis::TimeBucket;
use crate::config::ModelConfig;
use crate::detect::DetectError;

/// Number of features per bucket.
pub const FEATURES: usize = 4;

/// Replacement for NaN / infinite feature values.
pub const NON_FINITE_SENTINEL: f64 = 1.0e12;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

pub type FeatureVector = [f64; FEATURES];

fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else if value == f64::NEG_INFINITY {
        -NON_FINITE_SENTINEL
    } else {
        NON_FINITE_SENTINEL
    }
}

pub fn sanitize_features(features: FeatureVector) -> FeatureVector {
    features.map(sanitize)
}

/// Expected path length of an unsuccessful BST search among `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn build(points: &[FeatureVector], sample: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.grow(points, sample, 0, max_depth, rng);
        tree
    }

    fn grow(
        &mut self,
        points: &[FeatureVector],
        sample: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node::Leaf { size: sample.len() });

        if sample.len() <= 1 || depth >= max_depth {
            return id;
        }

        // Only features that still vary inside this node can split it.
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(FEATURES);
        for feature in 0..FEATURES {
            let (lo, hi) = sample.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = points[i][feature];
                (lo.min(v), hi.max(v))
            });
            if lo < hi {
                candidates.push((feature, lo, hi));
            }
        }
        if candidates.is_empty() {
            return id;
        }

        let (feature, lo, hi) = candidates[rng.gen_range(0..candidates.len())];
        let threshold = rng.gen_range(lo..hi);
        // `lo <= threshold < hi` keeps both sides non-empty.
        let (left_sample, right_sample): (Vec<usize>, Vec<usize>) =
            sample.into_iter().partition(|&i| points[i][feature] <= threshold);

        let left = self.grow(points, left_sample, depth + 1, max_depth, rng);
        let right = self.grow(points, right_sample, depth + 1, max_depth, rng);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn path_length(&self, point: &FeatureVector) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes[node] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if point[feature] <= threshold { left } else { right };
                    depth += 1.0;
                }
                Node::Leaf { size } => return depth + average_path_length(size),
            }
        }
    }
}

/// A fitted ensemble of isolation trees.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit on `points` (already sanitized). Deterministic for a given seed.
    pub fn fit(points: &[FeatureVector], params: &ModelConfig) -> Result<Self, DetectError> {
        if params.trees == 0 {
            return Err(DetectError::InvalidParameter {
                name: "trees",
                reason: "need at least one tree".to_string(),
            });
        }
        if points.len() < 2 {
            return Err(DetectError::InvalidParameter {
                name: "points",
                reason: format!("need at least 2 points to fit, got {}", points.len()),
            });
        }

        let sample_size = params.max_samples.max(2).min(points.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(params.seed);

        let trees = (0..params.trees)
            .map(|_| {
                let sample = index::sample(&mut rng, points.len(), sample_size).into_vec();
                IsolationTree::build(points, sample, max_depth, &mut rng)
            })
            .collect();

        Ok(Self { trees, sample_size })
    }

    pub fn score(&self, point: &FeatureVector) -> f64 {
        let point = sanitize_features(*point);
        let mean_path = self.trees.iter().map(|t| t.path_length(&point)).sum::<f64>()
            / self.trees.len() as f64;
        (2.0f64).powf(-mean_path / average_path_length(self.sample_size))
    }
}

/// Linear-interpolated quantile of `values` at `q` in `[0, 1]`.
fn quantile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Scores a bucket series in place.
#[derive(Debug, Clone)]
pub struct AnomalyScorer {
    params: ModelConfig,
    min_history: usize,
}

impl AnomalyScorer {
    pub fn new(params: ModelConfig, min_history: usize) -> Result<Self, DetectError> {
        if params.trees == 0 {
            return Err(DetectError::InvalidParameter {
                name: "trees",
                reason: "need at least one tree".to_string(),
            });
        }
        if !(params.contamination > 0.0 && params.contamination <= 0.5) {
            return Err(DetectError::InvalidParameter {
                name: "contamination",
                reason: format!("{} is outside (0, 0.5]", params.contamination),
            });
        }
        Ok(Self {
            params,
            min_history: min_history.max(2),
        })
    }

    /// Assign `anomaly_score` and `outlier` to every bucket.
    ///
    /// With fewer than `min_history` non-empty buckets every score is 0.
    /// Otherwise the forest is fitted on the span from the first non-empty
    /// bucket to the newest one; leading empty buckets score 0. Returns the
    /// contamination-derived outlier threshold when a model was fitted.
    pub fn score(&self, buckets: &mut [TimeBucket]) -> Option<f64> {
        for bucket in buckets.iter_mut() {
            bucket.anomaly_score = 0.0;
            bucket.outlier = false;
        }

        let non_empty = buckets.iter().filter(|b| !b.is_empty()).count();
        if non_empty < self.min_history {
            debug!(non_empty, needed = self.min_history, "insufficient history, skipping model");
            return None;
        }
        let first = buckets.iter().position(|b| !b.is_empty())?;
        let span = &mut buckets[first..];

        let points: Vec<FeatureVector> = span.iter().map(|b| sanitize_features(b.features())).collect();
        let forest = match IsolationForest::fit(&points, &self.params) {
            Ok(forest) => forest,
            Err(e) => {
                warn!(error = %e, "anomaly model fit failed, scoring all buckets 0");
                return None;
            }
        };

        let scores: Vec<f64> = points.iter().map(|p| forest.score(p)).collect();
        let threshold = quantile(&scores, 1.0 - self.params.contamination);
        for (bucket, score) in span.iter_mut().zip(&scores) {
            bucket.anomaly_score = *score;
            bucket.outlier = *score > threshold;
        }

        debug!(points = points.len(), threshold, "anomaly model fitted");
        Some(threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn bucket(i: i64, attempts: u64, failures: u64, latency: f64) -> TimeBucket {
        TimeBucket {
            start: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(i),
            attempts,
            failures,
            mean_latency_ms: latency,
            fail_rate: crate::analysis::fail_rate(failures, attempts),
            anomaly_score: 0.0,
            outlier: false,
        }
    }

    /// ~20 attempts/minute, 10-20% failures, ~90ms, with a deterministic wobble.
    fn baseline(n: i64) -> Vec<TimeBucket> {
        (0..n)
            .map(|i| {
                let attempts = 18 + (i * 7 % 5) as u64;
                let failures = 2 + (i * 2 % 3) as u64;
                bucket(i, attempts, failures, 85.0 + (i * 11 % 10) as f64)
            })
            .collect()
    }

    fn scorer() -> AnomalyScorer {
        AnomalyScorer::new(ModelConfig::default(), 10).unwrap()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        let c256 = average_path_length(256);
        assert!((c256 - 10.24).abs() < 0.01, "c(256) = {c256}");
    }

    #[test]
    fn test_insufficient_history_scores_zero() {
        let mut buckets = baseline(9);
        buckets.extend((9..60).map(|i| bucket(i, 0, 0, 0.0)));
        buckets[3].attempts = 900;

        assert_eq!(scorer().score(&mut buckets), None);
        assert!(buckets.iter().all(|b| b.anomaly_score == 0.0 && !b.outlier));
    }

    #[test]
    fn test_spike_scores_above_cutoff() {
        let mut buckets = baseline(15);
        buckets[12] = bucket(12, 500, 300, 160.0);

        let threshold = scorer().score(&mut buckets).expect("model should fit");
        let spike = buckets[12].anomaly_score;
        assert!(spike > 0.6, "spike score {spike}");
        for (i, b) in buckets.iter().enumerate() {
            if i != 12 {
                assert!(b.anomaly_score < spike, "bucket {i} scored {}", b.anomaly_score);
            }
        }
        assert!(buckets[12].outlier);
        assert!(threshold < spike);
    }

    #[test]
    fn test_deterministic_for_fixed_seed() {
        let mut a = baseline(30);
        a[20] = bucket(20, 200, 150, 300.0);
        let mut b = a.clone();

        scorer().score(&mut a);
        scorer().score(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_leading_empty_buckets_not_fitted() {
        let mut buckets: Vec<TimeBucket> = (0..20).map(|i| bucket(i, 0, 0, 0.0)).collect();
        buckets.extend(baseline(20).into_iter().map(|mut b| {
            b.start += Duration::minutes(20);
            b
        }));

        scorer().score(&mut buckets);
        assert!(buckets[..20].iter().all(|b| b.anomaly_score == 0.0));
        assert!(buckets[20..].iter().all(|b| b.anomaly_score > 0.0));
    }

    #[test]
    fn test_non_finite_features_are_total() {
        let mut buckets = baseline(12);
        buckets[4].mean_latency_ms = f64::NAN;
        buckets[5].fail_rate = f64::INFINITY;
        buckets[6].mean_latency_ms = f64::NEG_INFINITY;

        scorer().score(&mut buckets);
        assert!(buckets.iter().all(|b| b.anomaly_score.is_finite() && b.anomaly_score >= 0.0));
    }

    #[test]
    fn test_constant_series_scores_half() {
        let mut buckets: Vec<TimeBucket> = (0..12).map(|i| bucket(i, 20, 2, 90.0)).collect();
        scorer().score(&mut buckets);
        for b in &buckets {
            assert!((b.anomaly_score - 0.5).abs() < 1e-12);
            assert!(!b.outlier);
        }
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let mut params = ModelConfig::default();
        params.trees = 0;
        assert!(AnomalyScorer::new(params, 10).is_err());

        let mut params = ModelConfig::default();
        params.contamination = 0.9;
        assert!(AnomalyScorer::new(params, 10).is_err());

        assert!(IsolationForest::fit(&[[0.0; FEATURES]], &ModelConfig::default()).is_err());
    }

    #[test]
    fn test_quantile_interpolates() {
        let v = [4.0, 1.0, 3.0, 2.0];
        assert_eq!(quantile(&v, 0.0), 1.0);
        assert_eq!(quantile(&v, 1.0), 4.0);
        assert!((quantile(&v, 0.5) - 2.5).abs() < 1e-12);
    }
}
