//! Isolation Forest
//!
//! Anomalies are easier to isolate with random axis-aligned splits, so they
//! end up at shorter average path lengths across the ensemble of trees.

use rand::prelude::*;
use rand::rngs::StdRng;
use rand::seq::index;
use serde::{Deserialize, Serialize};

/// Euler–Mascheroni constant used by the path-length normalizer
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Fitted ensemble of isolation trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Rows drawn (without replacement) to grow each tree
    sample_size: usize,
    /// Score above which a row falls in the top `contamination` fraction of
    /// the training data
    threshold: f64,
}

impl IsolationForest {
    /// Grow `num_trees` trees on `rows` (already standardized)
    pub fn fit(
        rows: &[Vec<f64>],
        num_trees: usize,
        max_samples: usize,
        contamination: f64,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let sample_size = max_samples.min(rows.len()).max(1);
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let n_features = rows.first().map(Vec::len).unwrap_or(0);

        let trees = (0..num_trees)
            .map(|_| {
                let picked = index::sample(&mut rng, rows.len(), sample_size.min(rows.len()))
                    .into_vec();
                IsolationTree::build(rows, picked, n_features, max_depth, &mut rng)
            })
            .collect();

        let mut forest = Self {
            trees,
            sample_size,
            threshold: 0.0,
        };
        let train_scores: Vec<f64> = rows.iter().map(|r| forest.score(r)).collect();
        forest.threshold = percentile(&train_scores, 100.0 * (1.0 - contamination));
        forest
    }

    /// Average path length of an unsuccessful BST search over `n` points
    pub fn average_path_length(n: usize) -> f64 {
        match n {
            0 | 1 => 0.0,
            2 => 1.0,
            _ => {
                let n = n as f64;
                2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
            }
        }
    }

    /// Anomaly score in (0, 1]; higher means easier to isolate
    pub fn score(&self, sample: &[f64]) -> f64 {
        let norm = Self::average_path_length(self.sample_size);
        if self.trees.is_empty() || norm == 0.0 {
            return 0.5;
        }
        let mean_path = self
            .trees
            .iter()
            .map(|tree| tree.path_length(sample))
            .sum::<f64>()
            / self.trees.len() as f64;
        2.0_f64.powf(-mean_path / norm)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Every split refers to a feature below `width`
    pub fn is_well_formed(&self, width: usize) -> bool {
        self.sample_size > 0
            && self.threshold.is_finite()
            && self.trees.iter().all(|tree| tree.root.is_well_formed(width))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IsolationTree {
    root: IsolationNode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum IsolationNode {
    Internal {
        feature: usize,
        split: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
    },
}

impl IsolationNode {
    fn is_well_formed(&self, width: usize) -> bool {
        match self {
            IsolationNode::Leaf { .. } => true,
            IsolationNode::Internal {
                feature,
                split,
                left,
                right,
            } => {
                *feature < width
                    && split.is_finite()
                    && left.is_well_formed(width)
                    && right.is_well_formed(width)
            }
        }
    }
}

impl IsolationTree {
    fn build(
        rows: &[Vec<f64>],
        picked: Vec<usize>,
        n_features: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            root: Self::build_node(rows, picked, n_features, 0, max_depth, rng),
        }
    }

    fn build_node(
        rows: &[Vec<f64>],
        picked: Vec<usize>,
        n_features: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> IsolationNode {
        if depth >= max_depth || picked.len() <= 1 || n_features == 0 {
            return IsolationNode::Leaf { size: picked.len() };
        }

        // Try random features until one has spread; give up after as many
        // attempts as there are features.
        for _ in 0..n_features {
            let feature = rng.gen_range(0..n_features);
            let (min, max) = picked.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &i| {
                let v = rows[i][feature];
                (lo.min(v), hi.max(v))
            });
            if max - min <= f64::EPSILON {
                continue;
            }

            let split = rng.gen_range(min..max);
            let (left, right): (Vec<usize>, Vec<usize>) =
                picked.into_iter().partition(|&i| rows[i][feature] < split);
            return IsolationNode::Internal {
                feature,
                split,
                left: Box::new(Self::build_node(rows, left, n_features, depth + 1, max_depth, rng)),
                right: Box::new(Self::build_node(rows, right, n_features, depth + 1, max_depth, rng)),
            };
        }

        IsolationNode::Leaf { size: picked.len() }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0.0;
        loop {
            match node {
                IsolationNode::Leaf { size } => {
                    return depth + IsolationForest::average_path_length(*size);
                }
                IsolationNode::Internal {
                    feature,
                    split,
                    left,
                    right,
                } => {
                    let value = sample.get(*feature).copied().unwrap_or(0.0);
                    node = if value < *split { left } else { right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Percentile with linear interpolation between closest ranks
pub(crate) fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<Vec<f64>> {
        (0..n)
            .map(|i| vec![(i % 10) as f64 / 10.0, (i % 7) as f64 / 7.0])
            .collect()
    }

    #[test]
    fn test_average_path_length() {
        assert_eq!(IsolationForest::average_path_length(1), 0.0);
        assert_eq!(IsolationForest::average_path_length(2), 1.0);
        assert!(IsolationForest::average_path_length(256) > 9.0);
    }

    #[test]
    fn test_forest_training() {
        let forest = IsolationForest::fit(&grid(100), 10, 32, 0.01, 7);
        assert_eq!(forest.num_trees(), 10);
        assert!(forest.threshold() > 0.0 && forest.threshold() <= 1.0);
    }

    #[test]
    fn test_outlier_scores_higher() {
        let rows = grid(200);
        let forest = IsolationForest::fit(&rows, 50, 64, 0.01, 7);
        let normal = forest.score(&[0.5, 0.5]);
        let outlier = forest.score(&[50.0, -50.0]);
        assert!(outlier > normal, "outlier {} normal {}", outlier, normal);
        assert!(outlier > forest.threshold());
    }

    #[test]
    fn test_fit_is_deterministic_per_seed() {
        let rows = grid(64);
        assert_eq!(
            IsolationForest::fit(&rows, 5, 32, 0.01, 3),
            IsolationForest::fit(&rows, 5, 32, 0.01, 3)
        );
    }

    #[test]
    fn test_constant_data_gives_leaves() {
        let rows = vec![vec![1.0, 1.0]; 20];
        let forest = IsolationForest::fit(&rows, 3, 16, 0.01, 1);
        let score = forest.score(&[1.0, 1.0]);
        assert!(score.is_finite());
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[3.0, 1.0, 2.0], 50.0), 2.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
        assert!((percentile(&[0.0, 10.0], 99.0) - 9.9).abs() < 1e-12);
    }
}
