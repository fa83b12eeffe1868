//! Isolation-forest anomaly scoring.
//!
//! Anomalies isolate in fewer random splits than normal points. The score of
//! a vector is `2^(-E[h(x)] / c(n))`, where `h` is the path length in one tree
//! and `c(n)` the expected unsuccessful-BST-search length for `n` samples.
//! Scores near 1 are anomalous; around 0.5 and below are normal.

use rand::seq::SliceRandom;
use rand::Rng;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Expected path length of an unsuccessful BST search over `n` points.
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

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn build<R: Rng>(samples: &[&[f64]], depth: usize, max_depth: usize, rng: &mut R) -> Node {
        if samples.len() <= 1 || depth >= max_depth {
            return Node::Leaf {
                size: samples.len(),
            };
        }
        let dims = samples.iter().map(|s| s.len()).min().unwrap_or(0);
        if dims == 0 {
            return Node::Leaf {
                size: samples.len(),
            };
        }

        let feature = rng.gen_range(0..dims);
        let (lo, hi) = samples
            .iter()
            .map(|s| s[feature])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        // A span that overflows cannot be sampled uniformly.
        if !(hi > lo) || !(hi - lo).is_finite() {
            return Node::Leaf {
                size: samples.len(),
            };
        }

        let threshold = rng.gen_range(lo..hi);
        let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
            samples.iter().copied().partition(|s| s[feature] < threshold);
        Node::Split {
            feature,
            threshold,
            left: Box::new(Node::build(&left, depth + 1, max_depth, rng)),
            right: Box::new(Node::build(&right, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, point: &[f64], depth: usize) -> f64 {
        match self {
            Node::Leaf { size } => depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let v = point.get(*feature).copied().unwrap_or(0.0);
                if v < *threshold {
                    left.path_length(point, depth + 1)
                } else {
                    right.path_length(point, depth + 1)
                }
            }
        }
    }
}

/// True if every component is a finite number.
pub fn is_finite(features: &[f64]) -> bool {
    features.iter().all(|v| v.is_finite())
}

pub struct IsolationForest {
    trees: Vec<Node>,
    sample_size: usize,
}

impl IsolationForest {
    /// Fit `tree_count` trees, each on a random subsample of at most
    /// `sample_size` vectors. Vectors with NaN or infinite components are
    /// ignored. Returns `None` with fewer than two usable samples.
    pub fn fit<R: Rng>(
        samples: &[Vec<f64>],
        tree_count: usize,
        sample_size: usize,
        rng: &mut R,
    ) -> Option<Self> {
        let all: Vec<&[f64]> = samples
            .iter()
            .map(Vec::as_slice)
            .filter(|s| is_finite(s))
            .collect();
        if all.len() < 2 || tree_count == 0 {
            return None;
        }
        let sample_size = sample_size.clamp(2, all.len());
        let max_depth = (sample_size as f64).log2().ceil() as usize;

        let trees = (0..tree_count)
            .map(|_| {
                let subsample: Vec<&[f64]> =
                    all.choose_multiple(&mut *rng, sample_size).copied().collect();
                Node::build(&subsample, 0, max_depth, &mut *rng)
            })
            .collect();
        Some(Self { trees, sample_size })
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    /// Anomaly score in `0.0..=1.0`.
    pub fn score(&self, point: &[f64]) -> f64 {
        let mean_path = self
            .trees
            .iter()
            .map(|t| t.path_length(point, 0))
            .sum::<f64>()
            / self.trees.len() as f64;
        let c = average_path_length(self.sample_size);
        if c == 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }
}
