use serde::{Deserialize, Serialize};

use crate::distance::Metric;
use crate::error::{Result, VectorError};

/// All tunables for one index instance. Key–value, never positional:
/// callers either fill the struct directly or feed `(key, value)` string
/// pairs through [`IndexConfig::apply`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub metric: Metric,
    /// Number of posting lists each inserted vector is replicated into.
    pub replication: usize,
    /// A posting list larger than this triggers a local leaf split.
    pub max_cluster_size: usize,
    /// A compacted cluster smaller than this is merged into a neighbor.
    pub min_cluster_size: usize,
    /// Rough cluster-count target for a full build.
    pub target_clusters: usize,
    /// Candidate clusters explored per query.
    pub search_fanout: usize,
    /// Result slots per query (sentinel-padded).
    pub batch_capacity: usize,
    /// Early-termination slack: a cluster is skipped once k results are
    /// held and its centroid distance exceeds `kth_best * (1 + slack)`.
    pub pruning_slack: f32,
    pub kmeans_iters: usize,
    /// Cap on vectors sampled for centroid training.
    pub training_sample: usize,
    /// Minimum candidate clusters before posting fetches go parallel.
    pub parallel_fetch_min: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: Metric::L2,
            replication: 1,
            max_cluster_size: 1024,
            min_cluster_size: 4,
            target_clusters: 256,
            search_fanout: 8,
            batch_capacity: 128,
            pruning_slack: 0.15,
            kmeans_iters: 15,
            training_sample: 200_000,
            parallel_fetch_min: 4,
        }
    }
}

impl IndexConfig {
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key.trim().to_ascii_lowercase().as_str() {
            "metric" => self.metric = value.parse()?,
            "replication" => self.replication = parse_usize(key, value)?,
            "max_cluster_size" => self.max_cluster_size = parse_usize(key, value)?,
            "min_cluster_size" => self.min_cluster_size = parse_usize(key, value)?,
            "target_clusters" => self.target_clusters = parse_usize(key, value)?,
            "search_fanout" => self.search_fanout = parse_usize(key, value)?,
            "batch_capacity" => self.batch_capacity = parse_usize(key, value)?,
            "pruning_slack" => {
                self.pruning_slack = value
                    .parse::<f32>()
                    .map_err(|_| VectorError::config(format!("`{key}` wants a float")))?
            }
            "kmeans_iters" => self.kmeans_iters = parse_usize(key, value)?,
            "training_sample" => self.training_sample = parse_usize(key, value)?,
            "parallel_fetch_min" => self.parallel_fetch_min = parse_usize(key, value)?,
            other => return Err(VectorError::config(format!("unknown key `{other}`"))),
        }
        Ok(())
    }

    /// Clamp interdependent knobs into a workable shape. Mirrors the
    /// manifest-side clamping rather than rejecting odd but harmless
    /// values; only truly unusable input is an error.
    pub fn validate(&mut self) -> Result<()> {
        if self.batch_capacity == 0 {
            return Err(VectorError::config("batch_capacity must be positive"));
        }
        if !self.pruning_slack.is_finite() || self.pruning_slack < 0.0 {
            return Err(VectorError::config("pruning_slack must be >= 0"));
        }
        self.max_cluster_size = self.max_cluster_size.max(2);
        self.min_cluster_size = self.min_cluster_size.min(self.max_cluster_size / 2);
        self.target_clusters = self.target_clusters.max(1);
        self.search_fanout = self.search_fanout.max(1);
        self.replication = self.replication.clamp(1, self.search_fanout);
        self.kmeans_iters = self.kmeans_iters.max(1);
        self.training_sample = self.training_sample.max(self.max_cluster_size);
        self.parallel_fetch_min = self.parallel_fetch_min.max(2);
        Ok(())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| VectorError::config(format!("`{key}` wants an unsigned integer")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_validation() {
        let mut config = IndexConfig::default();
        config.validate().unwrap();
        assert_eq!(config.replication, 1);
        assert_eq!(config.batch_capacity, 128);
    }

    #[test]
    fn pairs_are_applied_and_clamped() {
        let config = IndexConfig::from_pairs([
            ("metric", "cosine"),
            ("replication", "64"),
            ("search_fanout", "4"),
            ("max_cluster_size", "1"),
        ])
        .unwrap();
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.max_cluster_size, 2);
        // replication can never exceed the assignment fan-out
        assert_eq!(config.replication, 4);
    }

    #[test]
    fn unknown_keys_and_metrics_are_rejected() {
        let mut config = IndexConfig::default();
        assert!(config.apply("warp_speed", "9").is_err());
        assert!(config.apply("metric", "hamming").is_err());
        assert!(IndexConfig::from_pairs([("batch_capacity", "0")]).is_err());
    }
}
