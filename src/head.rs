use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::distance::{distance, Metric};
use crate::error::{Result, VectorError};

/// Dense handle for one cluster / posting list.
pub type ClusterId = u32;

type NodeId = u32;

const MAX_BRANCH: usize = 8;

/// Knobs for a full head build.
#[derive(Clone, Copy, Debug)]
pub struct ClusterParams {
    pub target_clusters: usize,
    pub max_leaf: usize,
    pub kmeans_iters: usize,
    pub seed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum Node {
    Internal {
        centroid: Vec<f32>,
        children: Vec<NodeId>,
    },
    Leaf {
        centroid: Vec<f32>,
        cluster: ClusterId,
        members: usize,
        retired: bool,
    },
}

/// In-memory tree over cluster centroids. Nodes live in an arena and
/// reference each other by index, so splits and merges never invalidate
/// handles held elsewhere; a `ClusterId` stays stable until retired.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeadIndex {
    dim: usize,
    metric: Metric,
    root: NodeId,
    nodes: Vec<Node>,
    /// ClusterId -> leaf handle; `None` once retired by a split/merge.
    leaves: Vec<Option<NodeId>>,
}

impl HeadIndex {
    /// Partition `vectors` into roughly `target_clusters` clusters, none
    /// larger than `max_leaf`, and return the tree plus the primary
    /// cluster assignment for each input vector.
    pub fn build(
        vectors: &[Vec<f32>],
        dim: usize,
        metric: Metric,
        params: ClusterParams,
    ) -> Result<(Self, Vec<ClusterId>)> {
        if dim == 0 {
            return Err(VectorError::config("dimension must be positive"));
        }
        for v in vectors {
            if v.len() != dim {
                return Err(VectorError::DimMismatch {
                    expected: dim,
                    got: v.len(),
                });
            }
        }
        let mut builder = TreeBuilder {
            vectors,
            dim,
            metric,
            max_leaf: params.max_leaf.max(2),
            kmeans_iters: params.kmeans_iters.max(1),
            rng: StdRng::seed_from_u64(params.seed),
            nodes: Vec::new(),
            leaves: Vec::new(),
            assignment: vec![0; vectors.len()],
        };
        let indices: Vec<u32> = (0..vectors.len() as u32).collect();
        let root_k = root_branch(vectors.len(), params);
        let root = builder.split(indices, root_k);
        let head = HeadIndex {
            dim,
            metric,
            root,
            nodes: builder.nodes,
            leaves: builder.leaves,
        };
        tracing::info!(
            vectors = vectors.len(),
            clusters = head.cluster_count(),
            nodes = head.nodes.len(),
            "head index built"
        );
        Ok((head, builder.assignment))
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Best-first traversal: up to `fan_out` clusters ascending by
    /// centroid distance to `query`. An internal centroid's distance is
    /// not a lower bound on its children's, so the traversal
    /// over-collects before sorting; it is still approximate — a close
    /// centroid can hide behind an internal node that never gets
    /// expanded.
    pub fn nearest_centroids(&self, query: &[f32], fan_out: usize) -> Result<Vec<(ClusterId, f32)>> {
        if query.len() != self.dim {
            return Err(VectorError::DimMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }
        let mut out = Vec::with_capacity(fan_out.min(self.leaves.len()));
        if fan_out == 0 {
            return Ok(out);
        }
        let collect_goal = fan_out.saturating_mul(2);
        let mut frontier = BinaryHeap::new();
        frontier.push(Frontier {
            node: self.root,
            dist: distance(self.metric, query, self.node_centroid(self.root)),
        });
        while let Some(next) = frontier.pop() {
            match &self.nodes[next.node as usize] {
                Node::Leaf {
                    cluster, retired, ..
                } => {
                    if !retired {
                        out.push((*cluster, next.dist));
                        if out.len() >= collect_goal {
                            break;
                        }
                    }
                }
                Node::Internal { children, .. } => {
                    for &child in children {
                        frontier.push(Frontier {
                            node: child,
                            dist: distance(self.metric, query, self.node_centroid(child)),
                        });
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        out.truncate(fan_out);
        Ok(out)
    }

    /// Assignment targets for an insert: the `r` nearest active clusters.
    pub fn assign(&self, vector: &[f32], r: usize) -> Result<Vec<ClusterId>> {
        Ok(self
            .nearest_centroids(vector, r.max(1))?
            .into_iter()
            .map(|(cluster, _)| cluster)
            .collect())
    }

    pub fn centroid(&self, cluster: ClusterId) -> Result<&[f32]> {
        let node = self.leaf_node(cluster)?;
        Ok(self.node_centroid(node))
    }

    pub fn members(&self, cluster: ClusterId) -> Result<usize> {
        match &self.nodes[self.leaf_node(cluster)? as usize] {
            Node::Leaf { members, .. } => Ok(*members),
            Node::Internal { .. } => Err(VectorError::UnknownCluster(cluster)),
        }
    }

    pub fn add_members(&mut self, cluster: ClusterId, delta: usize) -> Result<()> {
        let node = self.leaf_node(cluster)?;
        if let Node::Leaf { members, .. } = &mut self.nodes[node as usize] {
            *members += delta;
        }
        Ok(())
    }

    pub fn set_members(&mut self, cluster: ClusterId, count: usize) -> Result<()> {
        let node = self.leaf_node(cluster)?;
        if let Node::Leaf { members, .. } = &mut self.nodes[node as usize] {
            *members = count;
        }
        Ok(())
    }

    /// Active cluster ids, ascending.
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.leaves
            .iter()
            .enumerate()
            .filter_map(|(id, leaf)| leaf.map(|_| id as ClusterId))
            .collect()
    }

    pub fn cluster_count(&self) -> usize {
        self.leaves.iter().filter(|leaf| leaf.is_some()).count()
    }

    /// Local split: the overfull leaf becomes an internal node whose
    /// children are fresh leaves, one per `(centroid, member_count)`
    /// part. The old ClusterId is retired; new ids are returned in part
    /// order. Everything else in the tree is untouched.
    pub fn split_leaf(
        &mut self,
        cluster: ClusterId,
        parts: &[(Vec<f32>, usize)],
    ) -> Result<Vec<ClusterId>> {
        if parts.len() < 2 {
            return Err(VectorError::config("split needs at least two parts"));
        }
        let node = self.leaf_node(cluster)?;
        let old_centroid = self.node_centroid(node).to_vec();
        let mut children = Vec::with_capacity(parts.len());
        let mut new_ids = Vec::with_capacity(parts.len());
        for (centroid, members) in parts {
            let new_cluster = self.leaves.len() as ClusterId;
            let child = self.nodes.len() as NodeId;
            self.nodes.push(Node::Leaf {
                centroid: centroid.clone(),
                cluster: new_cluster,
                members: *members,
                retired: false,
            });
            self.leaves.push(Some(child));
            children.push(child);
            new_ids.push(new_cluster);
        }
        self.nodes[node as usize] = Node::Internal {
            centroid: old_centroid,
            children,
        };
        self.leaves[cluster as usize] = None;
        tracing::debug!(old = cluster, new = ?new_ids, "leaf split");
        Ok(new_ids)
    }

    /// Retire an undersized cluster after its members were folded into a
    /// neighbor. The leaf stays in the arena (handles remain valid) but
    /// is skipped by traversal.
    pub fn retire_leaf(&mut self, cluster: ClusterId) -> Result<()> {
        let node = self.leaf_node(cluster)?;
        if let Node::Leaf {
            members, retired, ..
        } = &mut self.nodes[node as usize]
        {
            *members = 0;
            *retired = true;
        }
        self.leaves[cluster as usize] = None;
        Ok(())
    }

    fn leaf_node(&self, cluster: ClusterId) -> Result<NodeId> {
        self.leaves
            .get(cluster as usize)
            .copied()
            .flatten()
            .ok_or(VectorError::UnknownCluster(cluster))
    }

    fn node_centroid(&self, node: NodeId) -> &[f32] {
        match &self.nodes[node as usize] {
            Node::Internal { centroid, .. } => centroid,
            Node::Leaf { centroid, .. } => centroid,
        }
    }
}

fn root_branch(n: usize, params: ClusterParams) -> usize {
    if n <= params.max_leaf.max(2) {
        return 1;
    }
    let needed = n.div_ceil(params.max_leaf.max(2));
    needed.min(params.target_clusters.max(2)).max(2)
}

/// Min-heap ordering over candidate distance, ascending vid-free.
#[derive(Clone, Copy)]
struct Frontier {
    node: NodeId,
    dist: f32,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        // inverted so BinaryHeap pops the smallest distance first
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.node.cmp(&self.node))
    }
}

struct TreeBuilder<'a> {
    vectors: &'a [Vec<f32>],
    dim: usize,
    metric: Metric,
    max_leaf: usize,
    kmeans_iters: usize,
    rng: StdRng,
    nodes: Vec<Node>,
    leaves: Vec<Option<NodeId>>,
    assignment: Vec<ClusterId>,
}

impl TreeBuilder<'_> {
    fn split(&mut self, indices: Vec<u32>, k: usize) -> NodeId {
        if indices.len() <= self.max_leaf || k < 2 {
            return self.make_leaf(indices);
        }
        let buckets = self.kmeans(&indices, k);
        let nonempty: Vec<Vec<u32>> = buckets.into_iter().filter(|b| !b.is_empty()).collect();
        if nonempty.len() < 2 {
            // degenerate data (e.g. all-identical vectors) cannot be
            // partitioned further; accept the oversized leaf
            return self.make_leaf(indices);
        }
        let centroid = self.mean(&indices);
        let children: Vec<NodeId> = nonempty
            .into_iter()
            .map(|bucket| {
                let k = bucket.len().div_ceil(self.max_leaf).clamp(2, MAX_BRANCH);
                self.split(bucket, k)
            })
            .collect();
        let node = self.nodes.len() as NodeId;
        self.nodes.push(Node::Internal { centroid, children });
        node
    }

    fn make_leaf(&mut self, indices: Vec<u32>) -> NodeId {
        let centroid = self.mean(&indices);
        let cluster = self.leaves.len() as ClusterId;
        for &idx in &indices {
            self.assignment[idx as usize] = cluster;
        }
        let node = self.nodes.len() as NodeId;
        self.nodes.push(Node::Leaf {
            centroid,
            cluster,
            members: indices.len(),
            retired: false,
        });
        self.leaves.push(Some(node));
        node
    }

    fn mean(&self, indices: &[u32]) -> Vec<f32> {
        let mut centroid = vec![0.0f32; self.dim];
        if indices.is_empty() {
            return centroid;
        }
        for &idx in indices {
            for (dst, &src) in centroid.iter_mut().zip(&self.vectors[idx as usize]) {
                *dst += src;
            }
        }
        let inv = 1.0 / indices.len() as f32;
        for value in centroid.iter_mut() {
            *value *= inv;
        }
        centroid
    }

    /// Lloyd iterations over the index subset, k-means++ seeded.
    fn kmeans(&mut self, indices: &[u32], k: usize) -> Vec<Vec<u32>> {
        let k = k.min(indices.len());
        let mut centroids = self.init_kmeans_pp(indices, k);
        let mut buckets: Vec<Vec<u32>> = Vec::new();
        for _ in 0..self.kmeans_iters {
            buckets = vec![Vec::new(); centroids.len()];
            for &idx in indices {
                let vector = &self.vectors[idx as usize];
                let mut best = 0usize;
                let mut best_dist = f32::MAX;
                for (c, centroid) in centroids.iter().enumerate() {
                    let d = distance(self.metric, centroid, vector);
                    if d < best_dist {
                        best_dist = d;
                        best = c;
                    }
                }
                buckets[best].push(idx);
            }
            for (c, bucket) in buckets.iter().enumerate() {
                if !bucket.is_empty() {
                    centroids[c] = self.mean(bucket);
                }
            }
        }
        buckets
    }

    fn init_kmeans_pp(&mut self, indices: &[u32], k: usize) -> Vec<Vec<f32>> {
        let mut centroids = Vec::with_capacity(k);
        if let Some(&first) = indices.choose(&mut self.rng) {
            centroids.push(self.vectors[first as usize].clone());
        }
        while centroids.len() < k {
            let mut weights = Vec::with_capacity(indices.len());
            let mut total = 0.0f32;
            for &idx in indices {
                let vector = &self.vectors[idx as usize];
                let mut nearest = f32::MAX;
                for centroid in &centroids {
                    nearest = nearest.min(distance(self.metric, centroid, vector));
                }
                let weight = nearest.max(0.0);
                weights.push(weight);
                total += weight;
            }
            if total <= f32::EPSILON {
                break;
            }
            let mut target = self.rng.gen::<f32>() * total;
            let mut chosen = indices[0];
            for (&idx, &weight) in indices.iter().zip(&weights) {
                target -= weight;
                if target <= 0.0 {
                    chosen = idx;
                    break;
                }
            }
            centroids.push(self.vectors[chosen as usize].clone());
        }
        centroids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn params(target: usize, max_leaf: usize) -> ClusterParams {
        ClusterParams {
            target_clusters: target,
            max_leaf,
            kmeans_iters: 10,
            seed: 0xDEADBEEF,
        }
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn build_respects_leaf_bound() {
        let vectors = random_vectors(300, 4, 11);
        let (head, assignment) =
            HeadIndex::build(&vectors, 4, Metric::L2, params(32, 16)).unwrap();
        assert_eq!(assignment.len(), 300);
        assert!(head.cluster_count() >= 2);
        for cluster in head.cluster_ids() {
            assert!(head.members(cluster).unwrap() <= 16);
        }
        // assignments and members agree
        let total: usize = head
            .cluster_ids()
            .iter()
            .map(|&c| head.members(c).unwrap())
            .sum();
        assert_eq!(total, 300);
    }

    #[test]
    fn small_collection_is_one_cluster() {
        let vectors = random_vectors(20, 5, 3);
        let (head, assignment) =
            HeadIndex::build(&vectors, 5, Metric::L2, params(256, 1024)).unwrap();
        assert_eq!(head.cluster_count(), 1);
        assert!(assignment.iter().all(|&c| c == 0));
    }

    #[test]
    fn empty_build_yields_one_empty_leaf() {
        let (head, assignment) = HeadIndex::build(&[], 5, Metric::L2, params(8, 64)).unwrap();
        assert!(assignment.is_empty());
        assert_eq!(head.cluster_count(), 1);
        assert_eq!(head.members(0).unwrap(), 0);
    }

    #[test]
    fn nearest_centroids_are_ascending() {
        let vectors = random_vectors(200, 3, 5);
        let (head, _) = HeadIndex::build(&vectors, 3, Metric::L2, params(16, 16)).unwrap();
        let hits = head.nearest_centroids(&[0.1, 0.2, 0.3], 6).unwrap();
        assert!(!hits.is_empty());
        assert!(hits.len() <= 6);
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn full_fan_out_ranks_every_cluster() {
        let vectors = random_vectors(200, 3, 5);
        let (head, _) = HeadIndex::build(&vectors, 3, Metric::L2, params(16, 16)).unwrap();
        let query = [0.4, -0.2, 0.7];
        let hits = head
            .nearest_centroids(&query, head.cluster_count())
            .unwrap();
        assert_eq!(hits.len(), head.cluster_count());
        // distances agree with direct centroid comparison, in order
        let mut expected: Vec<(ClusterId, f32)> = head
            .cluster_ids()
            .into_iter()
            .map(|c| {
                let centroid = head.centroid(c).unwrap();
                let dist: f32 = query
                    .iter()
                    .zip(centroid)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum();
                (c, dist)
            })
            .collect();
        expected.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap().then(a.0.cmp(&b.0)));
        let got: Vec<ClusterId> = hits.iter().map(|&(c, _)| c).collect();
        let want: Vec<ClusterId> = expected.iter().map(|&(c, _)| c).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn dim_mismatch_is_rejected() {
        let vectors = random_vectors(10, 4, 9);
        let (head, _) = HeadIndex::build(&vectors, 4, Metric::L2, params(4, 8)).unwrap();
        assert!(matches!(
            head.nearest_centroids(&[0.0; 3], 2),
            Err(VectorError::DimMismatch { expected: 4, got: 3 })
        ));
    }

    #[test]
    fn split_retires_old_cluster_and_routes_to_new() {
        let vectors = random_vectors(12, 2, 21);
        let (mut head, _) = HeadIndex::build(&vectors, 2, Metric::L2, params(4, 64)).unwrap();
        assert_eq!(head.cluster_count(), 1);
        let new_ids = head
            .split_leaf(0, &[(vec![-1.0, 0.0], 6), (vec![1.0, 0.0], 6)])
            .unwrap();
        assert_eq!(new_ids.len(), 2);
        assert!(matches!(
            head.members(0),
            Err(VectorError::UnknownCluster(0))
        ));
        let targets = head.assign(&[-0.9, 0.1], 1).unwrap();
        assert_eq!(targets, vec![new_ids[0]]);
        let targets = head.assign(&[0.9, 0.1], 1).unwrap();
        assert_eq!(targets, vec![new_ids[1]]);
    }

    #[test]
    fn retired_leaf_is_skipped() {
        let vectors = random_vectors(40, 2, 33);
        let (mut head, _) = HeadIndex::build(&vectors, 2, Metric::L2, params(8, 8)).unwrap();
        let before = head.cluster_count();
        let victim = head.cluster_ids()[0];
        head.retire_leaf(victim).unwrap();
        assert_eq!(head.cluster_count(), before - 1);
        let hits = head.nearest_centroids(&[0.0, 0.0], before).unwrap();
        assert!(hits.iter().all(|&(c, _)| c != victim));
    }
}
