use super::network::Network;
use super::CommunityDetector;
use anyhow::Error;
use log::debug;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use scalign_types::PipelineError;

/// Vec-backed cluster labels over the nodes of a network
#[derive(Clone, Debug, Default)]
struct Clustering {
    labels: Vec<usize>,
    num_clusters: usize,
}

impl Clustering {
    /// Initialize a fresh clustering with each node in its own cluster
    fn init_different_clusters(num_nodes: usize) -> Self {
        Clustering {
            labels: (0..num_nodes).collect(),
            num_clusters: num_nodes,
        }
    }

    fn get(&self, node: usize) -> usize {
        self.labels[node]
    }

    fn set(&mut self, node: usize, label: usize) {
        self.labels[node] = label;
        if label >= self.num_clusters {
            self.num_clusters = label + 1;
        }
    }

    /// Reassign node labels, removing unused labels
    fn remove_empty_clusters(&mut self) {
        let mut counts = vec![0usize; self.num_clusters];
        for &l in &self.labels {
            counts[l] += 1;
        }
        let mut new_labels = vec![usize::MAX; self.num_clusters];
        let mut next = 0;
        for (old, &count) in counts.iter().enumerate() {
            if count > 0 {
                new_labels[old] = next;
                next += 1;
            }
        }
        for l in self.labels.iter_mut() {
            *l = new_labels[*l];
        }
        self.num_clusters = next;
    }

    /// Relabel each node with the label its cluster received in `cluster_clustering`
    fn merge_clusters(&mut self, cluster_clustering: &Clustering) {
        for l in self.labels.iter_mut() {
            *l = cluster_clustering.get(*l);
        }
        self.num_clusters = cluster_clustering.num_clusters;
        self.remove_empty_clusters();
    }
}

/// Moves single nodes to the neighboring cluster with the best modularity gain until no
/// node moves.
#[derive(Default)]
struct StandardLocalMoving {
    resolution: f64,
    cluster_weights: Vec<f64>,
    nodes_per_cluster: Vec<usize>,
    unused_clusters: Vec<usize>,
    node_order: Vec<usize>,
    edge_weight_per_cluster: Vec<f64>,
    neighboring_clusters: Vec<usize>,
}

fn zero_len<T: Default + Clone>(v: &mut Vec<T>, len: usize) {
    v.clear();
    v.resize(len, T::default());
}

impl StandardLocalMoving {
    fn new(resolution: f64) -> Self {
        StandardLocalMoving {
            resolution,
            ..StandardLocalMoving::default()
        }
    }

    fn iterate(&mut self, n: &Network, c: &mut Clustering, rng: &mut impl Rng) -> bool {
        let mut update = false;
        let n_nodes = n.nodes();
        if n_nodes == 0 {
            return false;
        }
        let two_m = 2.0 * n.total_edge_weight();

        zero_len(&mut self.cluster_weights, n_nodes);
        zero_len(&mut self.nodes_per_cluster, n_nodes);
        for i in 0..n_nodes {
            self.cluster_weights[c.get(i)] += n.weight(i);
            self.nodes_per_cluster[c.get(i)] += 1;
        }

        // stack of unused cluster ids
        let mut num_unused_clusters = 0;
        zero_len(&mut self.unused_clusters, n_nodes);
        for i in (0..n_nodes).rev() {
            if self.nodes_per_cluster[i] == 0 {
                self.unused_clusters[num_unused_clusters] = i;
                num_unused_clusters += 1;
            }
        }

        self.node_order.clear();
        self.node_order.extend(0..n_nodes);
        self.node_order.shuffle(rng);

        zero_len(&mut self.edge_weight_per_cluster, n_nodes);
        zero_len(&mut self.neighboring_clusters, n_nodes + 1);

        // Visit nodes cyclically; a node that moves puts its neighbors in other clusters
        // back in the queue. Stop once every node is stable.
        let mut stable = vec![false; n_nodes];
        let mut num_unstable_nodes = n_nodes;
        let mut i = 0;

        loop {
            let j = self.node_order[i];
            i = (i + 1) % n_nodes;
            if stable[j] {
                continue;
            }
            let current_cluster = c.get(j);

            // Remove the node from its current cluster.
            self.cluster_weights[current_cluster] -= n.weight(j);
            self.nodes_per_cluster[current_cluster] -= 1;
            if self.nodes_per_cluster[current_cluster] == 0 {
                self.unused_clusters[num_unused_clusters] = current_cluster;
                num_unused_clusters += 1;
            }

            // Neighboring clusters, plus one empty cluster so the node can always leave.
            self.neighboring_clusters[0] = self.unused_clusters[num_unused_clusters - 1];
            let mut num_neighboring_clusters = 1;
            for (target, edge_weight) in n.neighbors(j) {
                let neighbor_cluster = c.get(target);
                if self.edge_weight_per_cluster[neighbor_cluster] == 0.0 {
                    self.neighboring_clusters[num_neighboring_clusters] = neighbor_cluster;
                    num_neighboring_clusters += 1;
                }
                self.edge_weight_per_cluster[neighbor_cluster] += edge_weight;
            }

            // Pick the cluster with the largest gain. Ties go to the current cluster, then to
            // the smallest id, which guarantees convergence.
            let resolution = self.resolution;
            let gain = |ew: f64, cw: f64| ew - n.weight(j) * cw * resolution / two_m;
            let mut best_cluster = current_cluster;
            let mut max_gain = gain(
                self.edge_weight_per_cluster[current_cluster],
                self.cluster_weights[current_cluster],
            );
            for &l in &self.neighboring_clusters[..num_neighboring_clusters] {
                let g = gain(self.edge_weight_per_cluster[l], self.cluster_weights[l]);
                if g > max_gain || (g == max_gain && best_cluster != current_cluster && l < best_cluster) {
                    best_cluster = l;
                    max_gain = g;
                }
            }
            for &l in &self.neighboring_clusters[..num_neighboring_clusters] {
                self.edge_weight_per_cluster[l] = 0.0;
            }

            self.cluster_weights[best_cluster] += n.weight(j);
            self.nodes_per_cluster[best_cluster] += 1;
            if best_cluster == self.unused_clusters[num_unused_clusters - 1] {
                num_unused_clusters -= 1;
            }

            stable[j] = true;
            num_unstable_nodes -= 1;

            if best_cluster != current_cluster {
                c.set(j, best_cluster);
                for (target, _) in n.neighbors(j) {
                    if stable[target] && c.get(target) != best_cluster {
                        stable[target] = false;
                        num_unstable_nodes += 1;
                    }
                }
                update = true;
            }

            if num_unstable_nodes == 0 {
                break;
            }
        }

        if update {
            c.remove_empty_clusters();
        }
        update
    }
}

/// Louvain modularity optimization with a resolution parameter. Runs `n_starts` random starts
/// of up to `n_iterations` multi-level passes each and keeps the partition with the highest
/// modularity.
#[derive(Clone, Debug)]
pub struct Louvain {
    pub n_starts: usize,
    pub n_iterations: usize,
    pub seed: u64,
}

impl Default for Louvain {
    fn default() -> Self {
        Louvain {
            n_starts: 10,
            n_iterations: 10,
            seed: 0,
        }
    }
}

impl Louvain {
    /// One multi-level pass: local moving, then recursion on the aggregate network.
    fn iterate(local_moving: &mut StandardLocalMoving, n: &Network, c: &mut Clustering, rng: &mut ChaCha20Rng) -> bool {
        let mut update = local_moving.iterate(n, c, rng);

        if c.num_clusters == n.nodes() {
            return update;
        }

        let reduced_n = n.create_reduced_network(&c.labels, c.num_clusters);
        let mut reduced_clusters = Clustering::init_different_clusters(reduced_n.nodes());
        update |= Self::iterate(local_moving, &reduced_n, &mut reduced_clusters, rng);
        c.merge_clusters(&reduced_clusters);

        update
    }
}

impl CommunityDetector for Louvain {
    fn detect(&self, network: &Network, resolution: f64) -> Result<Vec<usize>, Error> {
        if !(resolution > 0.0 && resolution.is_finite()) {
            return Err(PipelineError::invalid(format!("resolution {resolution} must be positive")).into());
        }
        if self.n_starts == 0 || self.n_iterations == 0 {
            return Err(PipelineError::invalid("Louvain needs at least one start and one iteration").into());
        }
        if network.total_edge_weight() <= 0.0 {
            return Ok((0..network.nodes()).collect());
        }

        let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
        let mut local_moving = StandardLocalMoving::new(resolution);
        let mut best: Option<(f64, Clustering)> = None;

        for start in 0..self.n_starts {
            let mut c = Clustering::init_different_clusters(network.nodes());
            for _ in 0..self.n_iterations {
                if !Self::iterate(&mut local_moving, network, &mut c, &mut rng) {
                    break;
                }
            }
            let q = network.modularity(&c.labels, resolution);
            debug!("Louvain start {start}: {} clusters, modularity {q:.6}", c.num_clusters);
            if best.as_ref().map_or(true, |(bq, _)| q > *bq) {
                best = Some((q, c));
            }
        }

        Ok(best.map(|(_, c)| c.labels).unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::network::test::barbell;

    #[test]
    fn test_clustering_relabel() {
        let mut c = Clustering::init_different_clusters(10);
        c.set(8, 0);
        c.set(7, 0);
        c.remove_empty_clusters();
        assert_eq!(c.num_clusters, 8);
        assert_eq!(c.get(9), 7);
    }

    #[test]
    fn test_barbell_splits_in_two() {
        let labels = Louvain::default().detect(&barbell(), 1.0).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_planted_partition() {
        // 4 dense groups of 15 nodes with sparse links between groups
        let mut rng = ChaCha20Rng::seed_from_u64(5);
        let mut edges = Vec::new();
        for i in 0..60 {
            for j in (i + 1)..60 {
                let p = if i / 15 == j / 15 { 0.6 } else { 0.02 };
                if rng.gen_bool(p) {
                    edges.push((i, j, 1.0));
                }
            }
        }
        let network = Network::from_edges(60, edges);
        let labels = Louvain::default().detect(&network, 1.0).unwrap();
        for group in 0..4 {
            let first = labels[group * 15];
            assert!((group * 15..(group + 1) * 15).all(|i| labels[i] == first));
        }
        let mut distinct = labels.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 4);
    }

    #[test]
    fn test_resolution_validation() {
        assert!(Louvain::default().detect(&barbell(), 0.0).is_err());
        let empty = Network::from_edges(3, vec![]);
        assert_eq!(Louvain::default().detect(&empty, 1.0).unwrap(), vec![0, 1, 2]);
    }
}
