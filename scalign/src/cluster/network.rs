use fxhash::FxHashMap;

/// Weighted undirected graph stored as symmetric adjacency lists, used for modularity
/// optimization. Node weights are node strengths (sum of incident edge weights).
#[derive(Clone, Debug, Default)]
pub struct Network {
    node_weights: Vec<f64>,
    adjacency: Vec<Vec<(usize, f64)>>,
    /// Total edge weight of the original graph. Aggregation folds intra-cluster edges into the
    /// nodes, so this is carried along rather than recomputed.
    total_edge_weight: f64,
}

impl Network {
    /// Build a network of `n_nodes` from undirected `(i, j, weight)` edges, each listed once.
    /// Self-loops and non-positive weights are ignored; duplicate edges are summed.
    pub fn from_edges(n_nodes: usize, edges: impl IntoIterator<Item = (usize, usize, f64)>) -> Network {
        let mut memo = FxHashMap::default();
        for (i, j, w) in edges {
            if i == j || w <= 0.0 {
                continue;
            }
            let key = if i < j { (i, j) } else { (j, i) };
            *memo.entry(key).or_insert(0.0) += w;
        }

        let mut adjacency = vec![Vec::new(); n_nodes];
        let mut node_weights = vec![0.0; n_nodes];
        let mut total_edge_weight = 0.0;
        let mut sorted = memo.into_iter().collect::<Vec<_>>();
        sorted.sort_by_key(|&(k, _)| k);
        for ((i, j), w) in sorted {
            adjacency[i].push((j, w));
            adjacency[j].push((i, w));
            node_weights[i] += w;
            node_weights[j] += w;
            total_edge_weight += w;
        }

        Network {
            node_weights,
            adjacency,
            total_edge_weight,
        }
    }

    /// Number of nodes in the graph
    pub fn nodes(&self) -> usize {
        self.node_weights.len()
    }

    /// Get the node weight of `node`.
    pub fn weight(&self, node: usize) -> f64 {
        self.node_weights[node]
    }

    /// Iterator over pairs of (adjacent node id, edge_weight) for all neighbors of `node`.
    pub fn neighbors(&self, node: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.adjacency[node].iter().copied()
    }

    /// Number of undirected edges
    pub fn edges(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    pub fn total_edge_weight(&self) -> f64 {
        self.total_edge_weight
    }

    /// Creates a reduced (or aggregate) network based on a clustering.
    /// Each node in the reduced network corresponds to a cluster of nodes in
    /// the original network. The weight of a node in the reduced network equals
    /// the sum of the weights of the nodes in the corresponding cluster. The weight of an edge
    /// between two nodes in the reduced network equals the sum of the weights of the edges
    /// between the nodes in the two corresponding clusters.
    pub fn create_reduced_network(&self, labels: &[usize], num_clusters: usize) -> Network {
        let mut node_weights = vec![0.0; num_clusters];
        for (node, &c) in labels.iter().enumerate() {
            node_weights[c] += self.node_weights[node];
        }

        let mut edge_memo = FxHashMap::default();
        for (i, edges) in self.adjacency.iter().enumerate() {
            for &(j, w) in edges {
                let (c1, c2) = (labels[i], labels[j]);
                if i < j && c1 != c2 {
                    let key = if c1 < c2 { (c1, c2) } else { (c2, c1) };
                    *edge_memo.entry(key).or_insert(0.0) += w;
                }
            }
        }

        let mut adjacency = vec![Vec::new(); num_clusters];
        let mut sorted = edge_memo.into_iter().collect::<Vec<_>>();
        sorted.sort_by_key(|&(k, _)| k);
        for ((c1, c2), w) in sorted {
            adjacency[c1].push((c2, w));
            adjacency[c2].push((c1, w));
        }

        Network {
            node_weights,
            adjacency,
            total_edge_weight: self.total_edge_weight,
        }
    }

    /// Modularity of `labels` with resolution `resolution`:
    /// `sum_c [ w_in(c) / m - resolution * (K_c / 2m)^2 ]`.
    pub fn modularity(&self, labels: &[usize], resolution: f64) -> f64 {
        let m = self.total_edge_weight;
        if m <= 0.0 {
            return 0.0;
        }
        let n_clusters = labels.iter().max().map_or(0, |&c| c + 1);
        let mut strength = vec![0.0; n_clusters];
        let mut internal = 0.0;
        for (i, edges) in self.adjacency.iter().enumerate() {
            strength[labels[i]] += self.node_weights[i];
            for &(j, w) in edges {
                if i < j && labels[i] == labels[j] {
                    internal += w;
                }
            }
        }
        let expected = strength.iter().map(|k| (k / (2.0 * m)).powi(2)).sum::<f64>();
        internal / m - resolution * expected
    }
}
