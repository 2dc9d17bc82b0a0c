use super::network::Network;
use fxhash::FxHashMap;
use ndarray::ArrayView2;
use rayon::prelude::*;

/// Shared-nearest-neighbor graph. Row `i` of `neighbors` lists the nearest neighbors of cell
/// `i`, excluding itself; the neighborhood used here adds the cell itself. Two cells are joined
/// with their Jaccard overlap `c / (2k - c)`, where `c` counts shared neighborhood members and
/// `k` is the neighborhood size. Edges weighing less than `prune` are dropped.
pub fn build_snn(neighbors: ArrayView2<usize>, prune: f64) -> Network {
    let n_cells = neighbors.nrows();
    let k = (neighbors.ncols() + 1) as f64;
    let neighborhood = |i: usize| std::iter::once(i).chain(neighbors.row(i).into_iter().copied());

    // members[m] = cells whose neighborhood contains m
    let mut members = vec![Vec::new(); n_cells];
    for i in 0..n_cells {
        for m in neighborhood(i) {
            members[m].push(i);
        }
    }

    let edges = (0..n_cells)
        .into_par_iter()
        .flat_map_iter(|i| {
            let mut shared = FxHashMap::<usize, usize>::default();
            for m in neighborhood(i) {
                for &j in &members[m] {
                    if j > i {
                        *shared.entry(j).or_insert(0) += 1;
                    }
                }
            }
            let mut row = shared
                .into_iter()
                .map(|(j, c)| {
                    let c = c as f64;
                    (i, j, c / (2.0 * k - c))
                })
                .filter(|&(_, _, w)| w >= prune)
                .collect::<Vec<_>>();
            row.sort_by_key(|&(_, j, _)| j);
            row
        })
        .collect::<Vec<_>>();

    Network::from_edges(n_cells, edges)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_jaccard_weights() {
        // k = 3 including self
        let nn = array![[1, 2], [0, 2], [0, 1], [4, 0], [3, 0]];
        let net = build_snn(nn.view(), 0.0);
        // cells 0, 1 and 2 share all of {0, 1, 2}: 3 / (6 - 3)
        let w01 = net.neighbors(0).find(|&(j, _)| j == 1).unwrap().1;
        assert!((w01 - 1.0).abs() < 1e-12);
        // cell 3's neighborhood {3, 4, 0} shares only cell 0 with cell 0: 1 / 5
        let w03 = net.neighbors(0).find(|&(j, _)| j == 3).unwrap().1;
        assert!((w03 - 0.2).abs() < 1e-12);

        let pruned = build_snn(nn.view(), 0.25);
        assert!(pruned.neighbors(0).all(|(j, _)| j != 3));
    }
}
