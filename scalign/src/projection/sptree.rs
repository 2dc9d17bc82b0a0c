//! Space-partitioning tree (quadtree in 2-D, octree in 3-D) over the rows of an output layout,
//! used for Barnes-Hut estimates of the t-SNE repulsive forces.

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut1};

const LEAF_CAPACITY: usize = 4;
// coincident points end up in one bucket at this depth
const MAX_DEPTH: usize = 32;

pub(super) fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

struct Node {
    center: Vec<f64>,
    half_width: f64,
    center_of_mass: Vec<f64>,
    size: usize,
    first_child: Option<usize>,
    points: Vec<usize>,
}

impl Node {
    fn new(center: Vec<f64>, half_width: f64) -> Node {
        let dims = center.len();
        Node {
            center,
            half_width,
            center_of_mass: vec![0.0; dims],
            size: 0,
            first_child: None,
            points: Vec::new(),
        }
    }
}

pub(super) struct SpaceTree<'a> {
    y: ArrayView2<'a, f64>,
    nodes: Vec<Node>,
}

impl<'a> SpaceTree<'a> {
    pub(super) fn new(y: ArrayView2<'a, f64>) -> SpaceTree<'a> {
        let dims = y.ncols();
        let mut lo = vec![f64::INFINITY; dims];
        let mut hi = vec![f64::NEG_INFINITY; dims];
        for row in y.rows() {
            for k in 0..dims {
                lo[k] = lo[k].min(row[k]);
                hi[k] = hi[k].max(row[k]);
            }
        }
        let (center, half_width) = if y.nrows() == 0 {
            (vec![0.0; dims], 1.0)
        } else {
            let center = lo.iter().zip(&hi).map(|(l, h)| (l + h) / 2.0).collect();
            let half = lo.iter().zip(&hi).map(|(l, h)| (h - l) / 2.0).fold(0.0, f64::max);
            (center, half + 1e-5)
        };

        let mut tree = SpaceTree {
            y,
            nodes: vec![Node::new(center, half_width)],
        };
        for i in 0..y.nrows() {
            tree.insert(0, i, 0);
        }
        tree
    }

    fn orthant(&self, node: usize, point: ArrayView1<f64>) -> usize {
        self.nodes[node]
            .center
            .iter()
            .zip(point.iter())
            .enumerate()
            .fold(0, |o, (k, (c, p))| if p > c { o | (1 << k) } else { o })
    }

    fn insert(&mut self, node: usize, i: usize, depth: usize) {
        let y = self.y;
        let point = y.row(i);
        let n = &mut self.nodes[node];
        let size = n.size as f64;
        for (c, &p) in n.center_of_mass.iter_mut().zip(point.iter()) {
            *c = (*c * size + p) / (size + 1.0);
        }
        n.size += 1;

        let first_child = n.first_child;
        let first = match first_child {
            Some(first) => first,
            None if n.points.len() < LEAF_CAPACITY || depth >= MAX_DEPTH => {
                n.points.push(i);
                return;
            }
            None => self.subdivide(node, depth),
        };
        let child = first + self.orthant(node, point);
        self.insert(child, i, depth + 1);
    }

    /// Split a full leaf into 2^d children and push its points down. Returns the first child.
    fn subdivide(&mut self, node: usize, depth: usize) -> usize {
        let center = self.nodes[node].center.clone();
        let half = self.nodes[node].half_width / 2.0;
        let first = self.nodes.len();
        for o in 0..(1usize << center.len()) {
            let c = center
                .iter()
                .enumerate()
                .map(|(k, &x)| if (o >> k) & 1 == 1 { x + half } else { x - half })
                .collect();
            self.nodes.push(Node::new(c, half));
        }
        self.nodes[node].first_child = Some(first);

        let y = self.y;
        for p in std::mem::take(&mut self.nodes[node].points) {
            let child = first + self.orthant(node, y.row(p));
            self.insert(child, p, depth + 1);
        }
        first
    }

    /// Barnes-Hut estimate of the unnormalized repulsive force on point `i`, added to `force`.
    /// Returns the point's share of the normalization, the sum over j != i of
    /// `1 / (1 + |y_i - y_j|^2)`. A cell is summarized by its center of mass when its width is
    /// below `theta` times its distance; `theta = 0` visits every point.
    pub(super) fn repulsion(&self, i: usize, theta: f64, force: &mut ArrayViewMut1<f64>) -> f64 {
        self.visit(0, i, theta * theta, force)
    }

    fn visit(&self, node: usize, i: usize, theta_sq: f64, force: &mut ArrayViewMut1<f64>) -> f64 {
        let n = &self.nodes[node];
        if n.size == 0 {
            return 0.0;
        }
        let yi = self.y.row(i);
        match n.first_child {
            None => {
                let mut sum_q = 0.0;
                for &j in n.points.iter().filter(|&&j| j != i) {
                    let yj = self.y.row(j);
                    let q = 1.0 / (1.0 + sq_dist(yi, yj));
                    sum_q += q;
                    for k in 0..force.len() {
                        force[k] += q * q * (yi[k] - yj[k]);
                    }
                }
                sum_q
            }
            Some(first) => {
                let com = ArrayView1::from(&n.center_of_mass);
                let d2 = sq_dist(yi, com);
                let width = 2.0 * n.half_width;
                if width * width < theta_sq * d2 {
                    let q = 1.0 / (1.0 + d2);
                    let mult = n.size as f64 * q;
                    for k in 0..force.len() {
                        force[k] += mult * q * (yi[k] - com[k]);
                    }
                    mult
                } else {
                    let n_children = 1usize << self.y.ncols();
                    (first..first + n_children)
                        .map(|c| self.visit(c, i, theta_sq, force))
                        .sum()
                }
            }
        }
    }
}
