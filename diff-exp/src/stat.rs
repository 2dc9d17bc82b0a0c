//! Summary statistics over slices of numbers.

use num_traits::ToPrimitive;

/// Descriptive statistics on a sample
pub trait Statistics {
    fn mean(&self) -> f64;
    /// variance with `ddof` delta degrees of freedom
    fn var(&self, ddof: f64) -> f64;
    /// value below which `pct` percent of the sample falls, linearly interpolated
    fn percentile(&self, pct: f64) -> f64;
    fn median(&self) -> f64 {
        self.percentile(50.0)
    }
}

impl<T: ToPrimitive + Copy> Statistics for [T] {
    fn mean(&self) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        let sum: f64 = self.iter().filter_map(|x| x.to_f64()).sum();
        sum / self.len() as f64
    }

    fn var(&self, ddof: f64) -> f64 {
        let n = self.len() as f64;
        if n <= ddof {
            return 0.0;
        }
        let mean = self.mean();
        let ss: f64 = self
            .iter()
            .filter_map(|x| x.to_f64())
            .map(|x| (x - mean) * (x - mean))
            .sum();
        ss / (n - ddof)
    }

    fn percentile(&self, pct: f64) -> f64 {
        let mut sorted = self.iter().filter_map(|x| x.to_f64()).collect::<Vec<_>>();
        if sorted.is_empty() {
            return f64::NAN;
        }
        sorted.sort_by(f64::total_cmp);
        percentile_of_sorted(&sorted, pct.clamp(0.0, 100.0))
    }
}

fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 || pct == 100.0 {
        return sorted[sorted.len() - 1];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor();
    let n = lo as usize;
    sorted[n] + (sorted[n + 1] - sorted[n]) * (rank - lo)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_stats() {
        let v = vec![1, 2, 4, 3, 5, 6];
        assert_approx_eq!(v.mean(), 3.5, 1e-11);
        assert_approx_eq!(v.var(0.0), 2.9166666666666665, 1e-11);
        assert_approx_eq!(v.median(), 3.5, 1e-11);
        assert_approx_eq!(v.percentile(0.95), 1.0475, 1e-11);
        assert_approx_eq!(v.percentile(100.0), 6.0, 1e-11);
        assert!(Vec::<f64>::new().median().is_nan());
    }
}
