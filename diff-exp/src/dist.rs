use statrs::distribution::{Beta, ContinuousCDF};
use statrs::function::beta::beta_reg;
use statrs::function::gamma::ln_gamma;
use std::cmp::Ordering;

/// Log(PMF) of negative binomial distribution with mean mu and dispersion phi,
/// conveniently parameterized.
/// Args:
///  k  - NB random variable
///  u  - mean
///  phi  - dispersion
/// Returns:
///  The log of the pmf at k.
#[inline]
pub fn negative_binomial_log_pmf(k: f64, mu: f64, phi: f64) -> f64 {
    let r = 1.0 / phi;
    ln_gamma(r + k) - (ln_gamma(r) + ln_gamma(k + 1.0)) + k * (mu / (r + mu)).ln() + r * (r / (r + mu)).ln()
}

/// Benjamini-Hochberg adjusted p-values. Input pairs are `(original index, p-value)`; the
/// output is in descending p-value order, NaNs first.
#[inline]
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let mut arr = pvalue.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| match a.partial_cmp(&b) {
        Some(o) => o.reverse(),
        None => {
            if a.is_nan() && b.is_nan() {
                Ordering::Equal
            } else if a.is_nan() {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
    });

    // q = min(1, cummin(n / rank * p)) over descending p
    let len = arr.len() as f64;
    let mut min = f64::MAX;
    for (idx, (_, ref mut val)) in arr.iter_mut().enumerate() {
        *val *= len / (len - idx as f64);
        if *val < min {
            min = *val
        }
        *val = min.min(1.0);
    }

    arr
}

/// Bonferroni correction against `n_tests` hypotheses, capped at 1.
#[inline]
pub fn adjusted_pvalue_bonferroni(p_values: &[f64], n_tests: usize) -> Vec<f64> {
    let n = n_tests.max(p_values.len()) as f64;
    p_values.iter().map(|&p| (p * n).min(1.0)).collect()
}

/// Probability that a random pair of counts under the null hypothesis is at least as
/// extreme as the observed pair `(x_a, x_b)`.
#[inline]
pub fn nb_exact_test(x_a: u64, x_b: u64, size_factor_a: f64, size_factor_b: f64, mu: f64, phi: f64) -> f64 {
    if x_a + x_b == 0u64 {
        return 1f64;
    }

    if phi == 0f64 {
        return 1f64;
    }

    if size_factor_a == 0f64 || size_factor_b == 0f64 {
        return 1f64;
    }

    let log_p_all = log_prob_all(x_a + x_b, size_factor_a, size_factor_b, mu, 1f64 / phi);
    let log_p_obs = log_p_all[x_a as usize];

    // two log-sum-exps folded together: one over every outcome, one over the extreme ones
    let mut max_all = f64::NEG_INFINITY;
    let mut max_ext = f64::NEG_INFINITY;
    for &x in &log_p_all {
        if x <= log_p_obs {
            max_ext = max_ext.max(x);
        }
        max_all = max_all.max(x);
    }

    let mut sum_all = 0.0;
    let mut sum_ext = 0.0;
    for &x in &log_p_all {
        if x <= log_p_obs {
            sum_ext += (x - max_ext).exp();
        }
        sum_all += (x - max_all).exp();
    }
    sum_all = sum_all.ln() + max_all;
    sum_ext = sum_ext.ln() + max_ext;

    (sum_ext - sum_all).exp().min(1.0)
}

fn beta_cdf(a: f64, b: f64, x: f64) -> f64 {
    if x <= 0.0 {
        0.0
    } else if x >= 1.0 {
        1.0
    } else {
        beta_reg(a, b, x)
    }
}

fn beta_median(a: f64, b: f64) -> f64 {
    match Beta::new(a, b) {
        Ok(dist) => dist.inverse_cdf(0.5),
        // approximation valid for a, b > 1; only reached for degenerate shapes
        Err(_) => (a - 1.0 / 3.0) / (a + b - 2.0 / 3.0),
    }
}

/// Pairwise exact test p-value using a beta approximation to the conditional joint
/// distribution of `(x_a, x_b)`, for counts too large to enumerate.
/// Robinson MD and Smyth GK (2008). Small-sample estimation of negative binomial dispersion,
///     with applications to SAGE data. Biostatistics, 9, 321-332
#[inline]
pub fn nb_asymptotic_test(
    count_a: u64,
    count_b: u64,
    size_factor_a: f64,
    size_factor_b: f64,
    mu: f64,
    phi: f64,
) -> f64 {
    let alpha = size_factor_a * mu / (1f64 + phi * mu);
    let beta = (size_factor_b / size_factor_a) * alpha;
    if !(alpha > 0.0 && beta > 0.0) {
        return 1.0;
    }

    let x_a = count_a as f64;
    let x_b = count_b as f64;

    let median = beta_median(alpha, beta);

    let p = if (x_a + 0.5f64) / (x_a + x_b) < median {
        2f64 * beta_cdf(alpha, beta, (x_a + 0.5f64) / (x_a + x_b))
    } else {
        2f64 * beta_cdf(beta, alpha, (x_b + 0.5f64) / (x_a + x_b))
    };
    p.min(1.0)
}

#[inline]
fn log_prob_all(count: u64, sa: f64, sb: f64, mu: f64, r: f64) -> Vec<f64> {
    let mut total = Vec::<f64>::with_capacity(count as usize + 1);
    let x = count as f64;
    let mut j: f64 = x;

    let add_total = x * (mu / (r + mu)).ln() + (sa + sb) * (r / (r + mu)).ln() - ln_gamma(sa * r) - ln_gamma(sb * r);

    for idx in 0..=count {
        let a_x = idx as f64;
        let t = ln_gamma(sa * r + a_x) + ln_gamma(sb * r + j) - (ln_gamma(a_x + 1f64) + ln_gamma(j + 1f64));
        total.push(t + add_total);
        j -= 1f64;
    }
    total
}
