//! Small statistical helpers for the mixture tests.
//!
//! The mixture machinery needs an exact one-sided binomial tail and a
//! median. No crate in this stack provides them, so both are computed
//! directly; the tail is accumulated from the log-space pmf to stay finite
//! for genome-scale `n`.

/// Exact one-sided binomial test: `P(X >= k)` for `X ~ Binomial(n, p)`.
///
/// This is the p-value for observing at least `k` successes when `p` is
/// the expected success probability.
#[must_use]
pub fn binomial_sf_geq(k: u64, n: u64, p: f64) -> f64 {
    if k == 0 {
        return 1.0;
    }
    if k > n || p <= 0.0 {
        return 0.0;
    }
    if p >= 1.0 {
        return 1.0;
    }

    // pmf(k) in log space, then walk the tail upwards with the recurrence
    // pmf(i+1) = pmf(i) * (n-i)/(i+1) * p/(1-p)
    let ln_pmf =
        ln_choose(n, k) + k as f64 * p.ln() + (n - k) as f64 * (1.0 - p).ln();
    let mut pmf = ln_pmf.exp();
    let odds = p / (1.0 - p);

    let mut total = 0.0_f64;
    let mut i = k;
    loop {
        total += pmf;
        if i == n {
            break;
        }
        pmf *= (n - i) as f64 / (i + 1) as f64 * odds;
        i += 1;
        // past the mode the terms only shrink; once they underflow the
        // remaining mass is negligible
        if pmf == 0.0 && i as f64 > n as f64 * p {
            break;
        }
    }
    total.min(1.0)
}

/// `ln C(n, k)` as a running sum of logs.
fn ln_choose(n: u64, k: u64) -> f64 {
    let k = k.min(n - k);
    let mut acc = 0.0_f64;
    for i in 0..k {
        acc += ((n - i) as f64).ln() - ((i + 1) as f64).ln();
    }
    acc
}

/// Median of a set of counts; the mean of the middle pair for even sizes.
/// Returns `None` for an empty slice.
#[must_use]
pub fn median(values: &[usize]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        Some(sorted[mid] as f64)
    } else {
        Some((sorted[mid - 1] + sorted[mid]) as f64 / 2.0)
    }
}
