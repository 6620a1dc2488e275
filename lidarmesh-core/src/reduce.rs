//! Deterministic parallel reductions

use rayon::prelude::*;

/// Number of terms per task in [`chunked_sum`]
pub const SUM_CHUNK: usize = 4096;

/// Parallel sum with a fixed reduction order
///
/// Terms are summed per fixed-size chunk and the partial sums combined in
/// chunk order, so the result is the same for any thread count.
pub fn chunked_sum<F>(len: usize, term: F) -> f64
where
    F: Fn(usize) -> f64 + Sync + Send,
{
    let chunks = len.div_ceil(SUM_CHUNK);
    let partials: Vec<f64> = (0..chunks)
        .into_par_iter()
        .map(|c| {
            let end = ((c + 1) * SUM_CHUNK).min(len);
            (c * SUM_CHUNK..end).map(&term).sum::<f64>()
        })
        .collect();
    partials.iter().sum()
}
