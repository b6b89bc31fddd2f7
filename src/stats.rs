use crate::types::Statistics;

/// Max, min, mean and population standard deviation of `data`.
///
/// An empty buffer yields all zeros; a single sample has zero deviation.
pub fn calculate_statistics(data: &[f64]) -> Statistics {
    if data.is_empty() {
        return Statistics::default();
    }

    let n = data.len() as f64;
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let mean = data.iter().sum::<f64>() / n;

    let stdev = if data.len() <= 1 {
        0.0
    } else {
        let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        variance.sqrt()
    };

    Statistics { max, min, mean, stdev }
}
