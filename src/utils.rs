use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// a macro to declare simple Vec<String>
#[macro_export]
macro_rules! string_vec {
    ($($x:expr),*) => {
        vec![$($x.into()),*]
    };
}

/// Pick `n` distinct indices out of `weights.len()`, each draw proportional to
/// the remaining weights. Zero-weight entries can still be drawn once every
/// positive-weight entry has been taken.
pub fn weighted_sample_distinct(weights: &[f64], n: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let mut remaining: Vec<(usize, f64)> = weights
        .iter()
        .enumerate()
        .map(|(i, &w)| (i, if w.is_finite() && w > 0.0 { w } else { 0.0 }))
        .collect();
    let mut chosen = Vec::with_capacity(n.min(remaining.len()));

    while chosen.len() < n && !remaining.is_empty() {
        let total: f64 = remaining.iter().map(|(_, w)| w).sum();
        let picked = if total <= 0.0 {
            rng.gen_range(0..remaining.len())
        } else {
            let mut threshold = rng.gen_range(0.0..total);
            let mut picked = remaining.len() - 1;
            for (pos, (_, w)) in remaining.iter().enumerate() {
                if threshold < *w {
                    picked = pos;
                    break;
                }
                threshold -= w;
            }
            picked
        };
        chosen.push(remaining.remove(picked).0);
    }

    chosen
}

/// Linear interpolation from `start` to `end` over `fraction` of the budget,
/// constant at `end` afterwards.
pub fn annealed_value(start: f64, end: f64, consumed: f64, fraction: f64) -> f64 {
    if consumed >= fraction {
        return end;
    }
    start + (end - start) * (consumed / fraction)
}
