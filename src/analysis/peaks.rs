//! Peak picking for beat detection.

/// Indices of local maxima whose topographic prominence is at least
/// `min_prominence` and that are at least `min_distance` samples apart.
/// Flat tops report their middle sample.
pub fn find_peaks(signal: &[f64], min_prominence: f64, min_distance: usize) -> Vec<usize> {
    let candidates = local_maxima(signal);
    let spaced = enforce_distance(signal, &candidates, min_distance.max(1));
    spaced
        .into_iter()
        .filter(|&peak| prominence(signal, peak) >= min_prominence)
        .collect()
}

/// Same as [`find_peaks`] on the negated signal.
pub fn find_troughs(signal: &[f64], min_prominence: f64, min_distance: usize) -> Vec<usize> {
    let negated: Vec<f64> = signal.iter().map(|v| -v).collect();
    find_peaks(&negated, min_prominence, min_distance)
}

fn local_maxima(signal: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if signal.len() < 3 {
        return peaks;
    }
    let last = signal.len() - 1;
    let mut i = 1;
    while i < last {
        if signal[i - 1] < signal[i] {
            let mut ahead = i + 1;
            while ahead < last && signal[ahead] == signal[i] {
                ahead += 1;
            }
            if signal[ahead] < signal[i] {
                let right_edge = ahead - 1;
                peaks.push((i + right_edge) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

fn enforce_distance(signal: &[f64], peaks: &[usize], min_distance: usize) -> Vec<usize> {
    if min_distance <= 1 || peaks.len() < 2 {
        return peaks.to_vec();
    }
    let mut keep = vec![true; peaks.len()];
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    // tallest first; ties resolved towards later peaks
    order.sort_by(|&a, &b| signal[peaks[a]].total_cmp(&signal[peaks[b]]).then(a.cmp(&b)));
    for &idx in order.iter().rev() {
        if !keep[idx] {
            continue;
        }
        let mut j = idx;
        while j > 0 && peaks[idx] - peaks[j - 1] < min_distance {
            keep[j - 1] = false;
            j -= 1;
        }
        let mut j = idx + 1;
        while j < peaks.len() && peaks[j] - peaks[idx] < min_distance {
            keep[j] = false;
            j += 1;
        }
    }
    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

/// Height of a peak above the higher of its two bases, where each base is the
/// lowest point before the signal rises above the peak again (or the edge).
pub fn prominence(signal: &[f64], peak: usize) -> f64 {
    let height = signal[peak];
    let mut left_min = height;
    for &v in signal[..peak].iter().rev() {
        if v > height {
            break;
        }
        left_min = left_min.min(v);
    }
    let mut right_min = height;
    for &v in &signal[peak + 1..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }
    height - left_min.max(right_min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_simple_peaks_and_plateau_middles() {
        let signal = [0.0, 2.0, 0.0, 1.0, 3.0, 3.0, 3.0, 0.0, 1.0];
        assert_eq!(find_peaks(&signal, 0.0, 1), vec![1, 5]);
    }

    #[test]
    fn prominence_filter_drops_ripples() {
        let signal = [0.0, 5.0, 4.5, 4.8, 0.0, 6.0, 0.0];
        let peaks = find_peaks(&signal, 1.0, 1);
        assert_eq!(peaks, vec![1, 5]);
        assert!((prominence(&signal, 3) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn distance_keeps_the_taller_neighbour() {
        let signal = [0.0, 3.0, 0.0, 5.0, 0.0, 0.0, 0.0, 4.0, 0.0];
        assert_eq!(find_peaks(&signal, 0.0, 3), vec![3, 7]);
    }

    #[test]
    fn troughs_are_peaks_of_the_negated_signal() {
        let signal = [0.0, -2.0, 0.0, -1.0, 0.0];
        assert_eq!(find_troughs(&signal, 0.5, 1), vec![1, 3]);
    }
}
