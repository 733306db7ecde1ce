use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Biquad section designs (RBJ cookbook).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum FilterKind {
    Notch { freq_hz: f64, q: f64 },
    Highpass { cutoff_hz: f64, q: f64 },
    Lowpass { cutoff_hz: f64, q: f64 },
    /// Realised as a high-pass at `low_hz` cascaded with a low-pass at `high_hz`,
    /// which keeps a flat pass band for the wide bands used on LFP data.
    Bandpass { low_hz: f64, high_hz: f64 },
}

#[derive(Clone, Copy, Debug)]
struct BiquadCoeffs {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

#[derive(Clone, Copy, Debug, Default)]
struct BiquadState {
    z1: f64,
    z2: f64,
}

#[derive(Clone, Copy, Debug)]
struct BiquadFilter {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadFilter {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    fn process(&mut self, input: f64) -> f64 {
        // Transposed direct form II
        let y = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
    }

    /// Prime the state as if `value` had been fed forever (step steady state),
    /// which suppresses the start-up transient on signals with an offset.
    fn settle(&mut self, value: f64) {
        let c = self.coeffs;
        let gain = (c.b0 + c.b1 + c.b2) / (1.0 + c.a1 + c.a2);
        let y = gain * value;
        self.state.z2 = c.b2 * value - c.a2 * y;
        self.state.z1 = y - c.b0 * value;
    }
}

#[derive(Clone, Debug, Default)]
pub struct FilterChain {
    sections: Vec<BiquadFilter>,
}

impl FilterChain {
    pub fn from_kinds(sample_rate_hz: f64, kinds: &[FilterKind]) -> Self {
        let mut sections = Vec::new();
        for kind in kinds {
            sections.extend(design_sections(sample_rate_hz, *kind));
        }
        Self { sections }
    }

    pub fn bandpass(sample_rate_hz: f64, low_hz: f64, high_hz: f64) -> Self {
        Self::from_kinds(sample_rate_hz, &[FilterKind::Bandpass { low_hz, high_hz }])
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    fn reset_to(&mut self, value: f64) {
        let mut carried = value;
        for section in &mut self.sections {
            section.settle(carried);
            let c = section.coeffs;
            carried *= (c.b0 + c.b1 + c.b2) / (1.0 + c.a1 + c.a2);
        }
    }

    pub fn process_sample(&mut self, mut value: f64) -> f64 {
        for section in &mut self.sections {
            value = section.process(value);
        }
        value
    }

    /// Zero-phase filtering: forward pass, then a backward pass over the result.
    pub fn filtfilt(&self, signal: &[f64]) -> Vec<f64> {
        if self.is_empty() || signal.is_empty() {
            return signal.to_vec();
        }
        let mut forward = self.clone();
        forward.reset_to(signal[0]);
        let mut out: Vec<f64> = signal.iter().map(|&v| forward.process_sample(v)).collect();
        let mut backward = self.clone();
        if let Some(&last) = out.last() {
            backward.reset_to(last);
        }
        for v in out.iter_mut().rev() {
            *v = backward.process_sample(*v);
        }
        out
    }
}

fn design_sections(sample_rate_hz: f64, kind: FilterKind) -> Vec<BiquadFilter> {
    let nyquist = sample_rate_hz * 0.5;
    match kind {
        FilterKind::Notch { freq_hz, q } => {
            vec![BiquadFilter::new(notch(nyquist_clamp(freq_hz, nyquist), sample_rate_hz, q))]
        }
        FilterKind::Highpass { cutoff_hz, q } => {
            vec![BiquadFilter::new(highpass(nyquist_clamp(cutoff_hz, nyquist), sample_rate_hz, q))]
        }
        FilterKind::Lowpass { cutoff_hz, q } => {
            vec![BiquadFilter::new(lowpass(nyquist_clamp(cutoff_hz, nyquist), sample_rate_hz, q))]
        }
        FilterKind::Bandpass { low_hz, high_hz } => {
            let low = nyquist_clamp(low_hz.min(high_hz), nyquist);
            let high = nyquist_clamp(low_hz.max(high_hz), nyquist);
            let mut sections = vec![BiquadFilter::new(highpass(low, sample_rate_hz, BUTTERWORTH_Q))];
            // no low-pass section needed when the band reaches Nyquist
            if high < nyquist * 0.98 {
                sections.push(BiquadFilter::new(lowpass(high, sample_rate_hz, BUTTERWORTH_Q)));
            }
            sections
        }
    }
}

const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

fn nyquist_clamp(freq_hz: f64, nyquist: f64) -> f64 {
    freq_hz.clamp(0.01, nyquist - 0.01)
}

fn lowpass(freq_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    normalize(b0, b1, b2, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
}

fn highpass(freq_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 + cos_w0) * 0.5;
    let b1 = -(1.0 + cos_w0);
    let b2 = b0;
    normalize(b0, b1, b2, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
}

fn notch(center_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * center_hz / sample_rate_hz;
    let alpha = w0.sin() / (2.0 * q.max(0.1));
    let cos_w0 = w0.cos();
    normalize(1.0, -2.0 * cos_w0, 1.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha)
}

fn normalize(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> BiquadCoeffs {
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, fs: f64, seconds: f64) -> Vec<f64> {
        (0..(fs * seconds) as usize)
            .map(|i| (2.0 * PI * freq * i as f64 / fs).sin())
            .collect()
    }

    fn rms(data: &[f64]) -> f64 {
        (data.iter().map(|v| v * v).sum::<f64>() / data.len() as f64).sqrt()
    }

    #[test]
    fn bandpass_keeps_in_band_and_rejects_dc() {
        let chain = FilterChain::bandpass(250.0, 5.0, 60.0);
        let passed = chain.filtfilt(&sine(20.0, 250.0, 4.0));
        let middle = &passed[250..750];
        assert!((rms(middle) - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.05);

        let dc = chain.filtfilt(&vec![3.0; 1000]);
        assert!(dc[200..800].iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn bandpass_attenuates_out_of_band() {
        let chain = FilterChain::bandpass(250.0, 5.0, 20.0);
        let out = chain.filtfilt(&sine(90.0, 250.0, 4.0));
        assert!(rms(&out[250..750]) < 0.05);
    }

    #[test]
    fn empty_chain_is_identity() {
        let chain = FilterChain::from_kinds(250.0, &[]);
        let input = vec![1.0, -2.0, 3.5];
        assert_eq!(chain.filtfilt(&input), input);
    }
}
