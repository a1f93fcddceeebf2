//! MFCC embedding extraction for speaker clustering.
//!
//! This is a lightweight, model-free front end: framed FFT, mel filterbank,
//! log compression, DCT-II, averaged over the segment and L2-normalized.
//! It separates voices well enough for online host/guest clustering without
//! shipping an extra ML model.

use crate::error::{LiveError, Result};
use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

/// Number of mel filters.
const MEL_FILTERS: usize = 26;
/// Cepstral coefficients kept per frame (including c0).
pub const MFCC_DIMS: usize = 13;

const FRAME_LEN: usize = 400; // 25 ms @ 16 kHz
const HOP: usize = 160; // 10 ms @ 16 kHz
const FFT_LEN: usize = 512;

/// Compute a normalized MFCC embedding (length [`MFCC_DIMS`]) for a segment.
///
/// # Errors
///
/// Returns an error when the audio is too short for a single frame.
pub fn mfcc_embedding(pcm: &[i16], sample_rate: u32) -> Result<Vec<f32>> {
    if pcm.len() < FRAME_LEN {
        return Err(LiveError::Diarizer(
            "segment too short for an embedding".to_owned(),
        ));
    }

    let mono: Vec<f32> = pcm.iter().map(|&s| f32::from(s) / 32768.0).collect();

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_LEN);
    let window = hamming_window(FRAME_LEN);
    let filterbank = mel_filterbank(sample_rate as f32);

    let mut acc = vec![0.0f32; MFCC_DIMS];
    let mut frames = 0usize;
    let mut buf = vec![Complex32::new(0.0, 0.0); FFT_LEN];
    let mut pos = 0usize;

    while pos + FRAME_LEN <= mono.len() {
        for (i, w) in window.iter().enumerate() {
            buf[i] = Complex32::new(mono[pos + i] * *w, 0.0);
        }
        for c in buf.iter_mut().skip(FRAME_LEN) {
            *c = Complex32::new(0.0, 0.0);
        }
        fft.process(&mut buf);

        // Power spectrum over the positive half.
        let power: Vec<f32> = buf
            .iter()
            .take(FFT_LEN / 2 + 1)
            .map(|c| c.re * c.re + c.im * c.im)
            .collect();

        // Mel energies with a log floor at zero.
        let mut mel = [0.0f32; MEL_FILTERS];
        for (m, filter) in filterbank.iter().enumerate() {
            let energy: f32 = filter
                .iter()
                .map(|&(bin, weight)| power[bin] * weight)
                .sum();
            mel[m] = (1.0 + energy).ln();
        }

        // DCT-II down to the cepstral coefficients.
        for (k, acc_k) in acc.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for (m, &e) in mel.iter().enumerate() {
                sum += e
                    * (std::f32::consts::PI * k as f32 * (m as f32 + 0.5) / MEL_FILTERS as f32)
                        .cos();
            }
            *acc_k += sum;
        }

        frames += 1;
        pos += HOP;
    }

    if frames == 0 {
        return Err(LiveError::Diarizer(
            "not enough audio for an embedding".to_owned(),
        ));
    }
    for v in &mut acc {
        *v /= frames as f32;
    }
    l2_normalize(&mut acc);
    Ok(acc)
}

/// Cosine similarity for normalized embeddings (range ~[-1, 1]).
pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10.0f32.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filters as sparse (bin, weight) lists.
fn mel_filterbank(sample_rate: f32) -> Vec<Vec<(usize, f32)>> {
    let nyquist = sample_rate / 2.0;
    let mel_lo = hz_to_mel(0.0);
    let mel_hi = hz_to_mel(nyquist);
    let points: Vec<f32> = (0..MEL_FILTERS + 2)
        .map(|i| {
            let mel = mel_lo + (mel_hi - mel_lo) * i as f32 / (MEL_FILTERS + 1) as f32;
            mel_to_hz(mel)
        })
        .collect();
    let hz_per_bin = sample_rate / FFT_LEN as f32;

    (0..MEL_FILTERS)
        .map(|m| {
            let (lo, center, hi) = (points[m], points[m + 1], points[m + 2]);
            let mut filter = Vec::new();
            let first_bin = (lo / hz_per_bin).ceil() as usize;
            let last_bin = ((hi / hz_per_bin).floor() as usize).min(FFT_LEN / 2);
            for bin in first_bin..=last_bin {
                let hz = bin as f32 * hz_per_bin;
                let weight = if hz <= center {
                    if center > lo { (hz - lo) / (center - lo) } else { 0.0 }
                } else if hi > center {
                    (hi - hz) / (hi - center)
                } else {
                    0.0
                };
                if weight > 0.0 {
                    filter.push((bin, weight));
                }
            }
            filter
        })
        .collect()
}

fn hamming_window(n: usize) -> Vec<f32> {
    let denom = (n - 1).max(1) as f32;
    (0..n)
        .map(|i| {
            let x = i as f32 / denom;
            0.54 - 0.46 * (2.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}

fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
pub(crate) fn sine_pcm(freq: f32, seconds: f64, sample_rate: u32) -> Vec<i16> {
    let n = (f64::from(sample_rate) * seconds) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (0.4 * (2.0 * std::f32::consts::PI * freq * t).sin() * 32767.0) as i16
        })
        .collect()
}
