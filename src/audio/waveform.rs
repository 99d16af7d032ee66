//! Analyser over the live signal
//!
//! The capture path writes every published packet into a bounded ring of the
//! most recent mono samples. The visualizer reads byte-scaled time-domain or
//! frequency data from it on its own cadence; nothing here ever touches the
//! recorded chunks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Default analysis window in samples.
pub const DEFAULT_FFT_SIZE: usize = 1024;

/// Default smoothing between successive spectra (0 = none).
pub const DEFAULT_SMOOTHING: f32 = 0.8;

pub const DEFAULT_MIN_DECIBELS: f32 = -100.0;
pub const DEFAULT_MAX_DECIBELS: f32 = -30.0;

/// Ring buffer of recent mono samples, normalized to -1.0..=1.0
pub struct WaveformBuffer {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl WaveformBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add samples to the buffer, removing oldest samples if at capacity
    pub fn push_samples(&mut self, samples: &[f32]) {
        let len = samples.len();

        // If incoming samples exceed capacity, just keep the last part
        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// The latest `capacity` samples, zero-padded at the front while the
    /// ring is still filling.
    pub fn window(&self) -> Vec<f32> {
        let mut window = vec![0.0f32; self.capacity - self.samples.len()];
        window.extend(self.samples.iter().copied());
        window
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        let excess = self.samples.len().saturating_sub(self.capacity);
        if excess > 0 {
            self.samples.drain(0..excess);
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

struct SpectrumState {
    smoothing: f32,
    min_decibels: f32,
    max_decibels: f32,
    previous: Vec<f32>,
    /// Forward FFT planned for the last window size
    plan: Option<(usize, Arc<dyn Fft<f32>>)>,
}

impl SpectrumState {
    fn plan(&mut self, n: usize) -> Arc<dyn Fft<f32>> {
        match &self.plan {
            Some((size, fft)) if *size == n => fft.clone(),
            _ => {
                let fft = FftPlanner::<f32>::new().plan_fft_forward(n);
                self.plan = Some((n, fft.clone()));
                fft
            }
        }
    }
}

/// Read-only view over the live signal used for visualization.
///
/// Cloning shares the same underlying buffers.
#[derive(Clone)]
pub struct Analyser {
    ring: Arc<Mutex<WaveformBuffer>>,
    spectrum: Arc<Mutex<SpectrumState>>,
}

impl Default for Analyser {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE)
    }
}

impl Analyser {
    pub fn new(fft_size: usize) -> Self {
        let fft_size = normalize_fft_size(fft_size);
        Self {
            ring: Arc::new(Mutex::new(WaveformBuffer::new(fft_size))),
            spectrum: Arc::new(Mutex::new(SpectrumState {
                smoothing: DEFAULT_SMOOTHING,
                min_decibels: DEFAULT_MIN_DECIBELS,
                max_decibels: DEFAULT_MAX_DECIBELS,
                previous: vec![0.0; fft_size / 2],
                plan: None,
            })),
        }
    }

    /// Reconfigure window size and spectral smoothing.
    pub fn configure(&self, fft_size: usize, smoothing: f32) {
        let fft_size = normalize_fft_size(fft_size);
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(fft_size);
        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        spectrum.smoothing = smoothing.clamp(0.0, 1.0);
        spectrum.previous = vec![0.0; fft_size / 2];
    }

    pub fn fft_size(&self) -> usize {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .capacity()
    }

    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size() / 2
    }

    /// Downmix an interleaved packet to mono and append it.
    pub fn push_interleaved(&self, samples: &[i16], channels: usize) {
        let channels = channels.max(1);
        let mono: Vec<f32> = samples
            .chunks(channels)
            .map(|frame| {
                let sum: f32 = frame.iter().map(|&s| s as f32 / i16::MAX as f32).sum();
                sum / frame.len() as f32
            })
            .collect();
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_samples(&mono);
    }

    fn window(&self) -> Vec<f32> {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .window()
    }

    /// Latest waveform as bytes centred on 128, one per sample.
    pub fn byte_time_domain_data(&self, out: &mut [u8]) {
        let window = self.window();
        for (dst, &s) in out.iter_mut().zip(window.iter()) {
            *dst = (128.0 * (1.0 + s)).clamp(0.0, 255.0) as u8;
        }
    }

    /// Latest spectrum as bytes: Blackman-windowed FFT magnitude, smoothed
    /// over time and mapped from [min_decibels, max_decibels] to 0..=255.
    pub fn byte_frequency_data(&self, out: &mut [u8]) {
        let window = self.window();
        let n = window.len();

        let mut buffer: Vec<Complex<f32>> = window
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * blackman(i, n), 0.0))
            .collect();

        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        spectrum.plan(n).process(&mut buffer);
        let SpectrumState {
            smoothing,
            min_decibels,
            max_decibels,
            previous,
            ..
        } = &mut *spectrum;
        let range = (*max_decibels - *min_decibels).max(f32::EPSILON);

        // A concurrent configure may have resized the state after the window
        // was taken
        for (k, prev) in previous.iter_mut().enumerate().take(n / 2) {
            let magnitude = buffer[k].norm() / n as f32;
            *prev = *smoothing * *prev + (1.0 - *smoothing) * magnitude;
        }

        for (dst, &magnitude) in out.iter_mut().zip(previous.iter()) {
            let db = if magnitude > 0.0 {
                20.0 * magnitude.log10()
            } else {
                f32::NEG_INFINITY
            };
            let scaled = 255.0 / range * (db - *min_decibels);
            *dst = scaled.clamp(0.0, 255.0) as u8;
        }
    }

    /// RMS level of the current window, 0.0..=1.0
    pub fn rms_level(&self) -> f32 {
        let ring = self.ring.lock().unwrap_or_else(PoisonError::into_inner);
        if ring.is_empty() {
            return 0.0;
        }
        let sum_squares: f64 = ring.samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        ((sum_squares / ring.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
    }

    pub fn reset(&self) {
        self.ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let mut spectrum = self.spectrum.lock().unwrap_or_else(PoisonError::into_inner);
        spectrum.previous.iter_mut().for_each(|p| *p = 0.0);
    }
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("fft_size", &self.fft_size())
            .finish()
    }
}

fn normalize_fft_size(fft_size: usize) -> usize {
    fft_size.clamp(32, 32_768).next_power_of_two()
}

fn blackman(i: usize, n: usize) -> f32 {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    let x = std::f32::consts::TAU * i as f32 / n as f32;
    A0 - A1 * x.cos() + A2 * (2.0 * x).cos()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_bounded() {
        let mut buffer = WaveformBuffer::new(1024);
        let samples: Vec<f32> = (0..1500).map(|i| (i % 10) as f32 / 10.0).collect();
        buffer.push_samples(&samples);
        assert_eq!(buffer.len(), 1024);
    }

    #[test]
    fn test_push_samples_incremental() {
        let mut buffer = WaveformBuffer::new(4);
        buffer.push_samples(&[0.1, 0.2]);
        buffer.push_samples(&[0.3, 0.4, 0.5]);
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.window(), vec![0.2, 0.3, 0.4, 0.5]);
    }

    #[test]
    fn test_window_zero_padded_while_filling() {
        let mut buffer = WaveformBuffer::new(4);
        buffer.push_samples(&[0.5]);
        assert_eq!(buffer.window(), vec![0.0, 0.0, 0.0, 0.5]);
    }

    #[test]
    fn silence_is_centred_in_time_domain() {
        let analyser = Analyser::new(64);
        analyser.push_interleaved(&[0; 64], 1);
        let mut out = vec![0u8; 64];
        analyser.byte_time_domain_data(&mut out);
        assert!(out.iter().all(|&b| b == 128));
    }

    #[test]
    fn stereo_is_downmixed() {
        let analyser = Analyser::new(32);
        analyser.push_interleaved(&[i16::MAX, -i16::MAX, i16::MAX, -i16::MAX], 2);
        let mut out = vec![0u8; 32];
        analyser.byte_time_domain_data(&mut out);
        assert_eq!(out[31], 128);
        assert_eq!(out[30], 128);
    }

    #[test]
    fn silence_has_empty_spectrum() {
        let analyser = Analyser::new(256);
        analyser.push_interleaved(&[0; 256], 1);
        let mut out = vec![0u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn spectrum_follows_window_size_changes() {
        let analyser = Analyser::new(64);
        analyser.push_interleaved(&[1000; 64], 1);
        let mut out = vec![0u8; 32];
        analyser.byte_frequency_data(&mut out);
        analyser.byte_frequency_data(&mut out);

        analyser.configure(512, 0.5);
        analyser.push_interleaved(&[1000; 512], 1);
        let mut out = vec![0u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut out);
        assert_eq!(out.len(), 256);
        assert!(out[0] > 0);
    }

    #[test]
    fn spectrum_state_larger_than_window_is_tolerated() {
        let analyser = Analyser::new(64);
        analyser.push_interleaved(&[1000; 64], 1);
        // As left by a configure racing with a read
        analyser.spectrum.lock().unwrap().previous = vec![0.0; 1024];
        let mut out = vec![0u8; 1024];
        analyser.byte_frequency_data(&mut out);
        assert!(out[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let analyser = Analyser::new(256);
        analyser.configure(256, 0.0);
        // 16 cycles over the window lands exactly on bin 16
        let samples: Vec<i16> = (0..256)
            .map(|i| {
                let phase = std::f32::consts::TAU * 16.0 * i as f32 / 256.0;
                (phase.sin() * 100.0) as i16
            })
            .collect();
        analyser.push_interleaved(&samples, 1);

        let mut out = vec![0u8; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut out);

        let (peak_bin, _) = out
            .iter()
            .enumerate()
            .max_by_key(|(_, &v)| v)
            .unwrap();
        assert_eq!(peak_bin, 16);
        assert!(out[16] > out[64]);
    }

    #[test]
    fn rms_of_full_scale_is_near_one() {
        let analyser = Analyser::new(64);
        analyser.push_interleaved(&[i16::MAX; 64], 1);
        assert!(analyser.rms_level() > 0.99);
        analyser.reset();
        assert_eq!(analyser.rms_level(), 0.0);
    }

    #[test]
    fn fft_size_is_power_of_two() {
        assert_eq!(Analyser::new(1000).fft_size(), 1024);
        assert_eq!(Analyser::new(2048).frequency_bin_count(), 1024);
    }
}
