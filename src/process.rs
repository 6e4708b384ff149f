//! Offline transforms over a loaded series. Nothing here touches hardware;
//! every operation returns a fresh series and leaves its input untouched.

use std::f64::consts::PI;

use ndarray::{s, Array1, ArrayView1};

use crate::error::ColorimeterError;
use crate::series::{Channel, Series, FIELD_SIGNAL, FIELD_TEMPERATURE};

/// The rate the offline filters assume the cycles were sampled at.
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 3000.0;

const BUTTERWORTH_ORDER: usize = 10;

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
struct BiquadSection {
    coeffs: BiquadCoeffs,
    state: BiquadState,
}

impl BiquadSection {
    fn new(coeffs: BiquadCoeffs) -> Self {
        Self {
            coeffs,
            state: BiquadState::default(),
        }
    }

    fn process(&mut self, input: f64) -> f64 {
        // transposed direct form II
        let y = self.coeffs.b0 * input + self.state.z1;
        self.state.z1 = self.coeffs.b1 * input - self.coeffs.a1 * y + self.state.z2;
        self.state.z2 = self.coeffs.b2 * input - self.coeffs.a2 * y;
        y
    }
}

fn lowpass_coeffs(freq_hz: f64, sample_rate_hz: f64, q: f64) -> BiquadCoeffs {
    let w0 = 2.0 * PI * freq_hz / sample_rate_hz;
    let alpha = (w0 / 2.0).sin() / (2.0 * q);
    let cos_w0 = w0.cos();
    let b0 = (1.0 - cos_w0) * 0.5;
    let b1 = 1.0 - cos_w0;
    let b2 = b0;
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_w0;
    let a2 = 1.0 - alpha;
    let a0_inv = 1.0 / a0;
    BiquadCoeffs {
        b0: b0 * a0_inv,
        b1: b1 * a0_inv,
        b2: b2 * a0_inv,
        a1: a1 * a0_inv,
        a2: a2 * a0_inv,
    }
}

/// Butterworth lowpass as a cascade of second-order sections. Section Q
/// values come from the analog prototype's pole angles.
fn butterworth_sections(cutoff_hz: f64, sample_rate_hz: f64) -> Vec<BiquadSection> {
    (0..BUTTERWORTH_ORDER / 2)
        .map(|k| {
            let pole_angle = PI * (2 * k + 1) as f64 / (2 * BUTTERWORTH_ORDER) as f64;
            let q = 1.0 / (2.0 * pole_angle.cos());
            BiquadSection::new(lowpass_coeffs(cutoff_hz, sample_rate_hz, q))
        })
        .collect()
}

fn run_forward(sections: &mut [BiquadSection], input: ArrayView1<'_, f64>) -> Array1<f64> {
    input
        .iter()
        .map(|&x| sections.iter_mut().fold(x, |v, s| s.process(v)))
        .collect()
}

/// Forward-only 10th-order Butterworth lowpass at the fixed default sample
/// rate, applied to every channel's signal column and to channel 0's
/// temperature column.
pub fn lowpass(series: &Series, cutoff_hz: f64) -> Result<Series, ColorimeterError> {
    lowpass_with_rate(series, cutoff_hz, DEFAULT_SAMPLE_RATE_HZ)
}

pub fn lowpass_with_rate(
    series: &Series,
    cutoff_hz: f64,
    sample_rate_hz: f64,
) -> Result<Series, ColorimeterError> {
    if !(sample_rate_hz > 0.0) {
        return Err(ColorimeterError::InvalidParameter(format!(
            "sample rate must be positive, got {sample_rate_hz}"
        )));
    }
    if !(cutoff_hz > 0.0) {
        return Err(ColorimeterError::InvalidParameter(format!(
            "cutoff frequency must be positive, got {cutoff_hz}"
        )));
    }
    let nyquist = sample_rate_hz / 2.0;
    if cutoff_hz >= nyquist {
        return Err(ColorimeterError::InvalidParameter(format!(
            "cutoff frequency {cutoff_hz} Hz is at or above the Nyquist limit {nyquist} Hz"
        )));
    }

    let mut data = series.as_array().to_owned();
    for channel in Channel::ALL {
        // fresh filter state per column
        let mut sections = butterworth_sections(cutoff_hz, sample_rate_hz);
        let filtered = run_forward(
            &mut sections,
            data.slice(s![.., channel.index(), FIELD_SIGNAL]),
        );
        data.slice_mut(s![.., channel.index(), FIELD_SIGNAL])
            .assign(&filtered);
    }
    let mut sections = butterworth_sections(cutoff_hz, sample_rate_hz);
    let filtered = run_forward(
        &mut sections,
        data.slice(s![.., Channel::Blue.index(), FIELD_TEMPERATURE]),
    );
    data.slice_mut(s![.., Channel::Blue.index(), FIELD_TEMPERATURE])
        .assign(&filtered);
    Series::from_array(data)
}

/// Uniform moving average with numpy's `same` boundary behavior (the window
/// hangs over zero-padded edges). A window of 1 is the identity.
pub fn moving_average(series: &Series, window: usize) -> Result<Series, ColorimeterError> {
    if window == 0 {
        return Err(ColorimeterError::InvalidParameter(
            "window size must be positive".to_string(),
        ));
    }
    let mut data = series.as_array().to_owned();
    for channel in Channel::ALL {
        let averaged = convolve_same(data.slice(s![.., channel.index(), FIELD_SIGNAL]), window);
        data.slice_mut(s![.., channel.index(), FIELD_SIGNAL])
            .assign(&averaged);
    }
    let averaged = convolve_same(
        data.slice(s![.., Channel::Blue.index(), FIELD_TEMPERATURE]),
        window,
    );
    data.slice_mut(s![.., Channel::Blue.index(), FIELD_TEMPERATURE])
        .assign(&averaged);
    Series::from_array(data)
}

fn convolve_same(input: ArrayView1<'_, f64>, window: usize) -> Array1<f64> {
    let n = input.len();
    let offset = (window - 1) / 2;
    (0..n)
        .map(|i| {
            let center = i + offset;
            let lo = center.saturating_sub(window - 1);
            let hi = center.min(n.saturating_sub(1));
            let mut acc = 0.0;
            for k in lo..=hi {
                acc += input[k];
            }
            acc / window as f64
        })
        .collect()
}

/// Least-squares line through (elapsed, signal) of one channel; returns
/// (slope per second, intercept).
pub fn linear_trend(series: &Series, channel: Channel) -> Result<(f64, f64), ColorimeterError> {
    let x = series.elapsed(channel);
    let y = series.signal(channel);
    let n = x.len();
    if n < 2 {
        return Err(ColorimeterError::InvalidParameter(
            "trend needs at least two cycles".to_string(),
        ));
    }
    let x_mean = x.mean().unwrap_or(0.0);
    let y_mean = y.mean().unwrap_or(0.0);
    let mut covariance = 0.0;
    let mut variance = 0.0;
    for (&xi, &yi) in x.iter().zip(y.iter()) {
        covariance += (xi - x_mean) * (yi - y_mean);
        variance += (xi - x_mean) * (xi - x_mean);
    }
    if variance == 0.0 {
        return Err(ColorimeterError::InvalidParameter(
            "elapsed times are constant, trend is undefined".to_string(),
        ));
    }
    let slope = covariance / variance;
    Ok((slope, y_mean - slope * x_mean))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series_from_signal(values: &[f64]) -> Series {
        let mut series = Series::with_capacity(values.len());
        for (cycle, &value) in values.iter().enumerate() {
            for channel in Channel::ALL {
                series.set_signal(cycle, channel, value);
                series.set_elapsed(cycle, channel, cycle as f64);
            }
            series.set_temperature(cycle, value * 2.0);
        }
        series
    }

    #[test]
    fn transforms_preserve_shape() {
        let series = series_from_signal(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(lowpass(&series, 10.0).unwrap().as_array().dim(), (5, 3, 3));
        assert_eq!(
            moving_average(&series, 3).unwrap().as_array().dim(),
            (5, 3, 3)
        );
    }

    #[test]
    fn transforms_do_not_mutate_input() {
        let series = series_from_signal(&[1.0, 2.0, 3.0]);
        let copy = series.clone();
        lowpass(&series, 10.0).unwrap();
        moving_average(&series, 2).unwrap();
        assert_eq!(series, copy);
    }

    #[test]
    fn window_of_one_is_identity() {
        let series = series_from_signal(&[0.5, 0.25, 0.75, 0.1]);
        let averaged = moving_average(&series, 1).unwrap();
        assert_eq!(averaged, series);
    }

    #[test]
    fn moving_average_matches_numpy_same() {
        // np.convolve([1, 2, 3], ones(3)/3, mode='same') == [1, 2, 5/3]
        let series = series_from_signal(&[1.0, 2.0, 3.0]);
        let averaged = moving_average(&series, 3).unwrap();
        let signal = averaged.signal(Channel::Blue);
        assert!((signal[0] - 1.0).abs() < 1e-12);
        assert!((signal[1] - 2.0).abs() < 1e-12);
        assert!((signal[2] - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn moving_average_filters_temperature_column() {
        let series = series_from_signal(&[1.0, 2.0, 3.0]);
        let averaged = moving_average(&series, 3).unwrap();
        // temperature is 2x signal, same kernel
        assert!((averaged.temperature()[0] - 2.0).abs() < 1e-12);
        assert!((averaged.temperature()[1] - 4.0).abs() < 1e-12);
        // reserved slots of channels 1 and 2 stay zero
        assert_eq!(averaged.as_array()[[1, 1, FIELD_TEMPERATURE]], 0.0);
    }

    #[test]
    fn nonpositive_parameters_are_rejected() {
        let series = series_from_signal(&[1.0, 2.0]);
        assert!(matches!(
            moving_average(&series, 0),
            Err(ColorimeterError::InvalidParameter(_))
        ));
        assert!(matches!(
            lowpass(&series, 0.0),
            Err(ColorimeterError::InvalidParameter(_))
        ));
        assert!(matches!(
            lowpass(&series, -4.0),
            Err(ColorimeterError::InvalidParameter(_))
        ));
        assert!(matches!(
            lowpass_with_rate(&series, 10.0, 0.0),
            Err(ColorimeterError::InvalidParameter(_))
        ));
    }

    #[test]
    fn cutoff_at_or_above_nyquist_is_rejected() {
        let series = series_from_signal(&[1.0, 2.0]);
        assert!(matches!(
            lowpass(&series, 1500.0),
            Err(ColorimeterError::InvalidParameter(_))
        ));
        assert!(matches!(
            lowpass(&series, 2000.0),
            Err(ColorimeterError::InvalidParameter(_))
        ));
        assert!(lowpass(&series, 1499.0).is_ok());
    }

    #[test]
    fn lowpass_settles_to_dc_level() {
        let series = series_from_signal(&vec![1.0; 3000]);
        let filtered = lowpass(&series, 10.0).unwrap();
        let signal = filtered.signal(Channel::Green);
        assert!((signal[signal.len() - 1] - 1.0).abs() < 1e-2);
    }

    #[test]
    fn lowpass_attenuates_nyquist_rate_signal() {
        let values: Vec<f64> = (0..3000).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let series = series_from_signal(&values);
        let filtered = lowpass(&series, 10.0).unwrap();
        let signal = filtered.signal(Channel::Red);
        assert!(signal[signal.len() - 1].abs() < 1e-2);
    }

    #[test]
    fn linear_trend_recovers_line() {
        let mut series = Series::with_capacity(5);
        for cycle in 0..5 {
            for channel in Channel::ALL {
                series.set_elapsed(cycle, channel, cycle as f64);
                series.set_signal(cycle, channel, 3.0 * cycle as f64 + 0.5);
            }
        }
        let (slope, intercept) = linear_trend(&series, Channel::Blue).unwrap();
        assert!((slope - 3.0).abs() < 1e-12);
        assert!((intercept - 0.5).abs() < 1e-12);
    }

    #[test]
    fn linear_trend_needs_spread_in_time() {
        let series = series_from_signal(&[1.0]);
        assert!(matches!(
            linear_trend(&series, Channel::Blue),
            Err(ColorimeterError::InvalidParameter(_))
        ));
        let mut flat = Series::with_capacity(3);
        for cycle in 0..3 {
            for channel in Channel::ALL {
                flat.set_elapsed(cycle, channel, 1.0);
                flat.set_signal(cycle, channel, cycle as f64);
            }
        }
        assert!(matches!(
            linear_trend(&flat, Channel::Blue),
            Err(ColorimeterError::InvalidParameter(_))
        ));
    }
}
