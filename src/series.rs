use ndarray::{s, Array3, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ColorimeterError;

pub const NUM_CHANNELS: usize = 3;
pub const NUM_FIELDS: usize = 3;

pub const FIELD_SIGNAL: usize = 0;
pub const FIELD_ELAPSED: usize = 1;
pub const FIELD_TEMPERATURE: usize = 2;

/// One LED/photodetector color path, in fixed rotation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Blue = 0,
    Green = 1,
    Red = 2,
}

impl Channel {
    pub const ALL: [Channel; NUM_CHANNELS] = [Channel::Blue, Channel::Green, Channel::Red];

    pub fn index(self) -> usize {
        self as usize
    }

    /// LED wavelength, as printed on the plot legend.
    pub fn wavelength_label(self) -> &'static str {
        match self {
            Channel::Blue => "460 nm",
            Channel::Green => "520 nm",
            Channel::Red => "645 nm",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Channel::Blue => "Blue",
            Channel::Green => "Green",
            Channel::Red => "Red",
        }
    }
}

/// Full time-ordered set of cycle samples for one run.
///
/// Shape is (cycles, channel, field) with fields signal / elapsed seconds /
/// temperature. Only channel 0 carries a meaningful temperature; the slots of
/// channels 1 and 2 are reserved but stay zero, matching the archive layout
/// this tool has always written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Series {
    readings: Array3<f64>,
}

impl Series {
    /// Pre-allocates an all-zero series for a run of `cycles` cycles.
    pub fn with_capacity(cycles: usize) -> Self {
        Self {
            readings: Array3::zeros((cycles, NUM_CHANNELS, NUM_FIELDS)),
        }
    }

    pub fn from_array(readings: Array3<f64>) -> Result<Self, ColorimeterError> {
        let series = Self { readings };
        series.validate()?;
        Ok(series)
    }

    pub fn validate(&self) -> Result<(), ColorimeterError> {
        let (_, channels, fields) = self.readings.dim();
        if channels != NUM_CHANNELS || fields != NUM_FIELDS {
            return Err(ColorimeterError::InvalidParameter(format!(
                "series must have shape (N, {NUM_CHANNELS}, {NUM_FIELDS}), got (N, {channels}, {fields})"
            )));
        }
        Ok(())
    }

    /// Number of cycles.
    pub fn len(&self) -> usize {
        self.readings.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_array(&self) -> &Array3<f64> {
        &self.readings
    }

    pub fn set_signal(&mut self, cycle: usize, channel: Channel, value: f64) {
        self.readings[[cycle, channel.index(), FIELD_SIGNAL]] = value;
    }

    pub fn set_elapsed(&mut self, cycle: usize, channel: Channel, seconds: f64) {
        self.readings[[cycle, channel.index(), FIELD_ELAPSED]] = seconds;
    }

    /// Temperature lives in channel 0's reserved slot only.
    pub fn set_temperature(&mut self, cycle: usize, value: f64) {
        self.readings[[cycle, Channel::Blue.index(), FIELD_TEMPERATURE]] = value;
    }

    pub fn signal(&self, channel: Channel) -> ArrayView1<'_, f64> {
        self.readings.slice(s![.., channel.index(), FIELD_SIGNAL])
    }

    pub fn elapsed(&self, channel: Channel) -> ArrayView1<'_, f64> {
        self.readings.slice(s![.., channel.index(), FIELD_ELAPSED])
    }

    pub fn temperature(&self) -> ArrayView1<'_, f64> {
        self.readings
            .slice(s![.., Channel::Blue.index(), FIELD_TEMPERATURE])
    }

    pub fn channel_mean(&self, channel: Channel) -> f64 {
        self.signal(channel).mean().unwrap_or(0.0)
    }

    /// Copy of the first `keep` cycles (clamped to the series length).
    pub fn truncated(&self, keep: usize) -> Series {
        let keep = keep.min(self.len());
        Series {
            readings: self.readings.slice(s![..keep, .., ..]).to_owned(),
        }
    }

    /// Stacks `other` after `self` along the cycle axis, e.g. to stitch a run
    /// back together with its continuation.
    pub fn concat(&self, other: &Series) -> Result<Series, ColorimeterError> {
        let readings = ndarray::concatenate(
            Axis(0),
            &[self.readings.view(), other.readings.view()],
        )
        .map_err(|e| ColorimeterError::InvalidParameter(format!("cannot concatenate: {e}")))?;
        Ok(Series { readings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_series(cycles: usize) -> Series {
        let mut series = Series::with_capacity(cycles);
        for cycle in 0..cycles {
            for channel in Channel::ALL {
                series.set_signal(cycle, channel, (cycle * 10 + channel.index()) as f64);
                series.set_elapsed(cycle, channel, cycle as f64 * 0.5);
            }
            series.set_temperature(cycle, 20.0 + cycle as f64);
        }
        series
    }

    #[test]
    fn capacity_shapes_series() {
        let series = Series::with_capacity(4);
        assert_eq!(series.len(), 4);
        assert_eq!(series.as_array().dim(), (4, 3, 3));
    }

    #[test]
    fn temperature_only_on_channel_zero() {
        let series = sample_series(2);
        assert_eq!(series.temperature()[0], 20.0);
        // reserved slots of the other channels stay zero
        assert_eq!(series.as_array()[[0, 1, FIELD_TEMPERATURE]], 0.0);
        assert_eq!(series.as_array()[[0, 2, FIELD_TEMPERATURE]], 0.0);
    }

    #[test]
    fn channel_mean_averages_signal() {
        let series = sample_series(3);
        // Blue signal values: 0, 10, 20
        assert!((series.channel_mean(Channel::Blue) - 10.0).abs() < 1e-12);
    }

    #[test]
    fn truncated_keeps_prefix() {
        let series = sample_series(5);
        let cut = series.truncated(2);
        assert_eq!(cut.len(), 2);
        assert_eq!(cut.signal(Channel::Green)[1], 11.0);
        // clamping, not an error, past the end
        assert_eq!(series.truncated(100).len(), 5);
    }

    #[test]
    fn concat_stacks_cycles() {
        let a = sample_series(2);
        let b = sample_series(3);
        let joined = a.concat(&b).unwrap();
        assert_eq!(joined.len(), 5);
        assert_eq!(joined.signal(Channel::Red)[2], 2.0);
    }

    #[test]
    fn from_array_rejects_bad_shape() {
        let bad = Array3::<f64>::zeros((4, 2, 3));
        assert!(matches!(
            Series::from_array(bad),
            Err(ColorimeterError::InvalidParameter(_))
        ));
    }
}
