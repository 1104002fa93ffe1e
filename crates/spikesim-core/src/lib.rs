//! # spikesim Core
//!
//! Shared types and utilities for the spikesim workspace.
//!
//! ## Contents
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`units`] | Physical units, dimensions and SI quantities |
//! | [`signal`] | External signal sources consumed by the engine |
//! | [`window`] | Slicing pre-computed pyloric traces into initial/adapted windows |
//!
//! ## Conventions
//!
//! 1. All values are stored in SI base units (seconds, volts, amperes)
//! 2. Time is a plain `f64` in seconds
//! 3. Recorded data is plain serde-friendly structs, ready for an external plotter

pub mod signal;
pub mod units;
pub mod window;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use signal::{FnSource, SignalError, SignalSource};
pub use units::{Dimension, Quantity, SiQuantity, Unit};
pub use window::{AdaptationWindows, PyloricPanels, PyloricTraces, WindowPanel};

/// Common errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Unit error: {0}")]
    UnitError(String),

    #[error("Invalid traces: {0}")]
    InvalidTraces(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Time point (s)
pub type Time = f64;

/// Voltage (V)
pub type Voltage = f64;

/// Per-neuron values of one state variable
pub type StateVector = Array1<f64>;

/// Time series data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Time points
    pub time: Vec<Time>,
    /// Values at each time point
    pub values: Vec<f64>,
    /// Variable name
    pub name: String,
    /// Units
    pub units: Option<String>,
}

impl TimeSeries {
    pub fn new(name: &str) -> Self {
        Self {
            time: Vec::new(),
            values: Vec::new(),
            name: name.to_string(),
            units: None,
        }
    }

    pub fn from_parts(name: &str, time: Vec<Time>, values: Vec<f64>) -> Result<Self> {
        if time.len() != values.len() {
            return Err(CoreError::InvalidTraces(format!(
                "{}: {} time points but {} values",
                name,
                time.len(),
                values.len()
            )));
        }
        Ok(Self {
            time,
            values,
            name: name.to_string(),
            units: None,
        })
    }

    pub fn push(&mut self, t: Time, v: f64) {
        self.time.push(t);
        self.values.push(v);
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Samples with `start <= t < end`, shifted so that `start` becomes zero.
    ///
    /// Pass `f64::INFINITY` as `end` for an open-ended window.
    pub fn window(&self, start: Time, end: Time) -> TimeSeries {
        let mut out = TimeSeries::new(&self.name);
        out.units = self.units.clone();
        for (&t, &v) in self.time.iter().zip(self.values.iter()) {
            if t >= start && t < end {
                out.push(t - start, v);
            }
        }
        out
    }
}

/// Spike times within `[start, end)`, shifted so that `start` becomes zero.
pub fn window_spikes(spikes: &[Time], start: Time, end: Time) -> Vec<Time> {
    spikes
        .iter()
        .filter(|&&t| t >= start && t < end)
        .map(|&t| t - start)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_series() {
        let mut ts = TimeSeries::new("voltage");
        ts.push(0.0, -65.0);
        ts.push(0.1, -64.0);
        assert_eq!(ts.len(), 2);
    }

    #[test]
    fn test_time_series_window_rebases() {
        let ts = TimeSeries::from_parts("v", vec![0.0, 1.0, 2.0, 3.0], vec![10.0, 11.0, 12.0, 13.0])
            .unwrap();
        let w = ts.window(1.0, 3.0);
        assert_eq!(w.time, vec![0.0, 1.0]);
        assert_eq!(w.values, vec![11.0, 12.0]);

        let open = ts.window(2.0, f64::INFINITY);
        assert_eq!(open.values, vec![12.0, 13.0]);
    }

    #[test]
    fn test_from_parts_length_mismatch() {
        let err = TimeSeries::from_parts("v", vec![0.0, 1.0], vec![1.0]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTraces(_)));
    }

    #[test]
    fn test_window_spikes() {
        let spikes = [0.5, 1.0, 1.5, 2.0];
        assert_eq!(window_spikes(&spikes, 1.0, 2.0), vec![0.0, 0.5]);
    }
}
