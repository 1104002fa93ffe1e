//! Pyloric circuit trace windows.
//!
//! Pre-computed traces of the three pyloric neurons (AB/PD, LP, PY) are split into an
//! "initial" window `[init, init + observe)` and an "adapted" window starting at
//! `init + observe + adapt`. Both windows are rebased to start at zero so they can be
//! drawn side by side on a shared `[0, observe)` axis.

use crate::{window_spikes, CoreError, Result, Time, TimeSeries};
use serde::{Deserialize, Serialize};

/// Neuron labels and plot colours, in trace order
pub const PYLORIC_NEURONS: [(&str, &str); 3] = [
    ("AB/PD", "#1f77b4"),
    ("LP", "#ff7f03"),
    ("PY", "#2ca02c"),
];

/// Pre-computed pyloric network output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyloricTraces {
    /// Shared time axis (s)
    pub times: Vec<Time>,
    /// Recorded variable, one row per neuron
    pub membrane_potential: Vec<Vec<f64>>,
    /// Spike times per neuron (s)
    #[serde(default)]
    pub spike_trains: Option<Vec<Vec<Time>>>,
    /// Name of the recorded variable
    #[serde(default = "default_varname")]
    pub varname: String,
}

fn default_varname() -> String {
    "v".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptationWindows {
    pub init_time: Time,
    pub observe_time: Time,
    pub adapt_time: Time,
}

impl AdaptationWindows {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("init_time", self.init_time),
            ("observe_time", self.observe_time),
            ("adapt_time", self.adapt_time),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(CoreError::InvalidTraces(format!(
                    "{} must be finite and non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// `[start, end)` of the window before adaptation
    pub fn initial(&self) -> (Time, Time) {
        (self.init_time, self.init_time + self.observe_time)
    }

    /// Start of the open-ended window after adaptation
    pub fn adapted_start(&self) -> Time {
        self.init_time + self.observe_time + self.adapt_time
    }
}

/// One neuron inside a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronPanel {
    pub label: String,
    pub color: String,
    pub trace: TimeSeries,
    pub spikes: Option<Vec<Time>>,
    /// Row in the spike raster (AB/PD on top)
    pub raster_row: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowPanel {
    pub title: String,
    pub start: Time,
    pub neurons: Vec<NeuronPanel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyloricPanels {
    pub initial: WindowPanel,
    pub adapted: WindowPanel,
    /// Shared x range of both panels
    pub x_range: (Time, Time),
}

impl PyloricTraces {
    fn validate(&self) -> Result<()> {
        if self.membrane_potential.len() != PYLORIC_NEURONS.len() {
            return Err(CoreError::InvalidTraces(format!(
                "expected {} traces, got {}",
                PYLORIC_NEURONS.len(),
                self.membrane_potential.len()
            )));
        }
        for (row, (label, _)) in self.membrane_potential.iter().zip(PYLORIC_NEURONS) {
            if row.len() != self.times.len() {
                return Err(CoreError::InvalidTraces(format!(
                    "{}: {} samples for {} time points",
                    label,
                    row.len(),
                    self.times.len()
                )));
            }
        }
        if let Some(trains) = &self.spike_trains {
            if trains.len() != PYLORIC_NEURONS.len() {
                return Err(CoreError::InvalidTraces(format!(
                    "expected {} spike trains, got {}",
                    PYLORIC_NEURONS.len(),
                    trains.len()
                )));
            }
        }
        Ok(())
    }

    fn panel(&self, title: &str, start: Time, end: Time) -> Result<WindowPanel> {
        let mut neurons = Vec::with_capacity(PYLORIC_NEURONS.len());
        for (idx, (label, color)) in PYLORIC_NEURONS.iter().enumerate() {
            let series = TimeSeries::from_parts(
                &self.varname,
                self.times.clone(),
                self.membrane_potential[idx].clone(),
            )?;
            let spikes = self
                .spike_trains
                .as_ref()
                .map(|trains| window_spikes(&trains[idx], start, end));
            neurons.push(NeuronPanel {
                label: label.to_string(),
                color: color.to_string(),
                trace: series.window(start, end),
                spikes,
                raster_row: (PYLORIC_NEURONS.len() - idx) as f64,
            });
        }
        Ok(WindowPanel {
            title: title.to_string(),
            start,
            neurons,
        })
    }

    /// Split the traces into the initial and adapted windows
    pub fn split(&self, windows: &AdaptationWindows) -> Result<PyloricPanels> {
        windows.validate()?;
        self.validate()?;

        let (initial_start, initial_end) = windows.initial();
        Ok(PyloricPanels {
            initial: self.panel("initial", initial_start, initial_end)?,
            adapted: self.panel("adapted", windows.adapted_start(), f64::INFINITY)?,
            x_range: (0.0, windows.observe_time),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traces() -> PyloricTraces {
        let times: Vec<f64> = (0..10).map(|i| i as f64).collect();
        PyloricTraces {
            membrane_potential: (0..3)
                .map(|n| times.iter().map(|t| t + 100.0 * n as f64).collect())
                .collect(),
            times,
            spike_trains: Some(vec![vec![1.5, 2.5, 8.0], vec![2.0], vec![9.5]]),
            varname: "v".into(),
        }
    }

    #[test]
    fn test_split_windows() {
        let windows = AdaptationWindows { init_time: 1.0, observe_time: 2.0, adapt_time: 4.0 };
        let panels = traces().split(&windows).unwrap();

        let ab = &panels.initial.neurons[0];
        assert_eq!(ab.label, "AB/PD");
        assert_eq!(ab.trace.time, vec![0.0, 1.0]);
        assert_eq!(ab.trace.values, vec![1.0, 2.0]);
        assert_eq!(ab.spikes.as_deref(), Some(&[0.5, 1.5][..]));

        // adapted window starts at 7 and is open-ended
        let py = &panels.adapted.neurons[2];
        assert_eq!(py.trace.values, vec![207.0, 208.0, 209.0]);
        assert_eq!(py.spikes.as_deref(), Some(&[2.5][..]));
        assert_eq!(py.raster_row, 1.0);
        assert_eq!(panels.x_range, (0.0, 2.0));
    }

    #[test]
    fn test_split_without_spikes() {
        let mut t = traces();
        t.spike_trains = None;
        let windows = AdaptationWindows { init_time: 0.0, observe_time: 3.0, adapt_time: 0.0 };
        let panels = t.split(&windows).unwrap();
        assert!(panels.initial.neurons.iter().all(|n| n.spikes.is_none()));
    }

    #[test]
    fn test_rejects_wrong_trace_count() {
        let mut t = traces();
        t.membrane_potential.pop();
        let windows = AdaptationWindows { init_time: 0.0, observe_time: 1.0, adapt_time: 1.0 };
        assert!(t.split(&windows).is_err());
    }

    #[test]
    fn test_rejects_negative_window() {
        let windows = AdaptationWindows { init_time: -1.0, observe_time: 1.0, adapt_time: 1.0 };
        assert!(traces().split(&windows).is_err());
    }

    #[test]
    fn test_traces_from_json() {
        let json = r#"{"times": [0.0, 0.1], "membrane_potential": [[1,2],[3,4],[5,6]]}"#;
        let t: PyloricTraces = serde_json::from_str(json).unwrap();
        assert_eq!(t.varname, "v");
        assert!(t.spike_trains.is_none());
    }
}
