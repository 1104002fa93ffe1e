//! Recording of state variables and spikes.
//!
//! Monitors are declared on the [`Network`](crate::Network) and turned into a
//! [`Recorder`] at build time. Every completed step appends one sample per recorded
//! neuron, so all trajectories share the Recording's time axis. [`Recording`] is the
//! immutable result handed out when the run is finished.

use crate::group::GroupState;
use crate::plan::EvalContext;
use crate::{Result, SimError, SpikeEvent};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use spikesim_core::TimeSeries;
use std::collections::HashMap;

/// What a monitor records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recordable {
    /// State variable or subexpression
    Variable(String),
    Spikes,
}

/// Which neurons a monitor records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    #[default]
    All,
    Indices(Vec<usize>),
}

/// Handle returned by [`Network::record`](crate::Network::record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorSpec {
    pub group: String,
    pub what: Recordable,
    #[serde(default)]
    pub selector: Selector,
}

// ============================================================================
// RECORDED DATA
// ============================================================================

/// Recorded state variable: one row per recorded neuron, one column per step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTrace {
    pub group: String,
    pub variable: String,
    pub indices: Vec<usize>,
    pub values: Array2<f64>,
}

impl StateTrace {
    /// Trajectory of one neuron (by group index)
    pub fn trace(&self, neuron: usize) -> Option<ArrayView1<'_, f64>> {
        let row = self.indices.iter().position(|&i| i == neuron)?;
        Some(self.values.row(row))
    }

    pub fn series(&self, neuron: usize, times: &[f64]) -> Option<TimeSeries> {
        let trace = self.trace(neuron)?;
        TimeSeries::from_parts(&self.variable, times.to_vec(), trace.to_vec()).ok()
    }
}

/// Recorded spikes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeRecord {
    pub group: String,
    pub indices: Vec<usize>,
    /// Recorded spikes: (neuron_idx, time) in emission order
    pub spikes: Vec<(usize, f64)>,
    /// Spike counts per neuron of the group
    pub counts: Vec<usize>,
}

impl SpikeRecord {
    /// Get spike trains for each neuron
    pub fn spike_trains(&self) -> HashMap<usize, Vec<f64>> {
        let mut trains: HashMap<usize, Vec<f64>> = HashMap::new();
        for &(idx, time) in &self.spikes {
            trains.entry(idx).or_default().push(time);
        }
        trains
    }

    /// Strictly increasing spike times of one neuron
    pub fn train(&self, neuron: usize) -> Vec<f64> {
        self.spikes
            .iter()
            .filter(|(i, _)| *i == neuron)
            .map(|&(_, t)| t)
            .collect()
    }

    pub fn total(&self) -> usize {
        self.spikes.len()
    }

    /// Calculate firing rate in Hz, averaged over the recorded neurons
    pub fn mean_rate(&self, duration: f64) -> f64 {
        if self.indices.is_empty() || duration <= 0.0 {
            return 0.0;
        }
        (self.spikes.len() as f64) / (self.indices.len() as f64) / duration
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorRecord {
    State(StateTrace),
    Spikes(SpikeRecord),
}

/// Everything recorded during a run, immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub dt: f64,
    /// Shared time axis, one entry per completed step
    pub times: Vec<f64>,
    pub monitors: Vec<MonitorRecord>,
}

impl Recording {
    pub fn state(&self, id: MonitorId) -> Option<&StateTrace> {
        match self.monitors.get(id.0)? {
            MonitorRecord::State(trace) => Some(trace),
            MonitorRecord::Spikes(_) => None,
        }
    }

    pub fn spikes(&self, id: MonitorId) -> Option<&SpikeRecord> {
        match self.monitors.get(id.0)? {
            MonitorRecord::Spikes(record) => Some(record),
            MonitorRecord::State(_) => None,
        }
    }

    /// Number of recorded steps
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Simulated time covered by the recording
    pub fn duration(&self) -> f64 {
        self.times.len() as f64 * self.dt
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ============================================================================
// RECORDER
// ============================================================================

enum TraceSource {
    Variable(usize),
    Inline(usize),
}

struct TraceBuffer {
    group: usize,
    group_name: String,
    variable: String,
    source: TraceSource,
    indices: Vec<usize>,
    /// One row per recorded neuron
    rows: Vec<Vec<f64>>,
}

struct SpikeBuffer {
    group: usize,
    group_name: String,
    indices: Vec<usize>,
    selected: Vec<bool>,
    spikes: Vec<(usize, f64)>,
    counts: Vec<usize>,
}

enum Buffer {
    State(TraceBuffer),
    Spikes(SpikeBuffer),
}

/// Appends one sample per step for every monitor
pub struct Recorder {
    dt: f64,
    times: Vec<f64>,
    buffers: Vec<Buffer>,
}

impl Recorder {
    pub(crate) fn new(specs: &[MonitorSpec], groups: &[GroupState], dt: f64) -> Result<Self> {
        let mut buffers = Vec::with_capacity(specs.len());
        for spec in specs {
            let group = groups
                .iter()
                .position(|g| g.name() == spec.group)
                .ok_or_else(|| SimError::ConfigError(format!("monitor on unknown group '{}'", spec.group)))?;
            let n = groups[group].len();
            let indices = match &spec.selector {
                Selector::All => (0..n).collect(),
                Selector::Indices(list) => {
                    if let Some(bad) = list.iter().find(|&&i| i >= n) {
                        return Err(SimError::ConfigError(format!(
                            "monitor index {} out of range for group '{}' ({} neurons)",
                            bad, spec.group, n
                        )));
                    }
                    list.clone()
                }
            };

            let buffer = match &spec.what {
                Recordable::Variable(name) => {
                    let source = if let Some(idx) = groups[group].variable_index(name) {
                        TraceSource::Variable(idx)
                    } else if let Some(idx) = groups[group].inline_index(name) {
                        TraceSource::Inline(idx)
                    } else {
                        return Err(SimError::UnknownIdentifier {
                            name: name.clone(),
                            context: format!("monitor on group '{}'", spec.group),
                        });
                    };
                    Buffer::State(TraceBuffer {
                        group,
                        group_name: spec.group.clone(),
                        variable: name.clone(),
                        source,
                        rows: vec![Vec::new(); indices.len()],
                        indices,
                    })
                }
                Recordable::Spikes => {
                    let mut selected = vec![false; n];
                    for &i in &indices {
                        selected[i] = true;
                    }
                    Buffer::Spikes(SpikeBuffer {
                        group,
                        group_name: spec.group.clone(),
                        indices,
                        selected,
                        spikes: Vec::new(),
                        counts: vec![0; n],
                    })
                }
            };
            buffers.push(buffer);
        }
        Ok(Self { dt, times: Vec::new(), buffers })
    }

    /// Append the state after a completed step
    pub(crate) fn record(
        &mut self,
        t: f64,
        groups: &[GroupState],
        events: Vec<SpikeEvent>,
        ctx: &mut EvalContext<'_>,
    ) -> Result<()> {
        // evaluate everything first so a failure leaves the buffers aligned
        let mut samples: Vec<Vec<f64>> = Vec::new();
        for buffer in &self.buffers {
            if let Buffer::State(trace) = buffer {
                let group = &groups[trace.group];
                let mut row = Vec::with_capacity(trace.indices.len());
                for &neuron in &trace.indices {
                    let value = match trace.source {
                        TraceSource::Variable(slot) => group.values[slot][neuron],
                        TraceSource::Inline(idx) => group.eval_inline(idx, neuron, ctx)?,
                    };
                    row.push(value);
                }
                samples.push(row);
            }
        }

        let mut samples = samples.into_iter();
        for buffer in &mut self.buffers {
            match buffer {
                Buffer::State(trace) => {
                    if let Some(row) = samples.next() {
                        for (dst, value) in trace.rows.iter_mut().zip(row) {
                            dst.push(value);
                        }
                    }
                }
                Buffer::Spikes(record) => {
                    for event in events.iter().filter(|e| e.group == record.group) {
                        if record.selected[event.neuron] {
                            record.spikes.push((event.neuron, event.time));
                            record.counts[event.neuron] += 1;
                        }
                    }
                }
            }
        }
        self.times.push(t);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub(crate) fn finish(self) -> Recording {
        let steps = self.times.len();
        let monitors = self
            .buffers
            .into_iter()
            .map(|buffer| match buffer {
                Buffer::State(trace) => {
                    let rows = trace.indices.len();
                    let flat: Vec<f64> = trace.rows.into_iter().flatten().collect();
                    let values = Array2::from_shape_vec((rows, steps), flat)
                        .unwrap_or_else(|_| Array2::zeros((rows, steps)));
                    MonitorRecord::State(StateTrace {
                        group: trace.group_name,
                        variable: trace.variable,
                        indices: trace.indices,
                        values,
                    })
                }
                Buffer::Spikes(record) => MonitorRecord::Spikes(SpikeRecord {
                    group: record.group_name,
                    indices: record.indices,
                    spikes: record.spikes,
                    counts: record.counts,
                }),
            })
            .collect();
        Recording { dt: self.dt, times: self.times, monitors }
    }
}
