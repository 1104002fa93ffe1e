//! # spikesim-brian: discrete-time spiking network engine
//!
//! Brian-style models: equations, thresholds and resets are written as text, unit
//! checked and compiled once into evaluation plans. The engine then advances a fixed
//! time step.
//!
//! - Equation parser for differential equations, subexpressions and parameters
//! - Exact and Euler–Maruyama integration
//! - Threshold / reset / refractory event engine
//! - Synapses with per-connection delays and a delivery heap
//! - Per-step memoised external signals
//! - State and spike recording
//!
//! ```no_run
//! use spikesim_brian::{parse_equations, Network, NeuronGroup, Recordable, Selector, SimulationConfig};
//!
//! let mut net = Network::new(SimulationConfig::default());
//! let eqs = parse_equations("dv/dt = (1.2 - v)/(10*ms) : 1").unwrap();
//! net.add_neuron_group(NeuronGroup::new("g", 10, eqs).with_threshold("v > 1").with_reset("v = 0"))
//!     .unwrap();
//! let spikes = net.record("g", Recordable::Spikes, Selector::All);
//! let mut sim = net.build().unwrap();
//! sim.run(0.1).unwrap();
//! let recording = sim.finish();
//! println!("{} spikes", recording.spikes(spikes).unwrap().total());
//! ```

pub mod equations;
pub mod expr;
pub mod group;
pub mod model_file;
pub mod models;
pub mod monitors;
pub mod network;
pub mod plan;
pub mod scheduler;
pub mod signals;
pub mod synapses;

use serde::{Deserialize, Serialize};
use spikesim_core::{CoreError, SiQuantity, Time};
use std::collections::BTreeMap;
use thiserror::Error;

pub use equations::{
    parse_equations, AlgebraicEquation, DifferentialEquation, IntegrationMethod, NeuronEquations, Parameter,
    RefractorySpec, ResetEquations, ThresholdCondition,
};
pub use group::{GroupState, InitialValue, NeuronGroup};
pub use model_file::{no_external_signals, NetworkSpec, SignalKind, SignalSpec};
pub use models::{tonotopy_network, TonotopyNetwork, TonotopyParams};
pub use monitors::{MonitorId, MonitorRecord, Recordable, Recording, Selector, SpikeRecord, StateTrace};
pub use network::{Network, RunPhase, RunProgress, RunStatus, Simulation, SimulationConfig, StopHandle};
pub use signals::SignalBank;
pub use synapses::{Connectivity, SynapseState, Synapses};

#[derive(Error, Debug)]
pub enum SimError {
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Simulation error: {0}")]
    SimulationError(String),
    #[error("Invalid equation: {0}")]
    EquationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Unit mismatch in {context}: expected {expected}, got {got}")]
    UnitError { context: String, expected: String, got: String },
    #[error("Unknown identifier '{name}' in {context}")]
    UnknownIdentifier { name: String, context: String },
    #[error("Invalid delay {delay} for synapse {synapse} of '{synapses}'")]
    InvalidDelay { synapses: String, synapse: usize, delay: f64 },
    #[error("Non-finite value {value} in {group}.{variable}[{neuron}] at step {step}")]
    NonFinite { group: String, variable: String, neuron: usize, step: u64, value: f64 },
    #[error("Signal '{name}' exhausted at step {step}")]
    SignalExhausted { name: String, step: u64 },
    #[error("Signal '{name}' failed at step {step}: {message}")]
    SignalFailed { name: String, step: u64, message: String },
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SimError>;

/// Named constants visible to every expression, in SI units
pub type Namespace = BTreeMap<String, SiQuantity>;

/// One emitted spike
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    /// Index of the emitting group, in insertion order
    pub group: usize,
    pub neuron: usize,
    pub step: u64,
    pub time: Time,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_length_is_stable() {
        let mut net = Network::new(SimulationConfig { dt: 1e-3, seed: 5 });
        let eqs = parse_equations("dv/dt = (2 - v)/(5*ms) + 0.1*xi/sqrt(ms) : 1\ng : 1").unwrap();
        net.add_neuron_group(NeuronGroup::new("a", 7, eqs.clone()).with_threshold("v > 1").with_reset("v = 0; g += 1"))
            .unwrap();
        net.add_neuron_group(NeuronGroup::new("b", 3, eqs)).unwrap();
        let mut syn = Synapses::new("ab", "a", "b", "v += 0.2; g -= 1");
        syn.connect_random(0.5);
        syn.set_delay("i*ms");
        net.add_synapses(syn).unwrap();
        let mut sim = net.build().unwrap();

        for _ in 0..10 {
            sim.run(0.005).unwrap();
            for (name, n) in [("a", 7), ("b", 3)] {
                let group = sim.group(name).unwrap();
                assert_eq!(group.len(), n);
                for var in ["v", "g"] {
                    assert_eq!(group.values(var).unwrap().len(), n);
                }
            }
        }
        assert!(sim.spikes_emitted() > 0);
    }

    #[test]
    fn test_error_display() {
        let err = SimError::NonFinite { group: "g".into(), variable: "v".into(), neuron: 3, step: 12, value: f64::NAN };
        assert_eq!(err.to_string(), "Non-finite value NaN in g.v[3] at step 12");
        let err: SimError = CoreError::UnitError("unknown unit 'parsec'".into()).into();
        assert!(err.to_string().contains("parsec"));
    }
}
