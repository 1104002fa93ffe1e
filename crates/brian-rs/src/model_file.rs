//! JSON network descriptions.
//!
//! ```json
//! {
//!   "config": { "dt": 0.001, "seed": 7 },
//!   "constants": [{ "name": "tau", "value": "10*ms" }],
//!   "signals": [{ "name": "drive", "kind": "sine", "frequency": 5.0 }],
//!   "groups": [{
//!     "name": "g", "n": 10,
//!     "equations": "dv/dt = (drive(t) - v)/tau : 1",
//!     "threshold": "v > 0.8", "reset": "v = 0",
//!     "refractory": { "duration": "2*ms" }
//!   }],
//!   "monitors": [{ "group": "g", "what": "spikes" }]
//! }
//! ```
//!
//! Signal kinds other than `sine` and `constant` are resolved by a caller-supplied
//! factory, so this crate never touches audio files.

use crate::equations::{parse_equations, IntegrationMethod, RefractorySpec};
use crate::group::NeuronGroup;
use crate::monitors::{MonitorId, MonitorSpec};
use crate::network::{Network, SimulationConfig};
use crate::synapses::Synapses;
use crate::{Result, SimError};
use serde::{Deserialize, Serialize};
use spikesim_core::{FnSource, Quantity, SignalSource, Unit};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstantSpec {
    pub name: String,
    /// Expression over built-in units and earlier constants
    pub value: String,
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalKind {
    Sine {
        frequency: f64,
        #[serde(default = "one")]
        amplitude: f64,
    },
    Constant {
        value: f64,
    },
    /// C-major tone scale
    Scale {},
    Wav {
        path: PathBuf,
        #[serde(default = "one")]
        gain: f64,
        #[serde(default)]
        clip: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefractoryField {
    /// Time expression, e.g. `2*ms`
    Duration(String),
    Condition(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSpec {
    pub variable: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub name: String,
    pub n: usize,
    pub equations: String,
    #[serde(default)]
    pub threshold: Option<String>,
    #[serde(default)]
    pub reset: Option<String>,
    #[serde(default)]
    pub refractory: Option<RefractoryField>,
    #[serde(default)]
    pub method: IntegrationMethod,
    #[serde(default)]
    pub initial: Vec<InitialSpec>,
}

/// Complete network description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default)]
    pub config: SimulationConfig,
    /// Default run duration (s)
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub constants: Vec<ConstantSpec>,
    #[serde(default)]
    pub signals: Vec<SignalSpec>,
    pub groups: Vec<GroupSpec>,
    #[serde(default)]
    pub synapses: Vec<Synapses>,
    #[serde(default)]
    pub monitors: Vec<MonitorSpec>,
}

/// Sources this crate can build on its own
pub fn builtin_signal(kind: &SignalKind) -> Option<Box<dyn SignalSource>> {
    match *kind {
        SignalKind::Sine { frequency, amplitude } => Some(Box::new(FnSource::new(move |t: f64| {
            amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin()
        }))),
        SignalKind::Constant { value } => Some(Box::new(FnSource::new(move |_| value))),
        SignalKind::Scale {} | SignalKind::Wav { .. } => None,
    }
}

impl NetworkSpec {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Assemble the network. `factory` is asked for every signal that
    /// [`builtin_signal`] does not cover.
    pub fn into_network<F>(self, mut factory: F) -> Result<(Network, Vec<MonitorId>)>
    where
        F: FnMut(&SignalSpec) -> Result<Box<dyn SignalSource>>,
    {
        let mut net = Network::new(self.config);
        for constant in &self.constants {
            net.constant_expr(&constant.name, &constant.value)?;
        }
        for signal in &self.signals {
            let source = match builtin_signal(&signal.kind) {
                Some(source) => source,
                None => factory(signal)?,
            };
            net.add_signal(&signal.name, source)?;
        }

        for spec in &self.groups {
            let mut group = NeuronGroup::new(&spec.name, spec.n, parse_equations(&spec.equations)?)
                .with_method(spec.method);
            if let Some(threshold) = &spec.threshold {
                group = group.with_threshold(threshold);
            }
            if let Some(reset) = &spec.reset {
                group = group.with_reset(reset);
            }
            match &spec.refractory {
                Some(RefractoryField::Duration(text)) => {
                    let period = net.evaluate(text)?.as_time()?;
                    group = group.with_refractory(RefractorySpec::Duration(Quantity::new(period, Unit::Second)));
                }
                Some(RefractoryField::Condition(text)) => {
                    group = group.with_refractory(RefractorySpec::Condition(text.clone()));
                }
                None => {}
            }
            for initial in &spec.initial {
                group.set_expression(&initial.variable, &initial.value)?;
            }
            net.add_neuron_group(group)?;
        }

        for synapses in self.synapses {
            net.add_synapses(synapses)?;
        }
        let monitors = self
            .monitors
            .into_iter()
            .map(|m| net.record(&m.group, m.what, m.selector))
            .collect();

        debug!(groups = self.groups.len(), signals = self.signals.len(), "network loaded from description");
        Ok((net, monitors))
    }
}

/// Factory for descriptions that only use built-in signal kinds
pub fn no_external_signals(spec: &SignalSpec) -> Result<Box<dyn SignalSource>> {
    Err(SimError::ConfigError(format!(
        "signal '{}' needs an external source ({:?})",
        spec.name, spec.kind
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::{Recordable, Selector};
    use crate::synapses::Connectivity;
    use std::io::Write;

    const MODEL: &str = r#"{
        "config": { "dt": 0.001, "seed": 7 },
        "duration": 0.05,
        "constants": [
            { "name": "tau", "value": "10*ms" },
            { "name": "half", "value": "tau/2" }
        ],
        "signals": [{ "name": "drive", "kind": "constant", "value": 2.0 }],
        "groups": [
            {
                "name": "src", "n": 2,
                "equations": "dv/dt = (drive(t) - v)/tau : 1",
                "threshold": "v > 0.8", "reset": "v = 0",
                "refractory": { "duration": "half" },
                "method": "exact"
            },
            { "name": "dst", "n": 2, "equations": "dv/dt = -v/tau : 1\nw0 : 1", "initial": [{ "variable": "w0", "value": "i" }] }
        ],
        "synapses": [{
            "name": "s", "source": "src", "target": "dst",
            "on_pre": "v += 0.1",
            "connect": ["one_to_one"],
            "assignments": [{ "variable": "delay", "value": "2*ms" }]
        }],
        "monitors": [
            { "group": "src", "what": "spikes" },
            { "group": "dst", "what": { "variable": "v" }, "selector": { "indices": [1] } }
        ]
    }"#;

    #[test]
    fn test_parse_model() {
        let spec = NetworkSpec::from_json(MODEL).unwrap();
        assert_eq!(spec.config.seed, 7);
        assert_eq!(spec.groups[0].method, IntegrationMethod::Exact);
        assert_eq!(spec.synapses[0].connectivity, vec![Connectivity::OneToOne]);
        assert_eq!(spec.synapses[0].multisynaptic_index, "k");
        assert_eq!(spec.monitors[1].what, Recordable::Variable("v".into()));
        assert_eq!(spec.monitors[0].selector, Selector::All);
        assert!(matches!(spec.signals[0].kind, SignalKind::Constant { value } if value == 2.0));
    }

    #[test]
    fn test_run_model() {
        let spec = NetworkSpec::from_json(MODEL).unwrap();
        let duration = spec.duration.unwrap();
        let (net, monitors) = spec.into_network(no_external_signals).unwrap();
        let mut sim = net.build().unwrap();
        assert_eq!(sim.group("dst").unwrap().values("w0").unwrap().to_vec(), vec![0.0, 1.0]);
        sim.run(duration).unwrap();
        let rec = sim.finish();

        let spikes = rec.spikes(monitors[0]).unwrap();
        assert!(spikes.total() > 0);
        let v = rec.state(monitors[1]).unwrap();
        assert_eq!(v.indices, vec![1]);
        assert!(v.trace(1).unwrap().iter().any(|&x| x > 0.0));
    }

    #[test]
    fn test_external_signal_needs_factory() {
        let text = r#"{
            "signals": [{ "name": "song", "kind": "wav", "path": "song.wav", "gain": 50 }],
            "groups": [{ "name": "g", "n": 1, "equations": "dv/dt = (song(t) - v)/ms : 1" }]
        }"#;
        let spec = NetworkSpec::from_json(text).unwrap();
        assert!(spec.clone().into_network(no_external_signals).is_err());

        let mut asked = Vec::new();
        let (net, _) = spec
            .into_network(|s| {
                asked.push(s.name.clone());
                Ok(Box::new(FnSource::new(|_| 0.25)) as Box<dyn SignalSource>)
            })
            .unwrap();
        assert_eq!(asked, vec!["song".to_string()]);
        assert!(net.build().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MODEL.as_bytes()).unwrap();
        let spec = NetworkSpec::load(file.path()).unwrap();
        assert_eq!(spec.groups.len(), 2);
        let back = NetworkSpec::from_json(&spec.to_json().unwrap()).unwrap();
        assert_eq!(back, spec);
        assert!(NetworkSpec::load(Path::new("/nonexistent/model.json")).is_err());
    }
}
