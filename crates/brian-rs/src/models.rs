//! Ready-made networks.
//!
//! ## Tonotopy
//!
//! A receptor neuron follows a rectified audio waveform with an adaptive threshold.
//! Each of its spikes reaches every coincidence detector twice: once immediately and
//! once after `1/freq` of that detector. A detector fires when both copies overlap,
//! i.e. when the receptor fires periodically at the detector's preferred frequency.

use crate::equations::{parse_equations, IntegrationMethod, RefractorySpec};
use crate::group::NeuronGroup;
use crate::monitors::{MonitorId, Recordable, Selector};
use crate::network::{Network, SimulationConfig};
use crate::synapses::Synapses;
use crate::{Result, SimError};
use serde::{Deserialize, Serialize};
use spikesim_core::{Dimension, Quantity, SiQuantity, SignalSource, Unit};
use tracing::debug;

pub const RECEPTOR_EQUATIONS: &str = r#"
dx/dt = (sound - x)/tau_ear : 1 (unless refractory)
dth/dt = (0.1*x - th)/tau_th : 1
sound = clip(get_sample(t), 0, inf) : 1 (constant over dt)
"#;

pub const DETECTOR_EQUATIONS: &str = r#"
dv/dt = -v/tau + sigma*(2./tau)**.5*xi : 1
freq : Hz (constant)
"#;

/// Log-spaced preferred frequencies between `min_freq` and `max_freq`
pub const FREQUENCY_LADDER: &str = "exp(log(min_freq/Hz) + (i*1.0/(N-1))*log(max_freq/min_freq))*Hz";

/// Name under which the audio source is registered
pub const SIGNAL_NAME: &str = "get_sample";

/// Tonotopy parameters, SI units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TonotopyParams {
    /// Audio sample rate (Hz); dt = 1 / sample_rate
    pub sample_rate: f64,
    /// Simulated time (s)
    pub runtime: f64,
    /// Receptor time constant (s)
    pub tau_ear: f64,
    /// Adaptive threshold time constant (s)
    pub tau_th: f64,
    pub min_freq: f64,
    pub max_freq: f64,
    /// Number of coincidence detectors
    pub neurons: usize,
    /// Detector membrane time constant (s)
    pub tau: f64,
    /// Detector noise amplitude
    pub sigma: f64,
    /// Receptor refractory period (s)
    pub refractory: f64,
    pub seed: u64,
}

impl Default for TonotopyParams {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            runtime: 4.5,
            tau_ear: 1e-3,
            tau_th: 5e-3,
            min_freq: 50.0,
            max_freq: 1000.0,
            neurons: 300,
            tau: 1e-3,
            sigma: 0.1,
            refractory: 2e-3,
            seed: SimulationConfig::default().seed,
        }
    }
}

impl TonotopyParams {
    pub fn dt(&self) -> f64 {
        1.0 / self.sample_rate
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(text)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sample_rate", self.sample_rate),
            ("tau_ear", self.tau_ear),
            ("tau_th", self.tau_th),
            ("min_freq", self.min_freq),
            ("max_freq", self.max_freq),
            ("tau", self.tau),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(SimError::ConfigError(format!("{} must be positive, got {}", name, value)));
            }
        }
        if self.neurons < 2 {
            return Err(SimError::ConfigError(format!(
                "at least 2 detectors are needed to span a frequency range, got {}",
                self.neurons
            )));
        }
        if self.min_freq >= self.max_freq {
            return Err(SimError::ConfigError(format!(
                "min_freq ({}) must be below max_freq ({})",
                self.min_freq, self.max_freq
            )));
        }
        if !self.runtime.is_finite() || self.runtime < 0.0 {
            return Err(SimError::ConfigError(format!("runtime must be non-negative, got {}", self.runtime)));
        }
        if !self.sigma.is_finite() || self.sigma < 0.0 || !self.refractory.is_finite() || self.refractory < 0.0 {
            return Err(SimError::ConfigError("sigma and refractory must be non-negative".into()));
        }
        Ok(())
    }

    /// Preferred frequency of every detector (Hz)
    pub fn preferred_frequencies(&self) -> Vec<f64> {
        let last = (self.neurons.max(2) - 1) as f64;
        let ratio = (self.max_freq / self.min_freq).ln();
        (0..self.neurons)
            .map(|i| (self.min_freq.ln() + (i as f64 / last) * ratio).exp())
            .collect()
    }
}

/// Assembled network and the handles of its monitors
pub struct TonotopyNetwork {
    pub network: Network,
    /// Rectified input as seen by the receptor
    pub sound: MonitorId,
    /// Detector spikes
    pub spikes: MonitorId,
}

/// Build the receptor → detector network fed by `source`
pub fn tonotopy_network<S: SignalSource + 'static>(params: &TonotopyParams, source: S) -> Result<TonotopyNetwork> {
    params.validate()?;
    let mut net = Network::new(SimulationConfig { dt: params.dt(), seed: params.seed });

    net.constant("tau_ear", SiQuantity::new(params.tau_ear, Dimension::TIME))?;
    net.constant("tau_th", SiQuantity::new(params.tau_th, Dimension::TIME))?;
    net.constant("min_freq", SiQuantity::new(params.min_freq, Dimension::FREQUENCY))?;
    net.constant("max_freq", SiQuantity::new(params.max_freq, Dimension::FREQUENCY))?;
    net.constant("tau", SiQuantity::new(params.tau, Dimension::TIME))?;
    net.constant("sigma", SiQuantity::dimensionless(params.sigma))?;
    net.add_signal(SIGNAL_NAME, source)?;

    let mut receptor = NeuronGroup::new("receptor", 1, parse_equations(RECEPTOR_EQUATIONS)?)
        .with_threshold("x>th")
        .with_reset("x=0; th = th*2.5 + 0.01")
        .with_refractory(RefractorySpec::Duration(Quantity::new(params.refractory * 1e3, Unit::Millisecond)))
        .with_method(IntegrationMethod::Exact);
    receptor.set_expression("th", "1")?;
    net.add_neuron_group(receptor)?;

    let mut detectors = NeuronGroup::new("detectors", params.neurons, parse_equations(DETECTOR_EQUATIONS)?)
        .with_threshold("v>1")
        .with_reset("v=0")
        .with_method(IntegrationMethod::Euler);
    detectors.set_expression("freq", FREQUENCY_LADDER)?;
    net.add_neuron_group(detectors)?;

    let mut synapses = Synapses::new("receptor_detectors", "receptor", "detectors", "v += 0.5");
    synapses.connect_all_to_all(2);
    synapses.set_delay_where("k == 1", "1/freq_post");
    net.add_synapses(synapses)?;

    let sound = net.record("receptor", Recordable::Variable("sound".into()), Selector::Indices(vec![0]));
    let spikes = net.record("detectors", Recordable::Spikes, Selector::All);

    debug!(
        neurons = params.neurons,
        dt = params.dt(),
        min_freq = params.min_freq,
        max_freq = params.max_freq,
        "assembled tonotopy network"
    );
    Ok(TonotopyNetwork { network: net, sound, spikes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikesim_core::FnSource;
    use std::f64::consts::PI;

    fn small() -> TonotopyParams {
        TonotopyParams { neurons: 40, runtime: 0.02, ..Default::default() }
    }

    #[test]
    fn test_default_params() {
        let p = TonotopyParams::default();
        assert_eq!(p.neurons, 300);
        assert!((p.dt() - 1.0 / 44100.0).abs() < 1e-15);
        assert!(p.validate().is_ok());

        let freqs = p.preferred_frequencies();
        assert!((freqs[0] - 50.0).abs() < 1e-9);
        assert!((freqs[299] - 1000.0).abs() < 1e-9);
        assert!(freqs.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_params_from_json() {
        let p = TonotopyParams::from_json(r#"{"neurons": 10, "sigma": 0.0}"#).unwrap();
        assert_eq!(p.neurons, 10);
        assert_eq!(p.sigma, 0.0);
        assert_eq!(p.tau_th, 5e-3);
        assert!(TonotopyParams::from_json(r#"{"neurons": 1}"#).is_err());
        assert!(TonotopyParams::from_json(r#"{"min_freq": 2000}"#).is_err());
    }

    #[test]
    fn test_network_layout() {
        let p = small();
        let tono = tonotopy_network(&p, FnSource::new(|_| 0.0)).unwrap();
        let sim = tono.network.build().unwrap();

        let freq = sim.group("detectors").unwrap().values("freq").unwrap();
        for (got, want) in freq.iter().zip(p.preferred_frequencies()) {
            assert!((got - want).abs() < 1e-9 * want);
        }
        assert_eq!(sim.group("receptor").unwrap().values("th").unwrap()[0], 1.0);

        let syn = sim.synapses("receptor_detectors").unwrap();
        assert_eq!(syn.len(), 2 * p.neurons);
        let delays = syn.values("delay").unwrap();
        let k = syn.values("k").unwrap();
        for (s, (&d, &k)) in delays.iter().zip(k).enumerate() {
            let neuron = s / 2;
            if k == 0.0 {
                assert_eq!(d, 0.0);
            } else {
                assert!((d - 1.0 / freq[neuron]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_short_run_with_tone() {
        let p = small();
        let tone = FnSource::new(|t| (2.0 * PI * 440.0 * t).sin());
        let tono = tonotopy_network(&p, tone).unwrap();
        let (sound, spikes) = (tono.sound, tono.spikes);
        let mut sim = tono.network.build().unwrap();
        sim.run(p.runtime).unwrap();
        let rec = sim.finish();

        assert_eq!(rec.len(), 882);
        let trace = rec.state(sound).unwrap().trace(0).unwrap();
        assert!(trace.iter().all(|&s| (0.0..=1.0).contains(&s)));
        assert!(trace.iter().any(|&s| s > 0.5));
        let record = rec.spikes(spikes).unwrap();
        assert_eq!(record.counts.len(), p.neurons);
        assert!(record.spikes.iter().all(|&(i, _)| i < p.neurons));
    }

    #[test]
    fn test_receptor_follows_sound() {
        let p = TonotopyParams { sigma: 0.0, neurons: 2, ..small() };
        let tono = tonotopy_network(&p, FnSource::new(|_| 0.5)).unwrap();
        let mut sim = tono.network.build().unwrap();
        sim.run(0.002).unwrap();
        // x relaxes towards 0.5 with tau_ear, well before it meets the decaying threshold
        let receptor = sim.group("receptor").unwrap();
        let x = receptor.values("x").unwrap()[0];
        let t = sim.time();
        assert_eq!(sim.step_count(), 88);
        assert!((x - 0.5 * (1.0 - (-t / 1e-3).exp())).abs() < 1e-9, "x = {}", x);
        assert!(receptor.values("th").unwrap()[0] > x);
    }
}
