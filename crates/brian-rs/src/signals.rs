//! Per-step memoisation of external signals.

use crate::{Result, SimError};
use spikesim_core::{SignalError, SignalSource, Time};
use tracing::warn;

struct SignalEntry {
    name: String,
    source: Box<dyn SignalSource>,
    /// (step, value) of the last sample
    cached: Option<(u64, f64)>,
    last_time: Time,
    samples: u64,
}

/// Registered external functions, each sampled at most once per step.
///
/// The cache is keyed by step index: within one step every call returns the
/// same bits no matter how many plans reference the signal.
#[derive(Default)]
pub struct SignalBank {
    entries: Vec<SignalEntry>,
}

impl SignalBank {
    pub fn register(&mut self, name: &str, source: Box<dyn SignalSource>) -> Result<usize> {
        if self.index_of(name).is_some() {
            return Err(SimError::ConfigError(format!("signal '{}' registered twice", name)));
        }
        self.entries.push(SignalEntry {
            name: name.to_string(),
            source,
            cached: None,
            last_time: f64::NEG_INFINITY,
            samples: 0,
        });
        Ok(self.entries.len() - 1)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of samples actually drawn from a source
    pub fn samples_drawn(&self, id: usize) -> u64 {
        self.entries.get(id).map(|e| e.samples).unwrap_or(0)
    }

    /// Drop all cached values at the start of a step
    pub fn begin_step(&mut self) {
        for entry in &mut self.entries {
            entry.cached = None;
        }
    }

    pub fn sample(&mut self, id: usize, step: u64, t: Time) -> Result<f64> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SimError::SimulationError(format!("no signal with id {}", id)))?;

        if let Some((cached_step, value)) = entry.cached {
            if cached_step == step {
                return Ok(value);
            }
        }
        if t < entry.last_time {
            return Err(SimError::SignalFailed {
                name: entry.name.clone(),
                step,
                message: format!("time went backwards ({} after {})", t, entry.last_time),
            });
        }

        let value = match entry.source.sample(t) {
            Ok(v) => v,
            Err(SignalError::Exhausted { samples }) => {
                warn!(signal = %entry.name, step, samples, "signal exhausted");
                return Err(SimError::SignalExhausted { name: entry.name.clone(), step });
            }
            Err(SignalError::Read(message)) => {
                return Err(SimError::SignalFailed { name: entry.name.clone(), step, message });
            }
        };
        entry.cached = Some((step, value));
        entry.last_time = t;
        entry.samples += 1;
        Ok(value)
    }
}

impl std::fmt::Debug for SignalBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spikesim_core::FnSource;

    /// Counts calls; returns the call number
    struct Counter {
        calls: u64,
        limit: u64,
    }

    impl SignalSource for Counter {
        fn sample(&mut self, _t: Time) -> std::result::Result<f64, SignalError> {
            if self.calls == self.limit {
                return Err(SignalError::Exhausted { samples: self.calls });
            }
            self.calls += 1;
            Ok(self.calls as f64 * 0.1)
        }
    }

    #[test]
    fn test_memoised_within_step() {
        let mut bank = SignalBank::default();
        let id = bank.register("mic", Box::new(Counter { calls: 0, limit: 10 })).unwrap();

        let a = bank.sample(id, 1, 0.001).unwrap();
        let b = bank.sample(id, 1, 0.001).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
        assert_eq!(bank.samples_drawn(id), 1);

        bank.begin_step();
        let c = bank.sample(id, 2, 0.002).unwrap();
        assert_ne!(a, c);
        assert_eq!(bank.samples_drawn(id), 2);
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let mut bank = SignalBank::default();
        let id = bank.register("wav", Box::new(Counter { calls: 0, limit: 1 })).unwrap();
        bank.sample(id, 1, 0.0).unwrap();
        let err = bank.sample(id, 2, 0.1).unwrap_err();
        assert!(matches!(err, SimError::SignalExhausted { step: 2, .. }));
    }

    #[test]
    fn test_time_must_not_decrease() {
        let mut bank = SignalBank::default();
        let id = bank.register("f", Box::new(FnSource::new(|t| t))).unwrap();
        bank.sample(id, 5, 0.5).unwrap();
        assert!(bank.sample(id, 6, 0.4).is_err());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut bank = SignalBank::default();
        bank.register("f", Box::new(FnSource::new(|t| t))).unwrap();
        assert!(bank.register("f", Box::new(FnSource::new(|t| t))).is_err());
    }
}
