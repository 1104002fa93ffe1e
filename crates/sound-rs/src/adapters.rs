//! Decorators and in-memory sources.

use spikesim_core::{SignalError, SignalSource, Time};

/// Multiplies every sample
#[derive(Debug, Clone)]
pub struct Gain<S> {
    inner: S,
    gain: f64,
}

impl<S: SignalSource> SignalSource for Gain<S> {
    fn sample(&mut self, t: Time) -> std::result::Result<f64, SignalError> {
        Ok(self.inner.sample(t)? * self.gain)
    }
}

/// Clamps every sample to `[lo, hi]`
#[derive(Debug, Clone)]
pub struct Clip<S> {
    inner: S,
    lo: f64,
    hi: f64,
}

impl<S: SignalSource> SignalSource for Clip<S> {
    fn sample(&mut self, t: Time) -> std::result::Result<f64, SignalError> {
        Ok(self.inner.sample(t)?.clamp(self.lo, self.hi))
    }
}

pub trait SignalSourceExt: SignalSource + Sized {
    fn gain(self, gain: f64) -> Gain<Self> {
        Gain { inner: self, gain }
    }

    /// `lo` must not exceed `hi`; the bounds are swapped otherwise
    fn clip(self, lo: f64, hi: f64) -> Clip<Self> {
        Clip { inner: self, lo: lo.min(hi), hi: hi.max(lo) }
    }
}

impl<S: SignalSource> SignalSourceExt for S {}

/// Sequential in-memory samples, one per call
#[derive(Debug, Clone, PartialEq)]
pub struct BufferSource {
    samples: Vec<f64>,
    pos: usize,
}

impl BufferSource {
    pub fn new(samples: Vec<f64>) -> Self {
        Self { samples, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.samples.len() - self.pos
    }
}

impl SignalSource for BufferSource {
    fn sample(&mut self, _t: Time) -> std::result::Result<f64, SignalError> {
        let value = *self
            .samples
            .get(self.pos)
            .ok_or(SignalError::Exhausted { samples: self.pos as u64 })?;
        self.pos += 1;
        Ok(value)
    }
}
