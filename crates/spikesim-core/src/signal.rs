//! External signal sources.
//!
//! A source produces one scalar per call. The engine wraps every registered source
//! in a per-step cache, so a source may be stateful (sequential buffer reads) and
//! still be referenced any number of times within one step.

use crate::Time;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SignalError {
    #[error("signal exhausted after {samples} samples")]
    Exhausted { samples: u64 },
    #[error("signal read failed: {0}")]
    Read(String),
}

/// Time-indexed scalar source.
///
/// `t` is the simulation time of the step requesting the sample. Sequential sources
/// are free to ignore it.
pub trait SignalSource {
    fn sample(&mut self, t: Time) -> std::result::Result<f64, SignalError>;
}

impl<S: SignalSource + ?Sized> SignalSource for Box<S> {
    fn sample(&mut self, t: Time) -> std::result::Result<f64, SignalError> {
        (**self).sample(t)
    }
}

/// Source backed by a pure function of time. Never exhausts.
pub struct FnSource<F> {
    f: F,
}

impl<F: FnMut(Time) -> f64> FnSource<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F: FnMut(Time) -> f64> SignalSource for FnSource<F> {
    fn sample(&mut self, t: Time) -> std::result::Result<f64, SignalError> {
        Ok((self.f)(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_source() {
        let mut src = FnSource::new(|t| 2.0 * t);
        assert_eq!(src.sample(1.5).unwrap(), 3.0);
    }

    #[test]
    fn test_boxed_source() {
        let mut src: Box<dyn SignalSource> = Box::new(FnSource::new(|_| 7.0));
        assert_eq!(src.sample(0.0).unwrap(), 7.0);
    }
}
