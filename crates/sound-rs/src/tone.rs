//! Synthetic tone sequences.

use spikesim_core::{SignalError, SignalSource, Time};

/// One note of a sequence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Note {
    /// Hz, 0 for a rest
    pub frequency: f64,
    /// s
    pub duration: f64,
}

/// Equal-tempered frequency, `semitones` above or below A4 = 440 Hz
pub fn equal_tempered(semitones: i32) -> f64 {
    440.0 * 2f64.powf(semitones as f64 / 12.0)
}

/// Sequence of sine notes after a silent lead-in. Exhausted past its end.
#[derive(Debug, Clone, PartialEq)]
pub struct ToneSource {
    notes: Vec<Note>,
    lead_in: f64,
    amplitude: f64,
    /// Linear fade at both ends of every note (s)
    ramp: f64,
    samples: u64,
}

impl ToneSource {
    pub fn new(notes: Vec<Note>) -> Self {
        Self { notes, lead_in: 0.0, amplitude: 1.0, ramp: 0.005, samples: 0 }
    }

    pub fn with_lead_in(mut self, lead_in: f64) -> Self {
        self.lead_in = lead_in.max(0.0);
        self
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn with_ramp(mut self, ramp: f64) -> Self {
        self.ramp = ramp.max(0.0);
        self
    }

    /// C4 up to C5, half a second per note after half a second of silence (4.5 s total)
    pub fn c_major_scale() -> Self {
        let notes = [-9, -7, -5, -4, -2, 0, 2, 3]
            .iter()
            .map(|&semitones| Note { frequency: equal_tempered(semitones), duration: 0.5 })
            .collect();
        Self::new(notes).with_lead_in(0.5).with_amplitude(0.8)
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    /// Total length including the lead-in (s)
    pub fn duration(&self) -> f64 {
        self.lead_in + self.notes.iter().map(|n| n.duration).sum::<f64>()
    }

    /// Noise-free value at time `t`, or `None` past the end
    pub fn value_at(&self, t: Time) -> Option<f64> {
        // half a microsecond of slack for accumulated step times
        if t < 0.0 || t > self.duration() + 5e-7 {
            return None;
        }
        let mut start = self.lead_in;
        if t < start {
            return Some(0.0);
        }
        for note in &self.notes {
            let end = start + note.duration;
            if t < end || note == self.notes.last()? {
                let local = (t - start).max(0.0);
                let envelope = if self.ramp > 0.0 {
                    (local / self.ramp).min((end - t).max(0.0) / self.ramp).min(1.0)
                } else {
                    1.0
                };
                let phase = 2.0 * std::f64::consts::PI * note.frequency * local;
                return Some(self.amplitude * envelope * phase.sin());
            }
            start = end;
        }
        Some(0.0)
    }
}

impl SignalSource for ToneSource {
    fn sample(&mut self, t: Time) -> std::result::Result<f64, SignalError> {
        let value = self.value_at(t).ok_or(SignalError::Exhausted { samples: self.samples })?;
        self.samples += 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_temperament() {
        assert_eq!(equal_tempered(0), 440.0);
        assert!((equal_tempered(-9) - 261.6256).abs() < 1e-3);
        assert!((equal_tempered(12) - 880.0).abs() < 1e-9);
    }

    #[test]
    fn test_scale_layout() {
        let scale = ToneSource::c_major_scale();
        assert_eq!(scale.notes().len(), 8);
        assert!((scale.duration() - 4.5).abs() < 1e-12);
        assert!((scale.notes()[7].frequency - 523.2511).abs() < 1e-3);

        // silent lead-in, sound afterwards, exhausted past the end
        assert_eq!(scale.value_at(0.25), Some(0.0));
        let playing: f64 = (0..100).map(|n| scale.value_at(0.7 + n as f64 * 1e-4).unwrap().abs()).sum();
        assert!(playing > 10.0);
        assert!(scale.value_at(4.5).is_some());
        assert!(scale.value_at(4.6).is_none());
    }

    #[test]
    fn test_amplitude_bound() {
        let scale = ToneSource::c_major_scale();
        let dt = 1.0 / 44100.0;
        let mut src = scale.clone();
        for n in 0..44100 {
            let v = src.sample(n as f64 * dt * 4.0).unwrap();
            assert!(v.abs() <= 0.8 + 1e-12);
        }
    }

    #[test]
    fn test_exhaustion() {
        let mut src = ToneSource::new(vec![Note { frequency: 100.0, duration: 0.01 }]);
        assert!(src.sample(0.005).is_ok());
        assert_eq!(src.sample(0.02), Err(SignalError::Exhausted { samples: 1 }));
    }
}
