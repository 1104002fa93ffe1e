//! # spikesim-sound
//!
//! Audio signal sources for the tonotopy demo.
//!
//! | Source | Behaviour |
//! |--------|-----------|
//! | [`WavSource`] | sequential 16-bit PCM reader, first channel, explicit end of data |
//! | [`ToneSource`] | synthetic note sequence, a function of time |
//! | [`BufferSource`] | in-memory samples, sequential |
//!
//! Post-processing is done with decorators ([`Gain`], [`Clip`]) so the engine's
//! per-step cache always wraps the fully processed value.

pub mod adapters;
pub mod tone;
pub mod wav;

use thiserror::Error;

pub use adapters::{BufferSource, Clip, Gain, SignalSourceExt};
pub use tone::{Note, ToneSource};
pub use wav::{write_pcm16, WavSource, WavSpec};

#[derive(Debug, Error)]
pub enum SoundError {
    #[error("Invalid WAV data: {0}")]
    InvalidFormat(String),

    #[error("Unsupported WAV format: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SoundError>;
