//! Units and dimensions.
//!
//! Every quantity the engine touches is reduced to an SI value plus a [`Dimension`]
//! over three base axes (time, voltage, current). That is enough to express all
//! the units of the Brian-style models used here: conductance is current/voltage,
//! capacitance is current*time/voltage, resistance is voltage/current.
//!
//! Exponents are stored in half-units so that `sqrt(2/tau)` (dimension s^-1/2, the
//! dimension of white noise `xi`) stays exact.

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Div, Mul};

/// Physical dimension as half-integer exponents of (second, volt, ampere)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension {
    time: i16,
    voltage: i16,
    current: i16,
}

impl Dimension {
    pub const DIMENSIONLESS: Dimension = Dimension { time: 0, voltage: 0, current: 0 };
    pub const TIME: Dimension = Dimension { time: 2, voltage: 0, current: 0 };
    pub const FREQUENCY: Dimension = Dimension { time: -2, voltage: 0, current: 0 };
    pub const VOLTAGE: Dimension = Dimension { time: 0, voltage: 2, current: 0 };
    pub const CURRENT: Dimension = Dimension { time: 0, voltage: 0, current: 2 };
    pub const CONDUCTANCE: Dimension = Dimension { time: 0, voltage: -2, current: 2 };
    pub const CAPACITANCE: Dimension = Dimension { time: 2, voltage: -2, current: 2 };
    pub const RESISTANCE: Dimension = Dimension { time: 0, voltage: 2, current: -2 };
    /// Dimension of a white-noise symbol (s^-1/2)
    pub const NOISE: Dimension = Dimension { time: -1, voltage: 0, current: 0 };

    pub fn is_dimensionless(&self) -> bool {
        *self == Self::DIMENSIONLESS
    }

    /// Raise to a real power. Fails when the result is not a half-integer dimension.
    pub fn powf(self, exponent: f64) -> Option<Dimension> {
        if self.is_dimensionless() {
            return Some(self);
        }
        let scale = |e: i16| -> Option<i16> {
            let scaled = e as f64 * exponent;
            let rounded = scaled.round();
            if (scaled - rounded).abs() < 1e-9 && rounded.abs() <= i16::MAX as f64 {
                Some(rounded as i16)
            } else {
                None
            }
        };
        Some(Dimension {
            time: scale(self.time)?,
            voltage: scale(self.voltage)?,
            current: scale(self.current)?,
        })
    }

    pub fn sqrt(self) -> Option<Dimension> {
        self.powf(0.5)
    }
}

impl Mul for Dimension {
    type Output = Dimension;

    fn mul(self, rhs: Dimension) -> Dimension {
        Dimension {
            time: self.time + rhs.time,
            voltage: self.voltage + rhs.voltage,
            current: self.current + rhs.current,
        }
    }
}

impl Div for Dimension {
    type Output = Dimension;

    fn div(self, rhs: Dimension) -> Dimension {
        Dimension {
            time: self.time - rhs.time,
            voltage: self.voltage - rhs.voltage,
            current: self.current - rhs.current,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dimensionless() {
            return write!(f, "1");
        }
        let mut parts = Vec::new();
        for (symbol, half) in [("s", self.time), ("V", self.voltage), ("A", self.current)] {
            match half {
                0 => {}
                2 => parts.push(symbol.to_string()),
                h if h % 2 == 0 => parts.push(format!("{}^{}", symbol, h / 2)),
                h => parts.push(format!("{}^{}", symbol, h as f64 / 2.0)),
            }
        }
        write!(f, "{}", parts.join(" "))
    }
}

// ============================================================================
// UNITS
// ============================================================================

/// Physical units with SI prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    // Time
    Second,
    Millisecond,  // ms
    Microsecond,  // us

    // Voltage
    Volt,
    Millivolt,    // mV

    // Current
    Ampere,
    Nanoampere,   // nA
    Picoampere,   // pA

    // Conductance
    Siemens,
    Nanosiemens,  // nS
    Microsiemens, // uS

    // Capacitance
    Farad,
    Picofarad,    // pF

    // Resistance
    Ohm,
    Megaohm,      // Mohm
    Gigaohm,      // Gohm

    // Frequency
    Hertz,
    Kilohertz,    // kHz

    // Dimensionless
    Dimensionless,
}

impl Unit {
    pub const ALL: [Unit; 19] = [
        Unit::Second,
        Unit::Millisecond,
        Unit::Microsecond,
        Unit::Volt,
        Unit::Millivolt,
        Unit::Ampere,
        Unit::Nanoampere,
        Unit::Picoampere,
        Unit::Siemens,
        Unit::Nanosiemens,
        Unit::Microsiemens,
        Unit::Farad,
        Unit::Picofarad,
        Unit::Ohm,
        Unit::Megaohm,
        Unit::Gigaohm,
        Unit::Hertz,
        Unit::Kilohertz,
        Unit::Dimensionless,
    ];

    /// Convert to SI base units
    pub fn to_si_factor(&self) -> f64 {
        match self {
            Unit::Second => 1.0,
            Unit::Millisecond => 1e-3,
            Unit::Microsecond => 1e-6,
            Unit::Volt => 1.0,
            Unit::Millivolt => 1e-3,
            Unit::Ampere => 1.0,
            Unit::Nanoampere => 1e-9,
            Unit::Picoampere => 1e-12,
            Unit::Siemens => 1.0,
            Unit::Nanosiemens => 1e-9,
            Unit::Microsiemens => 1e-6,
            Unit::Farad => 1.0,
            Unit::Picofarad => 1e-12,
            Unit::Ohm => 1.0,
            Unit::Megaohm => 1e6,
            Unit::Gigaohm => 1e9,
            Unit::Hertz => 1.0,
            Unit::Kilohertz => 1e3,
            Unit::Dimensionless => 1.0,
        }
    }

    pub fn dimension(&self) -> Dimension {
        match self {
            Unit::Second | Unit::Millisecond | Unit::Microsecond => Dimension::TIME,
            Unit::Volt | Unit::Millivolt => Dimension::VOLTAGE,
            Unit::Ampere | Unit::Nanoampere | Unit::Picoampere => Dimension::CURRENT,
            Unit::Siemens | Unit::Nanosiemens | Unit::Microsiemens => Dimension::CONDUCTANCE,
            Unit::Farad | Unit::Picofarad => Dimension::CAPACITANCE,
            Unit::Ohm | Unit::Megaohm | Unit::Gigaohm => Dimension::RESISTANCE,
            Unit::Hertz | Unit::Kilohertz => Dimension::FREQUENCY,
            Unit::Dimensionless => Dimension::DIMENSIONLESS,
        }
    }

    /// Name used in equations, e.g. `ms` or `Hz`
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Second => "second",
            Unit::Millisecond => "ms",
            Unit::Microsecond => "us",
            Unit::Volt => "volt",
            Unit::Millivolt => "mV",
            Unit::Ampere => "amp",
            Unit::Nanoampere => "nA",
            Unit::Picoampere => "pA",
            Unit::Siemens => "siemens",
            Unit::Nanosiemens => "nS",
            Unit::Microsiemens => "uS",
            Unit::Farad => "farad",
            Unit::Picofarad => "pF",
            Unit::Ohm => "ohm",
            Unit::Megaohm => "Mohm",
            Unit::Gigaohm => "Gohm",
            Unit::Hertz => "Hz",
            Unit::Kilohertz => "kHz",
            Unit::Dimensionless => "1",
        }
    }

    /// Look up a unit by its equation name or a common alias
    pub fn from_symbol(symbol: &str) -> Option<Unit> {
        let unit = match symbol {
            "second" | "s" => Unit::Second,
            "ms" | "msecond" => Unit::Millisecond,
            "us" | "usecond" => Unit::Microsecond,
            "volt" | "V" => Unit::Volt,
            "mV" | "mvolt" => Unit::Millivolt,
            "amp" | "ampere" | "A" => Unit::Ampere,
            "nA" | "namp" => Unit::Nanoampere,
            "pA" | "pamp" => Unit::Picoampere,
            "siemens" | "S" => Unit::Siemens,
            "nS" | "nsiemens" => Unit::Nanosiemens,
            "uS" | "usiemens" => Unit::Microsiemens,
            "farad" | "F" => Unit::Farad,
            "pF" | "pfarad" => Unit::Picofarad,
            "ohm" => Unit::Ohm,
            "Mohm" => Unit::Megaohm,
            "Gohm" => Unit::Gigaohm,
            "Hz" | "hertz" => Unit::Hertz,
            "kHz" | "khertz" => Unit::Kilohertz,
            "1" => Unit::Dimensionless,
            _ => return None,
        };
        Some(unit)
    }

    pub fn parse(symbol: &str) -> Result<Unit> {
        Unit::from_symbol(symbol)
            .ok_or_else(|| CoreError::UnitError(format!("unknown unit '{}'", symbol)))
    }
}

/// Quantity with value and unit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn dimensionless(value: f64) -> Self {
        Self::new(value, Unit::Dimensionless)
    }

    /// Convert to SI base units
    pub fn to_si(&self) -> f64 {
        self.value * self.unit.to_si_factor()
    }
}

/// A value already reduced to SI, tagged with its dimension
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiQuantity {
    pub value: f64,
    pub dimension: Dimension,
}

impl SiQuantity {
    pub fn new(value: f64, dimension: Dimension) -> Self {
        Self { value, dimension }
    }

    pub fn dimensionless(value: f64) -> Self {
        Self::new(value, Dimension::DIMENSIONLESS)
    }

    /// Value in seconds, if this is a time
    pub fn as_time(&self) -> Result<f64> {
        if self.dimension != Dimension::TIME {
            return Err(CoreError::UnitError(format!(
                "expected a time, got dimension {}",
                self.dimension
            )));
        }
        Ok(self.value)
    }
}

impl From<Quantity> for SiQuantity {
    fn from(q: Quantity) -> Self {
        SiQuantity::new(q.to_si(), q.unit.dimension())
    }
}

impl fmt::Display for SiQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dimension.is_dimensionless() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.dimension)
        }
    }
}
