//! Model equations.

use crate::expr::{parse_equation_lines, EquationLine};
use crate::{Result, SimError};
use serde::{Deserialize, Serialize};
use spikesim_core::{Dimension, Quantity};

/// Differential equation: dv/dt = expr
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifferentialEquation {
    pub variable: String,
    pub expression: String,
    pub dimension: Dimension,
    /// Frozen while the neuron is refractory
    pub unless_refractory: bool,
}

/// Subexpression: v = expr
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgebraicEquation {
    pub variable: String,
    pub expression: String,
    pub dimension: Dimension,
    /// Evaluated once at the start of each step and stored
    pub constant_over_dt: bool,
}

/// Per-neuron parameter: name : unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub dimension: Dimension,
    /// Read-only after initialisation
    pub constant: bool,
}

/// Threshold condition for spike generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdCondition {
    pub condition: String, // e.g. "x > th"
}

/// Reset statements run in order after a spike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetEquations {
    pub statements: String, // e.g. "x = 0; th = th*2.5 + 0.01"
}

/// Refractory period, by duration or by condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefractorySpec {
    Duration(Quantity), // Fixed duration
    Condition(String),  // While condition holds
}

/// Integration methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationMethod {
    /// Euler–Maruyama, noise allowed
    #[default]
    Euler,
    /// Closed-form update for systems affine in the differential variables
    Exact,
}

/// Complete neuron equations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeuronEquations {
    pub differential: Vec<DifferentialEquation>,
    pub algebraic: Vec<AlgebraicEquation>,
    pub parameters: Vec<Parameter>,
    pub threshold: Option<ThresholdCondition>,
    pub reset: Option<ResetEquations>,
    pub refractory: Option<RefractorySpec>,
}

impl NeuronEquations {
    /// State variables in slot order: differential variables, then parameters, then
    /// stored subexpressions
    pub fn variable_names(&self) -> Vec<&str> {
        self.differential
            .iter()
            .map(|d| d.variable.as_str())
            .chain(self.parameters.iter().map(|p| p.name.as_str()))
            .chain(
                self.algebraic
                    .iter()
                    .filter(|a| a.constant_over_dt)
                    .map(|a| a.variable.as_str()),
            )
            .collect()
    }

    pub fn is_state_variable(&self, name: &str) -> bool {
        self.variable_names().contains(&name)
    }

    fn check_unique(&self) -> Result<()> {
        let mut seen: Vec<&str> = Vec::new();
        let names = self
            .differential
            .iter()
            .map(|d| d.variable.as_str())
            .chain(self.parameters.iter().map(|p| p.name.as_str()))
            .chain(self.algebraic.iter().map(|a| a.variable.as_str()));
        for name in names {
            if seen.contains(&name) {
                return Err(SimError::EquationError(format!("'{}' is defined twice", name)));
            }
            if is_reserved(name) {
                return Err(SimError::EquationError(format!("'{}' is a reserved name", name)));
            }
            seen.push(name);
        }
        Ok(())
    }
}

/// Names with a fixed meaning in every expression
pub fn is_reserved(name: &str) -> bool {
    matches!(name, "t" | "dt" | "i" | "N" | "inf" | "pi" | "and" | "or" | "not")
        || crate::plan::is_noise_name(name)
        || crate::plan::builtin_constant(name).is_some()
}

// ============================================================================
// BRIAN SCRIPT PARSER
// ============================================================================

/// Parse Brian-style equations.
///
/// ```text
/// dx/dt = (sound - x)/tau_ear : 1 (unless refractory)
/// sound = clip(get_sample(t), 0, inf) : 1 (constant over dt)
/// freq : Hz (constant)
/// ```
pub fn parse_equations(text: &str) -> Result<NeuronEquations> {
    let mut eqs = NeuronEquations::default();

    for line in parse_equation_lines(text)? {
        match line {
            EquationLine::Differential { variable, expression, dimension, flags } => {
                if flags.constant || flags.constant_over_dt {
                    return Err(SimError::EquationError(format!(
                        "d{}/dt: only 'unless refractory' applies to differential equations",
                        variable
                    )));
                }
                eqs.differential.push(DifferentialEquation {
                    variable,
                    expression,
                    dimension,
                    unless_refractory: flags.unless_refractory,
                });
            }
            EquationLine::Subexpression { variable, expression, dimension, flags } => {
                if flags.constant || flags.unless_refractory {
                    return Err(SimError::EquationError(format!(
                        "{}: only 'constant over dt' applies to subexpressions",
                        variable
                    )));
                }
                eqs.algebraic.push(AlgebraicEquation {
                    variable,
                    expression,
                    dimension,
                    constant_over_dt: flags.constant_over_dt,
                });
            }
            EquationLine::Parameter { name, dimension, flags } => {
                if flags.constant_over_dt || flags.unless_refractory {
                    return Err(SimError::EquationError(format!(
                        "{}: only 'constant' applies to parameters",
                        name
                    )));
                }
                eqs.parameters.push(Parameter { name, dimension, constant: flags.constant });
            }
        }
    }

    eqs.check_unique()?;
    Ok(eqs)
}
