//! Neuron groups: configuration, compilation and the per-step update.
//!
//! A [`NeuronGroup`] is plain configuration. [`Network::build`](crate::Network::build)
//! compiles it into a [`GroupState`], which owns one `Array1<f64>` per state variable
//! and the evaluation plans for integration, threshold, reset and refractoriness.

use crate::equations::{IntegrationMethod, NeuronEquations, RefractorySpec, ResetEquations, ThresholdCondition};
use crate::expr::{parse_expression, parse_statements, AssignOp, Expr};
use crate::plan::{
    builtin_constant, compile_condition, compile_number, degree, is_noise_name, CompileOptions, EvalContext,
    Frame, Override, Plan, Resolver, Slot, Symbol,
};
use crate::signals::SignalBank;
use crate::{Namespace, Result, SimError, SpikeEvent};
use nalgebra::{DMatrix, DVector};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use spikesim_core::{Dimension, SiQuantity};
use tracing::debug;

/// Initial value of one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialValue {
    Values(Vec<f64>),
    /// Expression over `i`, `N`, constants and already-initialised variables
    Expression(String),
}

/// A group of neurons sharing the same equations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuronGroup {
    pub name: String,
    pub n: usize,
    pub equations: NeuronEquations,
    pub method: IntegrationMethod,
    /// Applied in order at build time
    pub initial: Vec<(String, InitialValue)>,
}

impl NeuronGroup {
    pub fn new(name: &str, n: usize, equations: NeuronEquations) -> Self {
        Self {
            name: name.to_string(),
            n,
            equations,
            method: IntegrationMethod::Euler,
            initial: Vec::new(),
        }
    }

    pub fn with_threshold(mut self, condition: &str) -> Self {
        self.equations.threshold = Some(ThresholdCondition { condition: condition.to_string() });
        self
    }

    pub fn with_reset(mut self, statements: &str) -> Self {
        self.equations.reset = Some(ResetEquations { statements: statements.to_string() });
        self
    }

    pub fn with_refractory(mut self, refractory: RefractorySpec) -> Self {
        self.equations.refractory = Some(refractory);
        self
    }

    pub fn with_method(mut self, method: IntegrationMethod) -> Self {
        self.method = method;
        self
    }

    fn check_settable(&self, variable: &str) -> Result<()> {
        let settable = self.equations.differential.iter().any(|d| d.variable == variable)
            || self.equations.parameters.iter().any(|p| p.name == variable);
        if !settable {
            return Err(SimError::ConfigError(format!(
                "Unknown variable: {} (group '{}')",
                variable, self.name
            )));
        }
        Ok(())
    }

    pub fn set_initial(&mut self, variable: &str, values: Array1<f64>) -> Result<()> {
        self.check_settable(variable)?;
        if values.len() != self.n {
            return Err(SimError::ConfigError(format!(
                "Expected {} values, got {}",
                self.n,
                values.len()
            )));
        }
        self.initial.push((variable.to_string(), InitialValue::Values(values.to_vec())));
        Ok(())
    }

    /// Initialise a variable from an expression, e.g. `th = 1` or a per-neuron
    /// frequency ladder over `i`
    pub fn set_expression(&mut self, variable: &str, expression: &str) -> Result<()> {
        self.check_settable(variable)?;
        parse_expression(expression)?;
        self.initial
            .push((variable.to_string(), InitialValue::Expression(expression.to_string())));
        Ok(())
    }
}

// ============================================================================
// NAMING SCOPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarKind {
    Differential,
    Parameter { constant: bool },
    /// `constant over dt` subexpression, by evaluation order
    Stored(usize),
}

#[derive(Debug, Clone)]
pub(crate) struct VariableInfo {
    pub name: String,
    pub dimension: Dimension,
    pub kind: VarKind,
}

impl VariableInfo {
    pub fn writable(&self) -> bool {
        matches!(self.kind, VarKind::Differential | VarKind::Parameter { constant: false })
    }
}

struct ParsedSubexpression {
    name: String,
    expr: Expr,
    dimension: Dimension,
    stored: Option<usize>,
}

/// Everything a group-level expression may reference
struct GroupScope<'a> {
    name: &'a str,
    variables: &'a [VariableInfo],
    subexpressions: &'a [ParsedSubexpression],
    noise: &'a [String],
    namespace: &'a Namespace,
    signals: &'a SignalBank,
    /// Stored subexpressions with a lower order are already computed this step
    stored_visible: usize,
}

impl Resolver for GroupScope<'_> {
    fn resolve(&self, name: &str) -> Option<Symbol> {
        if let Some(sub) = self.subexpressions.iter().find(|s| s.name == name) {
            match sub.stored {
                Some(order) if order < self.stored_visible => {}
                _ => {
                    return Some(Symbol::Inline { expr: sub.expr.clone(), dimension: sub.dimension });
                }
            }
        }
        if let Some(idx) = self.variables.iter().position(|v| v.name == name) {
            return Some(Symbol::Variable { slot: Slot::Own(idx), dimension: self.variables[idx].dimension });
        }
        match name {
            "t" => return Some(Symbol::Time),
            "dt" => return Some(Symbol::Dt),
            "i" => return Some(Symbol::Index),
            "N" => return Some(Symbol::Count),
            _ => {}
        }
        if let Some(id) = self.noise.iter().position(|n| n == name) {
            return Some(Symbol::Noise(id));
        }
        self.namespace
            .get(name)
            .copied()
            .or_else(|| builtin_constant(name))
            .map(Symbol::Constant)
    }

    fn signal(&self, name: &str) -> Option<usize> {
        self.signals.index_of(name)
    }

    fn context(&self) -> String {
        format!("group '{}'", self.name)
    }
}

// ============================================================================
// RUNTIME STATE
// ============================================================================

/// Values of one neuron as seen by its group's plans
pub(crate) struct NeuronFrame<'a> {
    pub values: &'a [Array1<f64>],
    pub neuron: usize,
}

impl Frame for NeuronFrame<'_> {
    fn load(&self, slot: Slot) -> f64 {
        match slot {
            Slot::Own(v) => self.values[v][self.neuron],
            _ => f64::NAN,
        }
    }

    fn index(&self) -> f64 {
        self.neuron as f64
    }

    fn count(&self) -> f64 {
        self.values.first().map(|v| v.len()).unwrap_or(0) as f64
    }
}

struct CompiledEquation {
    slot: usize,
    plan: Plan,
    unless_refractory: bool,
}

pub(crate) struct CompiledStatement {
    pub slot: usize,
    pub op: AssignOp,
    pub plan: Plan,
}

enum CompiledRefractory {
    None,
    Steps(u64),
    Condition(Plan),
}

/// Compiled, running neuron group
pub struct GroupState {
    name: String,
    n: usize,
    method: IntegrationMethod,
    pub(crate) variables: Vec<VariableInfo>,
    pub(crate) values: Vec<Array1<f64>>,
    /// (slot, plan) of stored subexpressions in evaluation order
    stored: Vec<(usize, Plan)>,
    integrators: Vec<CompiledEquation>,
    noise_count: usize,
    threshold: Option<Plan>,
    reset: Vec<CompiledStatement>,
    refractory: CompiledRefractory,
    /// First step at which the neuron may spike again
    refractory_until: Vec<u64>,
    /// Condition-based refractoriness in effect
    refractory_flag: Vec<bool>,
    /// Last spike time for each neuron (-inf if never spiked)
    last_spike: Array1<f64>,
    /// Plain subexpressions, compiled for recording
    inline: Vec<(String, Plan)>,
}

/// Whole steps covering a refractory period, so that `step * dt >= period`
pub(crate) fn refractory_steps(period: f64, dt: f64) -> u64 {
    (period / dt - 1e-6).ceil().max(0.0) as u64
}

/// Closed-form step for dx/dt = a + b*x
pub(crate) fn exact_step(x: f64, a: f64, b: f64, dt: f64) -> f64 {
    if b == 0.0 {
        x + a * dt
    } else {
        x + (a + b * x) * (b * dt).exp_m1() / b
    }
}

impl GroupState {
    pub(crate) fn compile(group: &NeuronGroup, namespace: &Namespace, signals: &SignalBank, dt: f64) -> Result<Self> {
        let eqs = &group.equations;
        if group.n == 0 {
            return Err(SimError::ConfigError(format!("group '{}' has no neurons", group.name)));
        }

        // Variable table: differential, parameters, stored subexpressions
        let mut variables = Vec::new();
        for d in &eqs.differential {
            variables.push(VariableInfo {
                name: d.variable.clone(),
                dimension: d.dimension,
                kind: VarKind::Differential,
            });
        }
        for p in &eqs.parameters {
            variables.push(VariableInfo {
                name: p.name.clone(),
                dimension: p.dimension,
                kind: VarKind::Parameter { constant: p.constant },
            });
        }
        let mut subexpressions = Vec::new();
        let mut stored_count = 0;
        for a in &eqs.algebraic {
            let expr = parse_expression(&a.expression)?;
            let mut names = Vec::new();
            expr.names(&mut names);
            if let Some(noise) = names.iter().find(|n| is_noise_name(n)) {
                return Err(SimError::EquationError(format!(
                    "noise term '{}' in subexpression '{}' of group '{}'",
                    noise, a.variable, group.name
                )));
            }
            let stored = if a.constant_over_dt {
                variables.push(VariableInfo {
                    name: a.variable.clone(),
                    dimension: a.dimension,
                    kind: VarKind::Stored(stored_count),
                });
                stored_count += 1;
                Some(stored_count - 1)
            } else {
                None
            };
            subexpressions.push(ParsedSubexpression {
                name: a.variable.clone(),
                expr,
                dimension: a.dimension,
                stored,
            });
        }

        let mut differential = Vec::new();
        let mut noise: Vec<String> = Vec::new();
        for d in &eqs.differential {
            let expr = parse_expression(&d.expression)?;
            let mut names = Vec::new();
            expr.names(&mut names);
            for name in names.into_iter().filter(|n| is_noise_name(n)) {
                if !noise.contains(&name) {
                    noise.push(name);
                }
            }
            differential.push(expr);
        }
        if group.method == IntegrationMethod::Exact && !noise.is_empty() {
            return Err(SimError::ConfigError(format!(
                "group '{}': exact integration cannot handle noise ({}); use euler",
                group.name,
                noise.join(", ")
            )));
        }

        let scope = |stored_visible: usize| GroupScope {
            name: &group.name,
            variables: &variables,
            subexpressions: &subexpressions,
            noise: &noise,
            namespace,
            signals,
            stored_visible,
        };
        let runtime = CompileOptions { allow_noise: false, allow_signals: true };

        let mut stored = Vec::new();
        for sub in &subexpressions {
            if let Some(order) = sub.stored {
                let plan = compile_number(&sub.expr, &scope(order), runtime, sub.dimension, &sub.name)?;
                let slot = variables
                    .iter()
                    .position(|v| v.kind == VarKind::Stored(order))
                    .ok_or_else(|| SimError::EquationError(format!("lost stored variable '{}'", sub.name)))?;
                stored.push((slot, plan));
            }
        }

        let full = scope(stored_count);
        let mut integrators = Vec::new();
        for (slot, (d, expr)) in eqs.differential.iter().zip(&differential).enumerate() {
            let options = CompileOptions { allow_noise: group.method == IntegrationMethod::Euler, allow_signals: true };
            let what = format!("d{}/dt", d.variable);
            let plan = compile_number(expr, &full, options, d.dimension / Dimension::TIME, &what)?;

            match group.method {
                IntegrationMethod::Exact => {
                    let state_count = eqs.differential.len();
                    let state = |s: &Symbol| matches!(s, Symbol::Variable { slot: Slot::Own(v), .. } if *v < state_count);
                    if degree(expr, &full, &state) > 1 {
                        return Err(SimError::EquationError(format!(
                            "{} of group '{}' is not linear in the differential variables; use euler",
                            what, group.name
                        )));
                    }
                }
                IntegrationMethod::Euler => {
                    let is_noise = |s: &Symbol| matches!(s, Symbol::Noise(_));
                    if degree(expr, &full, &is_noise) > 1 {
                        return Err(SimError::EquationError(format!(
                            "noise must enter {} of group '{}' additively",
                            what, group.name
                        )));
                    }
                }
            }
            integrators.push(CompiledEquation { slot, plan, unless_refractory: d.unless_refractory });
        }

        let threshold = match &eqs.threshold {
            Some(t) => Some(compile_condition(&parse_expression(&t.condition)?, &full, runtime, "threshold")?),
            None => None,
        };

        let mut reset = Vec::new();
        if let Some(r) = &eqs.reset {
            for stmt in parse_statements(&r.statements)? {
                let slot = variables.iter().position(|v| v.name == stmt.target).ok_or_else(|| {
                    SimError::UnknownIdentifier { name: stmt.target.clone(), context: format!("reset of group '{}'", group.name) }
                })?;
                if !variables[slot].writable() {
                    return Err(SimError::ConfigError(format!(
                        "reset of group '{}' writes to read-only '{}'",
                        group.name, stmt.target
                    )));
                }
                let expected = match stmt.op {
                    AssignOp::Mul | AssignOp::Div => Dimension::DIMENSIONLESS,
                    _ => variables[slot].dimension,
                };
                let plan = compile_number(&stmt.value, &full, runtime, expected, "reset")?;
                reset.push(CompiledStatement { slot, op: stmt.op, plan });
            }
        }

        let refractory = match &eqs.refractory {
            None => CompiledRefractory::None,
            Some(RefractorySpec::Duration(q)) => {
                let period = SiQuantity::from(*q).as_time()?;
                if !period.is_finite() || period < 0.0 {
                    return Err(SimError::ConfigError(format!(
                        "group '{}': refractory period must be finite and non-negative, got {}",
                        group.name, period
                    )));
                }
                CompiledRefractory::Steps(refractory_steps(period, dt))
            }
            Some(RefractorySpec::Condition(text)) => {
                CompiledRefractory::Condition(compile_condition(&parse_expression(text)?, &full, runtime, "refractory")?)
            }
        };

        let mut inline = Vec::new();
        for sub in subexpressions.iter().filter(|s| s.stored.is_none()) {
            inline.push((sub.name.clone(), compile_number(&sub.expr, &full, runtime, sub.dimension, &sub.name)?));
        }

        let mut state = GroupState {
            name: group.name.clone(),
            n: group.n,
            method: group.method,
            values: vec![Array1::zeros(group.n); variables.len()],
            variables,
            stored,
            integrators,
            noise_count: noise.len(),
            threshold,
            reset,
            refractory,
            refractory_until: vec![0; group.n],
            refractory_flag: vec![false; group.n],
            last_spike: Array1::from_elem(group.n, f64::NEG_INFINITY),
            inline,
        };
        state.initialise(group, namespace, signals)?;

        debug!(
            group = %state.name,
            n = state.n,
            variables = state.variables.len(),
            noise = state.noise_count,
            method = ?state.method,
            "compiled neuron group"
        );
        Ok(state)
    }

    fn initialise(&mut self, group: &NeuronGroup, namespace: &Namespace, signals: &SignalBank) -> Result<()> {
        let setup = CompileOptions::default();
        let no_subexpressions = [];
        let mut scratch = SignalBank::default();

        for (variable, initial) in &group.initial {
            let slot = self
                .variable_index(variable)
                .ok_or_else(|| SimError::ConfigError(format!("Unknown variable: {}", variable)))?;
            match initial {
                InitialValue::Values(values) => {
                    if values.len() != self.n {
                        return Err(SimError::ConfigError(format!(
                            "Expected {} values, got {}",
                            self.n,
                            values.len()
                        )));
                    }
                    self.values[slot] = Array1::from_vec(values.clone());
                }
                InitialValue::Expression(text) => {
                    let scope = GroupScope {
                        name: &group.name,
                        variables: &self.variables,
                        subexpressions: &no_subexpressions,
                        noise: &[],
                        namespace,
                        signals,
                        stored_visible: 0,
                    };
                    let what = format!("initial value of '{}'", variable);
                    let plan =
                        compile_number(&parse_expression(text)?, &scope, setup, self.variables[slot].dimension, &what)?;
                    let mut ctx = EvalContext::new(0.0, 0.0, 0, &mut scratch);
                    let mut column = Array1::zeros(self.n);
                    for neuron in 0..self.n {
                        column[neuron] = plan.eval(&NeuronFrame { values: &self.values, neuron }, &mut ctx)?;
                    }
                    self.values[slot] = column;
                }
            }
            self.check_finite(slot, 0)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name.as_str())
    }

    pub fn values(&self, variable: &str) -> Option<&Array1<f64>> {
        self.variable_index(variable).map(|idx| &self.values[idx])
    }

    pub fn last_spike(&self) -> &Array1<f64> {
        &self.last_spike
    }

    pub(crate) fn variable_index(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| v.name == name)
    }

    pub(crate) fn inline_index(&self, name: &str) -> Option<usize> {
        self.inline.iter().position(|(n, _)| n == name)
    }

    pub(crate) fn eval_inline(&self, idx: usize, neuron: usize, ctx: &mut EvalContext<'_>) -> Result<f64> {
        self.inline[idx].1.eval(&NeuronFrame { values: &self.values, neuron }, ctx)
    }

    /// Refractory as seen by the integrator in the current step
    fn is_refractory(&self, neuron: usize, step: u64) -> bool {
        match self.refractory {
            CompiledRefractory::None => false,
            CompiledRefractory::Steps(_) => step < self.refractory_until[neuron],
            CompiledRefractory::Condition(_) => self.refractory_flag[neuron],
        }
    }

    pub(crate) fn check_finite(&self, slot: usize, step: u64) -> Result<()> {
        if let Some((neuron, &value)) = self.values[slot].iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(SimError::NonFinite {
                group: self.name.clone(),
                variable: self.variables[slot].name.clone(),
                neuron,
                step,
                value,
            });
        }
        Ok(())
    }

    /// Advance every differential variable by one step.
    ///
    /// Stored subexpressions are refreshed first. All derivatives are taken from the
    /// pre-step state and written back together.
    pub(crate) fn integrate(&mut self, ctx: &mut EvalContext<'_>, rng: &mut StdRng) -> Result<()> {
        let step = ctx.step;
        let dt = ctx.dt;

        for k in 0..self.stored.len() {
            let slot = self.stored[k].0;
            for neuron in 0..self.n {
                let value = self.stored[k].1.eval(&NeuronFrame { values: &self.values, neuron }, ctx)?;
                self.values[slot][neuron] = value;
            }
            self.check_finite(slot, step)?;
        }

        if self.integrators.is_empty() {
            return Ok(());
        }

        let scale = 1.0 / dt.sqrt();
        let slots: Vec<Slot> = self.integrators.iter().map(|eq| Slot::Own(eq.slot)).collect();
        let mut updated: Vec<Array1<f64>> = self.integrators.iter().map(|eq| self.values[eq.slot].clone()).collect();
        for neuron in 0..self.n {
            if self.noise_count > 0 {
                ctx.noise.clear();
                for _ in 0..self.noise_count {
                    let z: f64 = StandardNormal.sample(rng);
                    ctx.noise.push(z * scale);
                }
            }
            let refractory = self.is_refractory(neuron, step);
            let frame = NeuronFrame { values: &self.values, neuron };

            match self.method {
                IntegrationMethod::Euler => {
                    for (k, eq) in self.integrators.iter().enumerate() {
                        if eq.unless_refractory && refractory {
                            continue;
                        }
                        updated[k][neuron] = self.values[eq.slot][neuron] + eq.plan.eval(&frame, ctx)? * dt;
                    }
                }
                IntegrationMethod::Exact => {
                    let next = self.linear_step(&frame, &slots, refractory, ctx)?;
                    for (k, x) in next.into_iter().enumerate() {
                        updated[k][neuron] = x;
                    }
                }
            }
        }

        for (k, values) in updated.into_iter().enumerate() {
            let slot = self.integrators[k].slot;
            self.values[slot] = values;
            self.check_finite(slot, step)?;
        }
        Ok(())
    }

    /// Closed-form step of ds/dt = A s + c over all differential variables.
    ///
    /// A and c are read off the right-hand sides at the pre-step values of everything
    /// else. Rows of equations frozen by refractoriness are zero.
    fn linear_step(
        &self,
        frame: &NeuronFrame<'_>,
        slots: &[Slot],
        refractory: bool,
        ctx: &mut EvalContext<'_>,
    ) -> Result<Vec<f64>> {
        let m = slots.len();
        let dt = ctx.dt;
        let state: Vec<f64> = slots.iter().map(|&slot| frame.load(slot)).collect();

        let mut unit = vec![0.0; m];
        let mut coupling = DMatrix::<f64>::zeros(m, m);
        let mut constant = DVector::<f64>::zeros(m);
        for (k, eq) in self.integrators.iter().enumerate() {
            if eq.unless_refractory && refractory {
                continue;
            }
            let c = eq.plan.eval(&Override { inner: frame, slots, values: &unit }, ctx)?;
            constant[k] = c;
            for j in 0..m {
                unit[j] = 1.0;
                let at = eq.plan.eval(&Override { inner: frame, slots, values: &unit }, ctx)?;
                unit[j] = 0.0;
                coupling[(k, j)] = at - c;
            }
        }

        if m == 1 {
            return Ok(vec![exact_step(state[0], constant[0], coupling[(0, 0)], dt)]);
        }

        // exp of [[A dt, c dt], [0, 0]] maps (s, 1) to (s(t + dt), 1)
        let mut augmented = DMatrix::<f64>::zeros(m + 1, m + 1);
        augmented.view_mut((0, 0), (m, m)).copy_from(&(coupling * dt));
        augmented.view_mut((0, m), (m, 1)).copy_from(&(constant * dt));
        let extended = DVector::from_iterator(m + 1, state.iter().copied().chain(std::iter::once(1.0)));
        let next = augmented.exp() * extended;
        Ok(next.iter().take(m).copied().collect())
    }

    /// Evaluate thresholds, run resets and start refractory periods
    pub(crate) fn detect_spikes(&mut self, group: usize, ctx: &mut EvalContext<'_>) -> Result<Vec<SpikeEvent>> {
        let step = ctx.step;
        let Some(threshold) = &self.threshold else {
            return Ok(Vec::new());
        };

        let mut spiking = Vec::new();
        for neuron in 0..self.n {
            let frame = NeuronFrame { values: &self.values, neuron };
            match &self.refractory {
                CompiledRefractory::Condition(condition) if self.refractory_flag[neuron] => {
                    if condition.eval_bool(&frame, ctx)? {
                        continue;
                    }
                    self.refractory_flag[neuron] = false;
                }
                CompiledRefractory::Steps(_) if step < self.refractory_until[neuron] => continue,
                _ => {}
            }
            if threshold.eval_bool(&frame, ctx)? {
                spiking.push(neuron);
            }
        }

        let mut events = Vec::with_capacity(spiking.len());
        for neuron in spiking {
            for stmt in &self.reset {
                let value = stmt.plan.eval(&NeuronFrame { values: &self.values, neuron }, ctx)?;
                let current = &mut self.values[stmt.slot][neuron];
                *current = match stmt.op {
                    AssignOp::Set => value,
                    AssignOp::Add => *current + value,
                    AssignOp::Sub => *current - value,
                    AssignOp::Mul => *current * value,
                    AssignOp::Div => *current / value,
                };
                if !current.is_finite() {
                    return Err(SimError::NonFinite {
                        group: self.name.clone(),
                        variable: self.variables[stmt.slot].name.clone(),
                        neuron,
                        step,
                        value: *current,
                    });
                }
            }
            self.last_spike[neuron] = ctx.t;
            match self.refractory {
                CompiledRefractory::Steps(steps) => self.refractory_until[neuron] = step + steps,
                CompiledRefractory::Condition(_) => self.refractory_flag[neuron] = true,
                CompiledRefractory::None => {}
            }
            events.push(SpikeEvent { group, neuron, step, time: ctx.t });
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::parse_equations;
    use rand::SeedableRng;
    use spikesim_core::{Quantity, Unit};

    fn build(group: &NeuronGroup, dt: f64) -> Result<GroupState> {
        GroupState::compile(group, &Namespace::new(), &SignalBank::default(), dt)
    }

    fn step(state: &mut GroupState, n: u64, dt: f64) -> Vec<SpikeEvent> {
        let mut bank = SignalBank::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = EvalContext::new(n as f64 * dt, dt, n, &mut bank);
        state.integrate(&mut ctx, &mut rng).unwrap();
        state.detect_spikes(0, &mut ctx).unwrap()
    }

    #[test]
    fn test_neuron_group() {
        let eqs = parse_equations("dv/dt = -v/(10*ms) : 1").unwrap();
        let mut group = NeuronGroup::new("test", 100, eqs);
        group.set_initial("v", Array1::from_elem(100, 0.7)).unwrap();
        assert!(group.set_initial("v", Array1::zeros(3)).is_err());
        assert!(group.set_initial("w", Array1::zeros(100)).is_err());

        let state = build(&group, 1e-4).unwrap();
        assert_eq!(state.len(), 100);
        assert_eq!(state.values("v").unwrap()[0], 0.7);
    }

    #[test]
    fn test_exact_decay() {
        let eqs = parse_equations("dv/dt = (2 - v)/tau : 1").unwrap();
        let mut ns = Namespace::new();
        ns.insert("tau".into(), SiQuantity::new(0.01, Dimension::TIME));
        let group = NeuronGroup::new("g", 1, eqs).with_method(IntegrationMethod::Exact);
        let mut state = GroupState::compile(&group, &ns, &SignalBank::default(), 0.001).unwrap();

        for n in 1..=10 {
            step(&mut state, n, 0.001);
        }
        // v(t) = 2 (1 - exp(-t/tau)) at t = 10 ms
        let expected = 2.0 * (1.0 - (-1.0f64).exp());
        assert!((state.values("v").unwrap()[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_exact_rejects_nonlinear() {
        let eqs = parse_equations("dv/dt = v*v/ms : 1").unwrap();
        let group = NeuronGroup::new("g", 1, eqs).with_method(IntegrationMethod::Exact);
        assert!(matches!(build(&group, 1e-4), Err(SimError::EquationError(_))));
    }

    #[test]
    fn test_exact_coupled_system() {
        let eqs = parse_equations("dx/dt = (1 - x)/ms : 1\ndth/dt = (x - th)/(5*ms) : 1").unwrap();
        let group = NeuronGroup::new("g", 1, eqs).with_method(IntegrationMethod::Exact);
        let mut state = build(&group, 1e-3).unwrap();

        // x = 1 - exp(-t/a), th = 1 - (b exp(-t/b) - a exp(-t/a))/(b - a)
        let (a, b) = (1e-3, 5e-3);
        for n in 1..=10 {
            step(&mut state, n, 1e-3);
            let t = n as f64 * 1e-3;
            let x = 1.0 - (-t / a).exp();
            let th = 1.0 - (b * (-t / b).exp() - a * (-t / a).exp()) / (b - a);
            assert!((state.values("x").unwrap()[0] - x).abs() < 1e-9, "x at step {n}");
            assert!((state.values("th").unwrap()[0] - th).abs() < 1e-9, "th at step {n}");
        }
    }

    #[test]
    fn test_exact_rejects_product_of_variables() {
        let eqs = parse_equations("dx/dt = -x*th/ms : 1\ndth/dt = -th/ms : 1").unwrap();
        let group = NeuronGroup::new("g", 1, eqs).with_method(IntegrationMethod::Exact);
        assert!(matches!(build(&group, 1e-4), Err(SimError::EquationError(_))));
    }

    #[test]
    fn test_exact_rejects_noise() {
        let eqs = parse_equations("dv/dt = xi/sqrt(ms) : 1").unwrap();
        let group = NeuronGroup::new("g", 1, eqs).with_method(IntegrationMethod::Exact);
        assert!(matches!(build(&group, 1e-4), Err(SimError::ConfigError(_))));
    }

    #[test]
    fn test_noise_must_be_additive() {
        let eqs = parse_equations("dv/dt = xi*xi : 1").unwrap();
        let group = NeuronGroup::new("g", 1, eqs);
        assert!(matches!(build(&group, 1e-4), Err(SimError::EquationError(_))));
    }

    #[test]
    fn test_threshold_reset_refractory() {
        let eqs = parse_equations("dx/dt = 1/ms : 1 (unless refractory)").unwrap();
        let group = NeuronGroup::new("g", 1, eqs)
            .with_threshold("x >= 1")
            .with_reset("x = 0")
            .with_refractory(RefractorySpec::Duration(Quantity::new(2.0, Unit::Millisecond)));
        let dt = 0.5e-3;
        let mut state = build(&group, dt).unwrap();

        let mut spike_steps = Vec::new();
        for n in 1..=20 {
            if !step(&mut state, n, dt).is_empty() {
                spike_steps.push(n);
            }
            assert_eq!(state.values("x").unwrap().len(), 1);
        }
        // 2 ms refractory = 4 steps counted from the spike step, then 2 steps to climb
        assert_eq!(spike_steps, vec![2, 7, 12, 17]);
        assert!((state.last_spike()[0] - 17.0 * dt).abs() < 1e-12);
    }

    #[test]
    fn test_refractory_condition() {
        let eqs = parse_equations("dv/dt = 1/ms : 1").unwrap();
        let group = NeuronGroup::new("g", 1, eqs)
            .with_threshold("v > 0.5")
            .with_reset("v -= 0.2")
            .with_refractory(RefractorySpec::Condition("v > 0.5".into()));
        let dt = 0.25e-3;
        let mut state = build(&group, dt).unwrap();

        let mut count = 0;
        for n in 1..=12 {
            count += step(&mut state, n, dt).len();
        }
        // v keeps rising, so after the first spike the condition never releases
        assert_eq!(count, 1);
    }

    #[test]
    fn test_reset_sees_earlier_statements() {
        let eqs = parse_equations("dx/dt = 1/ms : 1\nth : 1").unwrap();
        let mut group = NeuronGroup::new("g", 1, eqs)
            .with_threshold("x > th")
            .with_reset("x = 0; th = th*2.5 + 0.01 + x");
        group.set_expression("th", "0.1").unwrap();
        let mut state = build(&group, 1e-3).unwrap();
        assert_eq!(step(&mut state, 1, 1e-3).len(), 1);
        assert!((state.values("th").unwrap()[0] - 0.26).abs() < 1e-12);
    }

    #[test]
    fn test_reset_rejects_constants() {
        let eqs = parse_equations("dv/dt = -v/ms : 1\nfreq : Hz (constant)").unwrap();
        let group = NeuronGroup::new("g", 1, eqs).with_threshold("v > 1").with_reset("freq = 0*Hz");
        assert!(matches!(build(&group, 1e-4), Err(SimError::ConfigError(_))));
    }

    #[test]
    fn test_initial_expression_over_index() {
        let eqs = parse_equations("dv/dt = -v/ms : 1\nfreq : Hz (constant)").unwrap();
        let mut group = NeuronGroup::new("g", 3, eqs);
        group.set_expression("freq", "(i + 1) * 100*Hz").unwrap();
        let state = build(&group, 1e-4).unwrap();
        assert_eq!(state.values("freq").unwrap().to_vec(), vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_initial_expression_unit_mismatch() {
        let eqs = parse_equations("freq : Hz").unwrap();
        let mut group = NeuronGroup::new("g", 3, eqs);
        group.set_expression("freq", "100").unwrap();
        assert!(matches!(build(&group, 1e-4), Err(SimError::UnitError { .. })));
    }

    #[test]
    fn test_nan_detected() {
        let eqs = parse_equations("dv/dt = log(v - 1)/ms : 1").unwrap();
        let group = NeuronGroup::new("g", 2, eqs);
        let mut state = build(&group, 1e-4).unwrap();
        let mut bank = SignalBank::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut ctx = EvalContext::new(1e-4, 1e-4, 1, &mut bank);
        match state.integrate(&mut ctx, &mut rng) {
            Err(SimError::NonFinite { group, variable, neuron, step, .. }) => {
                assert_eq!((group.as_str(), variable.as_str(), neuron, step), ("g", "v", 0, 1));
            }
            other => panic!("expected NonFinite, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_refractory_steps_cover_period() {
        assert_eq!(refractory_steps(2e-3, 1e-3), 2);
        assert_eq!(refractory_steps(2e-3, 1.0 / 44100.0), 89);
        assert_eq!(refractory_steps(0.0, 1e-3), 0);
    }

    #[test]
    fn test_exact_step_limits() {
        assert_eq!(exact_step(1.0, 2.0, 0.0, 0.5), 2.0);
        // fixed point of a + b x is -a/b
        assert!((exact_step(3.0, 3.0, -1.0, 0.1) - 3.0).abs() < 1e-15);
    }
}
