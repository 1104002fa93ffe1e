//! Synapse connections between neuron groups.

use crate::equations::parse_equations;
use crate::expr::{parse_expression, parse_statements, AssignOp};
use crate::group::GroupState;
use crate::plan::{
    builtin_constant, compile_condition, compile_number, CompileOptions, EvalContext, Frame, Plan, Resolver, Slot,
    Symbol,
};
use crate::signals::SignalBank;
use crate::{Namespace, Result, SimError};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use spikesim_core::{Dimension, SiQuantity};
use std::collections::HashMap;
use tracing::debug;

/// Connection rule, applied in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    /// Every source to every target, `multiplicity` parallel synapses per pair
    AllToAll { multiplicity: usize },
    OneToOne,
    Pairs(Vec<(usize, usize)>),
    /// Independent Bernoulli draw per pair (seeded from the network seed)
    Random { p: f64 },
}

/// `variable[condition] = value`, evaluated once per synapse at setup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynapticAssignment {
    pub variable: String,
    #[serde(default)]
    pub condition: Option<String>,
    pub value: String,
}

/// Synapse connections between neuron groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synapses {
    pub name: String,
    pub source: String, // Source NeuronGroup name
    pub target: String, // Target NeuronGroup name
    /// Statements run on delivery, e.g. `v += 0.5`
    pub on_pre: String,
    /// Per-synapse parameters, e.g. `w : 1`
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_multisynaptic_index")]
    pub multisynaptic_index: String,
    #[serde(default, rename = "connect")]
    pub connectivity: Vec<Connectivity>,
    #[serde(default)]
    pub assignments: Vec<SynapticAssignment>,
}

fn default_multisynaptic_index() -> String {
    "k".into()
}

impl Synapses {
    pub fn new(name: &str, source: &str, target: &str, on_pre: &str) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            on_pre: on_pre.to_string(),
            model: String::new(),
            multisynaptic_index: default_multisynaptic_index(),
            connectivity: Vec::new(),
            assignments: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_multisynaptic_index(mut self, name: &str) -> Self {
        self.multisynaptic_index = name.to_string();
        self
    }

    /// Connect all-to-all
    pub fn connect_all_to_all(&mut self, multiplicity: usize) {
        self.connectivity.push(Connectivity::AllToAll { multiplicity });
    }

    /// Connect with probability p
    pub fn connect_random(&mut self, p: f64) {
        self.connectivity.push(Connectivity::Random { p });
    }

    /// One-to-one mapping
    pub fn connect_one_to_one(&mut self) {
        self.connectivity.push(Connectivity::OneToOne);
    }

    pub fn connect_pairs(&mut self, pairs: &[(usize, usize)]) {
        self.connectivity.push(Connectivity::Pairs(pairs.to_vec()));
    }

    /// Delay of every synapse
    pub fn set_delay(&mut self, delay: &str) {
        self.set_where("delay", None, delay);
    }

    /// Delay of the synapses matching `condition`, e.g. `k == 1`
    pub fn set_delay_where(&mut self, condition: &str, delay: &str) {
        self.set_where("delay", Some(condition), delay);
    }

    pub fn set_value(&mut self, variable: &str, value: &str) {
        self.set_where(variable, None, value);
    }

    pub fn set_where(&mut self, variable: &str, condition: Option<&str>, value: &str) {
        self.assignments.push(SynapticAssignment {
            variable: variable.to_string(),
            condition: condition.map(str::to_string),
            value: value.to_string(),
        });
    }
}

// ============================================================================
// NAMING SCOPE
// ============================================================================

struct SynapseScope<'a> {
    name: &'a str,
    variables: &'a [(String, Dimension)],
    pre: &'a GroupState,
    post: &'a GroupState,
    namespace: &'a Namespace,
    signals: &'a SignalBank,
}

fn group_variable(group: &GroupState, name: &str) -> Option<(usize, Dimension)> {
    group.variable_index(name).map(|idx| (idx, group.variables[idx].dimension))
}

impl Resolver for SynapseScope<'_> {
    fn resolve(&self, name: &str) -> Option<Symbol> {
        if let Some(idx) = self.variables.iter().position(|(n, _)| n == name) {
            return Some(Symbol::Variable { slot: Slot::Synapse(idx), dimension: self.variables[idx].1 });
        }
        match name {
            "t" => return Some(Symbol::Time),
            "dt" => return Some(Symbol::Dt),
            "N_pre" => return Some(Symbol::Constant(SiQuantity::dimensionless(self.pre.len() as f64))),
            "N_post" => return Some(Symbol::Constant(SiQuantity::dimensionless(self.post.len() as f64))),
            _ => {}
        }
        if let Some(base) = name.strip_suffix("_pre") {
            if let Some((idx, dimension)) = group_variable(self.pre, base) {
                return Some(Symbol::Variable { slot: Slot::Pre(idx), dimension });
            }
        }
        let base = name.strip_suffix("_post").unwrap_or(name);
        if let Some((idx, dimension)) = group_variable(self.post, base) {
            return Some(Symbol::Variable { slot: Slot::Post(idx), dimension });
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
        format!("synapses '{}'", self.name)
    }
}

struct SynapseFrame<'a> {
    pre: &'a [Array1<f64>],
    post: &'a [Array1<f64>],
    synapse_values: &'a [Vec<f64>],
    i: usize,
    j: usize,
    synapse: usize,
}

impl Frame for SynapseFrame<'_> {
    fn load(&self, slot: Slot) -> f64 {
        match slot {
            Slot::Pre(v) => self.pre[v][self.i],
            Slot::Post(v) => self.post[v][self.j],
            Slot::Synapse(v) => self.synapse_values[v][self.synapse],
            Slot::Own(_) => f64::NAN,
        }
    }

    fn index(&self) -> f64 {
        self.i as f64
    }
}

// ============================================================================
// RUNTIME STATE
// ============================================================================

const PRE_INDEX: usize = 0;
const POST_INDEX: usize = 1;
const MULTI_INDEX: usize = 2;
const DELAY: usize = 3;

/// Largest delay in steps, the range where step counts are exact in an `f64`
pub(crate) const MAX_DELAY_STEPS: u64 = 1 << 53;

struct Effect {
    /// Target variable in the postsynaptic group
    slot: usize,
    sign: f64,
    plan: Plan,
}

/// Pending increment of one postsynaptic variable
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Increment {
    pub group: usize,
    pub slot: usize,
    pub neuron: usize,
    pub value: f64,
}

/// Compiled synapse set
pub struct SynapseState {
    name: String,
    pub(crate) source: usize,
    pub(crate) target: usize,
    /// `i`, `j`, multisynaptic index, `delay`, then model parameters
    variables: Vec<(String, Dimension)>,
    values: Vec<Vec<f64>>,
    pub(crate) delay_steps: Vec<u64>,
    /// Synapse ids per source neuron
    by_source: Vec<Vec<usize>>,
    effects: Vec<Effect>,
}

impl SynapseState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn compile(
        synapses: &Synapses,
        groups: &[GroupState],
        source: usize,
        target: usize,
        namespace: &Namespace,
        signals: &SignalBank,
        dt: f64,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let pre = &groups[source];
        let post = &groups[target];

        let mut variables = vec![
            ("i".to_string(), Dimension::DIMENSIONLESS),
            ("j".to_string(), Dimension::DIMENSIONLESS),
            (synapses.multisynaptic_index.clone(), Dimension::DIMENSIONLESS),
            ("delay".to_string(), Dimension::TIME),
        ];
        let model = parse_equations(&synapses.model)?;
        if !model.differential.is_empty() || !model.algebraic.is_empty() {
            return Err(SimError::ConfigError(format!(
                "synapses '{}': only parameters are supported in the synapse model",
                synapses.name
            )));
        }
        for p in &model.parameters {
            if variables.iter().any(|(n, _)| *n == p.name) {
                return Err(SimError::EquationError(format!(
                    "synapses '{}': '{}' is defined twice",
                    synapses.name, p.name
                )));
            }
            variables.push((p.name.clone(), p.dimension));
        }

        let (pre_ids, post_ids, multi) = connect(synapses, pre.len(), post.len(), rng)?;
        let count = pre_ids.len();
        let mut values = vec![vec![0.0; count]; variables.len()];
        values[PRE_INDEX] = pre_ids.iter().map(|&i| i as f64).collect();
        values[POST_INDEX] = post_ids.iter().map(|&j| j as f64).collect();
        values[MULTI_INDEX] = multi.iter().map(|&k| k as f64).collect();

        let scope = SynapseScope {
            name: &synapses.name,
            variables: &variables,
            pre,
            post,
            namespace,
            signals,
        };

        // Setup-time assignments, including delays
        let setup = CompileOptions::default();
        let mut scratch = SignalBank::default();
        for assignment in &synapses.assignments {
            let slot = variables
                .iter()
                .position(|(n, _)| *n == assignment.variable)
                .filter(|&idx| idx >= DELAY)
                .ok_or_else(|| SimError::UnknownIdentifier {
                    name: assignment.variable.clone(),
                    context: format!("assignment in synapses '{}'", synapses.name),
                })?;
            let what = format!("value of '{}'", assignment.variable);
            let value = compile_number(&parse_expression(&assignment.value)?, &scope, setup, variables[slot].1, &what)?;
            let condition = match &assignment.condition {
                Some(text) => Some(compile_condition(&parse_expression(text)?, &scope, setup, "condition")?),
                None => None,
            };

            let mut ctx = EvalContext::new(0.0, dt, 0, &mut scratch);
            for s in 0..count {
                let frame = SynapseFrame {
                    pre: &pre.values,
                    post: &post.values,
                    synapse_values: &values,
                    i: pre_ids[s],
                    j: post_ids[s],
                    synapse: s,
                };
                if let Some(condition) = &condition {
                    if !condition.eval_bool(&frame, &mut ctx)? {
                        continue;
                    }
                }
                let v = value.eval(&frame, &mut ctx)?;
                if slot == DELAY && (!v.is_finite() || v < 0.0) {
                    return Err(SimError::InvalidDelay { synapses: synapses.name.clone(), synapse: s, delay: v });
                }
                values[slot][s] = v;
            }
        }
        let mut delay_steps: Vec<u64> = Vec::with_capacity(count);
        for (s, &delay) in values[DELAY].iter().enumerate() {
            let steps = (delay / dt).round();
            if steps > MAX_DELAY_STEPS as f64 {
                return Err(SimError::InvalidDelay { synapses: synapses.name.clone(), synapse: s, delay });
            }
            delay_steps.push(steps as u64);
        }

        let runtime = CompileOptions { allow_noise: false, allow_signals: true };
        let mut effects = Vec::new();
        for stmt in parse_statements(&synapses.on_pre)? {
            let sign = match stmt.op {
                AssignOp::Add => 1.0,
                AssignOp::Sub => -1.0,
                _ => {
                    return Err(SimError::ConfigError(format!(
                        "synapses '{}': on_pre effects must be '+=' or '-=' (got '{}')",
                        synapses.name, stmt.target
                    )))
                }
            };
            let base = stmt.target.strip_suffix("_post").unwrap_or(&stmt.target);
            let slot = post.variable_index(base).ok_or_else(|| SimError::UnknownIdentifier {
                name: stmt.target.clone(),
                context: format!("on_pre of synapses '{}' (postsynaptic variables)", synapses.name),
            })?;
            if !post.variables[slot].writable() {
                return Err(SimError::ConfigError(format!(
                    "synapses '{}': on_pre writes to read-only '{}'",
                    synapses.name, stmt.target
                )));
            }
            let plan = compile_number(&stmt.value, &scope, runtime, post.variables[slot].dimension, "on_pre")?;
            effects.push(Effect { slot, sign, plan });
        }

        let mut by_source = vec![Vec::new(); pre.len()];
        for (s, &i) in pre_ids.iter().enumerate() {
            by_source[i].push(s);
        }

        debug!(
            synapses = %synapses.name,
            count,
            max_delay_steps = delay_steps_max(&delay_steps),
            "compiled synapses"
        );
        Ok(SynapseState {
            name: synapses.name.clone(),
            source,
            target,
            variables,
            values,
            delay_steps,
            by_source,
            effects,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.delay_steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.delay_steps.is_empty()
    }

    /// Values of `i`, `j`, the multisynaptic index, `delay` or a model parameter
    pub fn values(&self, variable: &str) -> Option<&[f64]> {
        self.variables
            .iter()
            .position(|(n, _)| n == variable)
            .map(|idx| self.values[idx].as_slice())
    }

    pub(crate) fn outgoing(&self, neuron: usize) -> &[usize] {
        self.by_source.get(neuron).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Evaluate the on_pre effects of one synapse against the current state
    pub(crate) fn increments(
        &self,
        synapse: usize,
        groups: &[GroupState],
        ctx: &mut EvalContext<'_>,
        out: &mut Vec<Increment>,
    ) -> Result<()> {
        let i = self.values[PRE_INDEX][synapse] as usize;
        let j = self.values[POST_INDEX][synapse] as usize;
        let frame = SynapseFrame {
            pre: &groups[self.source].values,
            post: &groups[self.target].values,
            synapse_values: &self.values,
            i,
            j,
            synapse,
        };
        for effect in &self.effects {
            let value = effect.plan.eval(&frame, ctx)?;
            out.push(Increment { group: self.target, slot: effect.slot, neuron: j, value: effect.sign * value });
        }
        Ok(())
    }
}

fn delay_steps_max(steps: &[u64]) -> u64 {
    steps.iter().copied().max().unwrap_or(0)
}

/// Expand the connection rules into (i, j, k) triples
fn connect(
    synapses: &Synapses,
    n_pre: usize,
    n_post: usize,
    rng: &mut StdRng,
) -> Result<(Vec<usize>, Vec<usize>, Vec<usize>)> {
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    for rule in &synapses.connectivity {
        match rule {
            Connectivity::AllToAll { multiplicity } => {
                for i in 0..n_pre {
                    for j in 0..n_post {
                        for _ in 0..*multiplicity {
                            pairs.push((i, j));
                        }
                    }
                }
            }
            Connectivity::OneToOne => {
                if n_pre != n_post {
                    return Err(SimError::ConfigError(format!(
                        "synapses '{}': one-to-one needs equal group sizes ({} vs {})",
                        synapses.name, n_pre, n_post
                    )));
                }
                pairs.extend((0..n_pre).map(|i| (i, i)));
            }
            Connectivity::Pairs(list) => {
                for &(i, j) in list {
                    if i >= n_pre || j >= n_post {
                        return Err(SimError::ConfigError(format!(
                            "synapses '{}': pair ({}, {}) out of range",
                            synapses.name, i, j
                        )));
                    }
                    pairs.push((i, j));
                }
            }
            Connectivity::Random { p } => {
                if !(0.0..=1.0).contains(p) {
                    return Err(SimError::ConfigError(format!(
                        "synapses '{}': connection probability {} outside [0, 1]",
                        synapses.name, p
                    )));
                }
                for i in 0..n_pre {
                    for j in 0..n_post {
                        if rng.gen::<f64>() < *p {
                            pairs.push((i, j));
                        }
                    }
                }
            }
        }
    }

    // multisynaptic index: ordinal among synapses sharing (i, j)
    let mut seen: HashMap<(usize, usize), usize> = HashMap::new();
    let mut pre = Vec::with_capacity(pairs.len());
    let mut post = Vec::with_capacity(pairs.len());
    let mut multi = Vec::with_capacity(pairs.len());
    for (i, j) in pairs {
        let k = seen.entry((i, j)).or_insert(0);
        pre.push(i);
        post.push(j);
        multi.push(*k);
        *k += 1;
    }
    Ok((pre, post, multi))
}
