//! Network assembly and the simulation loop.
//!
//! A [`Network`] collects constants, signals, groups, synapses and monitors. `build`
//! validates and compiles everything into a [`Simulation`], which steps the clock:
//!
//! 1. integrate every group (stored subexpressions first)
//! 2. thresholds, resets, refractory bookkeeping
//! 3. schedule new spikes, deliver due effects
//! 4. record
//!
//! A step that fails halts the simulation without recording anything for that step.

use crate::equations::is_reserved;
use crate::expr::parse_expression;
use crate::group::{GroupState, NeuronGroup};
use crate::monitors::{MonitorId, MonitorSpec, Recordable, Recorder, Recording, Selector};
use crate::plan::{builtin_constant, compile, CompileOptions, EvalContext, Frame, Resolver, Slot, Symbol, ValueKind};
use crate::scheduler::DelayScheduler;
use crate::signals::SignalBank;
use crate::synapses::{SynapseState, Synapses};
use crate::{Namespace, Result, SimError};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use spikesim_core::{SiQuantity, SignalSource, Time};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Simulation configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time step (s)
    pub dt: f64,
    /// Seeds connectivity first, then noise
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { dt: 1e-4, seed: 12345 }
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Network container, plain configuration until [`Network::build`]
pub struct Network {
    pub config: SimulationConfig,
    namespace: Namespace,
    signals: SignalBank,
    groups: Vec<NeuronGroup>,
    synapses: Vec<Synapses>,
    monitors: Vec<MonitorSpec>,
}

/// Scope of constant expressions: earlier constants and built-in units
struct ConstantScope<'a> {
    namespace: &'a Namespace,
}

impl Resolver for ConstantScope<'_> {
    fn resolve(&self, name: &str) -> Option<Symbol> {
        self.namespace
            .get(name)
            .copied()
            .or_else(|| builtin_constant(name))
            .map(Symbol::Constant)
    }

    fn signal(&self, _name: &str) -> Option<usize> {
        None
    }

    fn context(&self) -> String {
        "constant".into()
    }
}

struct EmptyFrame;

impl Frame for EmptyFrame {
    fn load(&self, _slot: Slot) -> f64 {
        f64::NAN
    }
}

impl Network {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            namespace: Namespace::new(),
            signals: SignalBank::default(),
            groups: Vec::new(),
            synapses: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Named constant visible to every expression
    pub fn constant(&mut self, name: &str, value: impl Into<SiQuantity>) -> Result<()> {
        if is_reserved(name) {
            return Err(SimError::ConfigError(format!("'{}' is a reserved name", name)));
        }
        self.namespace.insert(name.to_string(), value.into());
        Ok(())
    }

    /// Evaluate a constant expression, e.g. `2*ms` or `tau/2`
    pub fn evaluate(&self, expression: &str) -> Result<SiQuantity> {
        let expr = parse_expression(expression)?;
        let scope = ConstantScope { namespace: &self.namespace };
        let plan = compile(&expr, &scope, CompileOptions::default())?;
        let ValueKind::Number(dimension) = plan.kind() else {
            return Err(SimError::UnitError {
                context: format!("constant expression '{}'", expression),
                expected: "number".into(),
                got: plan.kind().to_string(),
            });
        };
        let mut scratch = SignalBank::default();
        let mut ctx = EvalContext::new(0.0, self.config.dt, 0, &mut scratch);
        Ok(SiQuantity::new(plan.eval(&EmptyFrame, &mut ctx)?, dimension))
    }

    /// Constant given as an expression over earlier constants
    pub fn constant_expr(&mut self, name: &str, expression: &str) -> Result<SiQuantity> {
        let value = self.evaluate(expression)?;
        self.constant(name, value)?;
        Ok(value)
    }

    /// Register an external function callable as `name(t)`
    pub fn add_signal(&mut self, name: &str, source: impl SignalSource + 'static) -> Result<()> {
        if is_reserved(name) || self.namespace.contains_key(name) {
            return Err(SimError::ConfigError(format!("signal name '{}' is already taken", name)));
        }
        self.signals.register(name, Box::new(source))?;
        Ok(())
    }

    pub fn add_neuron_group(&mut self, group: NeuronGroup) -> Result<()> {
        if self.groups.iter().any(|g| g.name == group.name) {
            return Err(SimError::ConfigError(format!("group '{}' added twice", group.name)));
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn add_synapses(&mut self, synapses: Synapses) -> Result<()> {
        if self.synapses.iter().any(|s| s.name == synapses.name) {
            return Err(SimError::ConfigError(format!("synapses '{}' added twice", synapses.name)));
        }
        self.synapses.push(synapses);
        Ok(())
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut NeuronGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    pub fn synapses_mut(&mut self, name: &str) -> Option<&mut Synapses> {
        self.synapses.iter_mut().find(|s| s.name == name)
    }

    /// Declare a monitor; validated at build time
    pub fn record(&mut self, group: &str, what: Recordable, selector: Selector) -> MonitorId {
        self.monitors.push(MonitorSpec { group: group.to_string(), what, selector });
        MonitorId(self.monitors.len() - 1)
    }

    /// Compile the network. Groups, then synapses in insertion order.
    pub fn build(self) -> Result<Simulation> {
        let dt = self.config.dt;
        if !dt.is_finite() || dt <= 0.0 {
            return Err(SimError::ConfigError(format!("dt must be positive and finite, got {}", dt)));
        }
        info!(
            groups = self.groups.len(),
            synapses = self.synapses.len(),
            signals = self.signals.len(),
            dt,
            seed = self.config.seed,
            "building network"
        );
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut groups = Vec::with_capacity(self.groups.len());
        for group in &self.groups {
            groups.push(GroupState::compile(group, &self.namespace, &self.signals, dt)?);
        }

        let find = |name: &str, what: &str, owner: &str| {
            self.groups
                .iter()
                .position(|g| g.name == name)
                .ok_or_else(|| SimError::ConfigError(format!("synapses '{}': unknown {} group '{}'", owner, what, name)))
        };
        let mut synapses = Vec::with_capacity(self.synapses.len());
        for s in &self.synapses {
            let source = find(&s.source, "source", &s.name)?;
            let target = find(&s.target, "target", &s.name)?;
            synapses.push(SynapseState::compile(
                s,
                &groups,
                source,
                target,
                &self.namespace,
                &self.signals,
                dt,
                &mut rng,
            )?);
        }

        let recorder = Recorder::new(&self.monitors, &groups, dt)?;
        let total: usize = synapses.iter().map(SynapseState::len).sum();
        debug!(neurons = groups.iter().map(GroupState::len).sum::<usize>(), synapses = total, "network built");

        Ok(Simulation {
            dt,
            step: 0,
            rng,
            signals: self.signals,
            groups,
            synapses,
            scheduler: DelayScheduler::new(),
            recorder,
            phase: RunPhase::Configured,
            stop: StopHandle::default(),
            spikes_emitted: 0,
        })
    }
}

// ============================================================================
// SIMULATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Configured,
    Running,
    Completed,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Requested duration reached
    Finished { steps: u64 },
    /// Stop requested after `steps` steps of this run
    Stopped { steps: u64 },
}

/// Passed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunProgress {
    pub done: u64,
    pub total: u64,
    pub time: Time,
}

/// Requests the running simulation to stop after the current step
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Compiled network with its clock and recorder
pub struct Simulation {
    dt: f64,
    step: u64,
    rng: StdRng,
    signals: SignalBank,
    groups: Vec<GroupState>,
    synapses: Vec<SynapseState>,
    scheduler: DelayScheduler,
    recorder: Recorder,
    phase: RunPhase,
    stop: StopHandle,
    spikes_emitted: u64,
}

impl Simulation {
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Time of the last completed step
    pub fn time(&self) -> Time {
        self.step as f64 * self.dt
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn spikes_emitted(&self) -> u64 {
        self.spikes_emitted
    }

    pub fn pending_effects(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn group(&self, name: &str) -> Option<&GroupState> {
        self.groups.iter().find(|g| g.name() == name)
    }

    pub fn synapses(&self, name: &str) -> Option<&SynapseState> {
        self.synapses.iter().find(|s| s.name() == name)
    }

    pub fn signals(&self) -> &SignalBank {
        &self.signals
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn run(&mut self, duration: f64) -> Result<RunStatus> {
        self.run_with_progress(duration, |_| {})
    }

    /// Run for `round(duration / dt)` steps. May be called again to continue.
    pub fn run_with_progress<F: FnMut(RunProgress)>(&mut self, duration: f64, mut progress: F) -> Result<RunStatus> {
        match self.phase {
            RunPhase::Completed | RunPhase::Halted => {
                return Err(SimError::SimulationError(format!(
                    "simulation is {:?} and cannot run again",
                    self.phase
                )));
            }
            RunPhase::Configured | RunPhase::Running => {}
        }
        if !duration.is_finite() || duration < 0.0 {
            return Err(SimError::ConfigError(format!("run duration must be finite and non-negative, got {}", duration)));
        }

        let total = (duration / self.dt).round() as u64;
        let report_every = (total / 100).max(1);
        self.phase = RunPhase::Running;
        info!(duration, steps = total, from = self.time(), "running simulation");

        for done in 0..total {
            if self.stop.is_stopped() {
                self.phase = RunPhase::Completed;
                info!(steps = done, time = self.time(), "stop requested");
                return Ok(RunStatus::Stopped { steps: done });
            }
            if let Err(err) = self.advance() {
                self.phase = RunPhase::Halted;
                warn!(error = %err, step = self.step, "simulation halted");
                return Err(err);
            }
            if (done + 1) % report_every == 0 || done + 1 == total {
                progress(RunProgress { done: done + 1, total, time: self.time() });
            }
        }

        info!(
            steps = total,
            time = self.time(),
            spikes = self.spikes_emitted,
            pending = self.scheduler.pending(),
            "run finished"
        );
        Ok(RunStatus::Finished { steps: total })
    }

    /// One step of the clock
    fn advance(&mut self) -> Result<()> {
        let step = self.step + 1;
        let t = step as f64 * self.dt;
        self.step = step;
        trace!(step, t, "step");

        self.signals.begin_step();
        let mut ctx = EvalContext::new(t, self.dt, step, &mut self.signals);

        for group in self.groups.iter_mut() {
            group.integrate(&mut ctx, &mut self.rng)?;
        }

        let mut events = Vec::new();
        for (idx, group) in self.groups.iter_mut().enumerate() {
            events.extend(group.detect_spikes(idx, &mut ctx)?);
        }
        self.spikes_emitted += events.len() as u64;

        for event in &events {
            for (sid, synapses) in self.synapses.iter().enumerate() {
                if synapses.source != event.group {
                    continue;
                }
                for &synapse in synapses.outgoing(event.neuron) {
                    let due = event.step.checked_add(synapses.delay_steps[synapse]).ok_or_else(|| {
                        SimError::SimulationError(format!(
                            "delivery step of synapse {} of '{}' overflows the step counter",
                            synapse,
                            synapses.name()
                        ))
                    })?;
                    self.scheduler.schedule(due, sid, synapse);
                }
            }
        }

        let due = self.scheduler.pop_due(step);
        if !due.is_empty() {
            // every effect reads the same pre-delivery state
            let mut increments = Vec::with_capacity(due.len());
            for effect in &due {
                self.synapses[effect.synapses].increments(effect.synapse, &self.groups, &mut ctx, &mut increments)?;
            }
            let mut touched: Vec<(usize, usize)> = Vec::new();
            for inc in increments {
                self.groups[inc.group].values[inc.slot][inc.neuron] += inc.value;
                if !touched.contains(&(inc.group, inc.slot)) {
                    touched.push((inc.group, inc.slot));
                }
            }
            for (group, slot) in touched {
                self.groups[group].check_finite(slot, step)?;
            }
            trace!(step, delivered = due.len(), "delivered synaptic effects");
        }

        self.recorder.record(t, &self.groups, events, &mut ctx)
    }

    /// Close the run and hand out the recording. Partial recordings of stopped or
    /// halted runs stay valid.
    pub fn finish(mut self) -> Recording {
        if self.phase != RunPhase::Halted {
            self.phase = RunPhase::Completed;
        }
        debug!(steps = self.recorder.len(), phase = ?self.phase, "recording finished");
        self.recorder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equations::{parse_equations, RefractorySpec};
    use spikesim_core::{Dimension, FnSource, Quantity, SignalError, Unit};

    fn counter_group(threshold: &str) -> NeuronGroup {
        NeuronGroup::new("g", 1, parse_equations("dx/dt = 512/second : 1").unwrap())
            .with_threshold(threshold)
            .with_reset("x = 0")
    }

    fn spike_count(threshold: &str) -> usize {
        // dt = 1/1024 s, so x grows by exactly 0.5 per step
        let mut net = Network::new(SimulationConfig { dt: 1.0 / 1024.0, seed: 1 });
        net.add_neuron_group(counter_group(threshold)).unwrap();
        let spikes = net.record("g", Recordable::Spikes, Selector::All);
        let mut sim = net.build().unwrap();
        sim.run(10.0 / 1024.0).unwrap();
        sim.finish().spikes(spikes).unwrap().total()
    }

    #[test]
    fn test_strict_threshold_at_boundary() {
        // x reaches exactly 1.0, which does not satisfy x > 1
        assert_eq!(spike_count("x > 1"), 3);
        assert_eq!(spike_count("x >= 1"), 5);
    }

    #[test]
    fn test_constants() {
        let mut net = Network::new(SimulationConfig::default());
        net.constant("tau", SiQuantity::new(0.01, Dimension::TIME)).unwrap();
        let half = net.constant_expr("half_tau", "tau / 2").unwrap();
        assert_eq!(half, SiQuantity::new(0.005, Dimension::TIME));
        assert!(net.constant("dt", SiQuantity::dimensionless(1.0)).is_err());
        assert!(net.constant_expr("bad", "tau > 1*ms").is_err());
        let q = net.constant_expr("f", "2*kHz").unwrap();
        assert_eq!(q, SiQuantity::from(Quantity::new(2.0, Unit::Kilohertz)));
    }

    #[test]
    fn test_duplicate_names() {
        let mut net = Network::new(SimulationConfig::default());
        net.add_neuron_group(counter_group("x > 1")).unwrap();
        assert!(net.add_neuron_group(counter_group("x > 1")).is_err());
        net.add_signal("input", FnSource::new(|_| 0.0)).unwrap();
        assert!(net.add_signal("input", FnSource::new(|_| 0.0)).is_err());
        assert!(net.add_signal("t", FnSource::new(|_| 0.0)).is_err());
    }

    #[test]
    fn test_build_rejects_bad_config() {
        let net = Network::new(SimulationConfig { dt: 0.0, seed: 0 });
        assert!(matches!(net.build(), Err(SimError::ConfigError(_))));

        let mut net = Network::new(SimulationConfig::default());
        net.add_neuron_group(counter_group("x > 1")).unwrap();
        net.add_synapses(Synapses::new("s", "g", "missing", "x += 1")).unwrap();
        assert!(matches!(net.build(), Err(SimError::ConfigError(_))));

        let mut net = Network::new(SimulationConfig::default());
        net.add_neuron_group(counter_group("x > 1")).unwrap();
        net.record("g", Recordable::Variable("nope".into()), Selector::All);
        assert!(matches!(net.build(), Err(SimError::UnknownIdentifier { .. })));

        let mut net = Network::new(SimulationConfig::default());
        net.add_neuron_group(counter_group("x > 1")).unwrap();
        net.record("g", Recordable::Spikes, Selector::Indices(vec![3]));
        assert!(matches!(net.build(), Err(SimError::ConfigError(_))));
    }

    #[test]
    fn test_unknown_identifier_at_setup() {
        let mut net = Network::new(SimulationConfig::default());
        let group = NeuronGroup::new("g", 1, parse_equations("dv/dt = -v/tau_missing : 1").unwrap());
        net.add_neuron_group(group).unwrap();
        assert!(matches!(net.build(), Err(SimError::UnknownIdentifier { .. })));
    }

    /// Source spiking at 100 Hz, target receiving two delayed copies.
    fn delay_network() -> (Network, MonitorId, MonitorId) {
        let mut net = Network::new(SimulationConfig { dt: 1e-3, seed: 3 });
        let source = NeuronGroup::new("src", 1, parse_equations("dphase/dt = 100*Hz : 1").unwrap())
            .with_threshold("phase >= 1 - 1e-9")
            .with_reset("phase = 0");
        let target = NeuronGroup::new("dst", 1, parse_equations("dv/dt = 0/second : 1").unwrap());
        net.add_neuron_group(source).unwrap();
        net.add_neuron_group(target).unwrap();

        let mut syn = Synapses::new("s", "src", "dst", "v += 1");
        syn.connect_all_to_all(2);
        syn.set_delay_where("k == 1", "10*ms");
        net.add_synapses(syn).unwrap();

        let src = net.record("src", Recordable::Spikes, Selector::All);
        let v = net.record("dst", Recordable::Variable("v".into()), Selector::All);
        (net, src, v)
    }

    #[test]
    fn test_delayed_delivery() {
        let (net, src, v) = delay_network();
        let mut sim = net.build().unwrap();
        assert_eq!(sim.synapses("s").unwrap().len(), 2);
        sim.run(0.035).unwrap();
        let rec = sim.finish();

        let spikes = rec.spikes(src).unwrap();
        let steps: Vec<u64> = spikes.spikes.iter().map(|&(_, t)| (t / 1e-3).round() as u64).collect();
        assert_eq!(steps, vec![10, 20, 30]);

        // each spike adds 1 immediately and 1 ten steps later
        let trace = rec.state(v).unwrap().trace(0).unwrap().to_vec();
        assert_eq!(trace.len(), 35);
        assert_eq!(trace[8], 0.0); // step 9
        assert_eq!(trace[9], 1.0); // step 10
        assert_eq!(trace[18], 1.0); // step 19
        assert_eq!(trace[19], 3.0); // step 20: second copy + next spike
        assert_eq!(trace[29], 5.0); // step 30
        assert_eq!(trace[34], 5.0);
    }

    #[test]
    fn test_delay_from_target_frequency() {
        let mut net = Network::new(SimulationConfig { dt: 1e-3, seed: 3 });
        let source = NeuronGroup::new("src", 1, parse_equations("dphase/dt = 100*Hz : 1").unwrap())
            .with_threshold("phase >= 1 - 1e-9")
            .with_reset("phase = 0");
        let mut target = NeuronGroup::new("dst", 1, parse_equations("dv/dt = 0/second : 1\nfreq : Hz (constant)").unwrap());
        target.set_expression("freq", "100*Hz").unwrap();
        net.add_neuron_group(source).unwrap();
        net.add_neuron_group(target).unwrap();

        let mut syn = Synapses::new("s", "src", "dst", "v += 1");
        syn.connect_all_to_all(2);
        syn.set_delay_where("k == 1", "1/freq_post");
        net.add_synapses(syn).unwrap();
        let v = net.record("dst", Recordable::Variable("v".into()), Selector::All);

        let mut sim = net.build().unwrap();
        assert_eq!(sim.synapses("s").unwrap().values("delay").unwrap(), &[0.0, 0.01]);
        sim.run(0.025).unwrap();
        let trace = sim.finish().state(v).unwrap().trace(0).unwrap().to_vec();
        // immediately at step 10, again 10 steps later together with the next spike
        assert_eq!(trace[9], 1.0);
        assert_eq!(trace[18], 1.0);
        assert_eq!(trace[19], 3.0);
    }

    #[test]
    fn test_huge_delay_rejected_at_build() {
        let (mut net, _, _) = delay_network();
        if let Some(syn) = net.synapses_mut("s") {
            syn.set_delay("1e30*second");
        }
        assert!(matches!(net.build(), Err(SimError::InvalidDelay { .. })));
    }

    #[test]
    fn test_longest_delay_stays_pending() {
        let (mut net, _, v) = delay_network();
        if let Some(syn) = net.synapses_mut("s") {
            syn.set_delay_where("k == 1", "1e9*second");
        }
        let mut sim = net.build().unwrap();
        sim.run(0.025).unwrap();
        // the undelayed copies arrive, the delayed ones wait
        assert_eq!(sim.pending_effects(), 2);
        let trace = sim.finish().state(v).unwrap().trace(0).unwrap().to_vec();
        assert_eq!(trace[24], 2.0);
    }

    #[test]
    fn test_run_continues_and_stops() {
        let (net, _, v) = delay_network();
        let mut sim = net.build().unwrap();
        assert_eq!(sim.phase(), RunPhase::Configured);
        assert_eq!(sim.run(0.01).unwrap(), RunStatus::Finished { steps: 10 });
        assert_eq!(sim.run(0.005).unwrap(), RunStatus::Finished { steps: 5 });
        assert_eq!(sim.step_count(), 15);
        assert_eq!(sim.phase(), RunPhase::Running);

        let handle = sim.stop_handle();
        let status = sim
            .run_with_progress(1.0, |p| {
                if p.done >= 20 {
                    handle.stop();
                }
            })
            .unwrap();
        assert!(matches!(status, RunStatus::Stopped { steps } if steps >= 20 && steps < 1000));
        assert_eq!(sim.phase(), RunPhase::Completed);
        assert!(sim.run(0.01).is_err());

        let rec = sim.finish();
        assert_eq!(rec.len() as u64, rec.state(v).unwrap().values.ncols() as u64);
        assert!(rec.times.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_progress_reports() {
        let (net, _, _) = delay_network();
        let mut sim = net.build().unwrap();
        let mut reports = Vec::new();
        sim.run_with_progress(0.2, |p| reports.push(p.done)).unwrap();
        assert_eq!(reports.len(), 100);
        assert_eq!(reports.last(), Some(&200));
    }

    fn noisy_trace(seed: u64) -> Vec<f64> {
        let mut net = Network::new(SimulationConfig { dt: 1e-4, seed });
        let eqs = parse_equations("dv/dt = -v/(10*ms) + 0.5*xi/sqrt(10*ms) : 1").unwrap();
        net.add_neuron_group(NeuronGroup::new("g", 3, eqs)).unwrap();
        let v = net.record("g", Recordable::Variable("v".into()), Selector::Indices(vec![2]));
        let mut sim = net.build().unwrap();
        sim.run(0.01).unwrap();
        sim.finish().state(v).unwrap().trace(2).unwrap().to_vec()
    }

    #[test]
    fn test_seeded_reproducibility() {
        let a = noisy_trace(42);
        assert_eq!(a, noisy_trace(42));
        assert_ne!(a, noisy_trace(43));
        assert!(a.iter().all(|v| v.is_finite()));
    }

    struct Finite {
        left: u64,
    }

    impl SignalSource for Finite {
        fn sample(&mut self, _t: Time) -> std::result::Result<f64, SignalError> {
            if self.left == 0 {
                return Err(SignalError::Exhausted { samples: 5 });
            }
            self.left -= 1;
            Ok(1.0)
        }
    }

    #[test]
    fn test_signal_exhaustion_keeps_partial_recording() {
        let mut net = Network::new(SimulationConfig { dt: 1e-3, seed: 1 });
        net.add_signal("get_sample", Finite { left: 5 }).unwrap();
        let eqs = parse_equations(
            "dx/dt = (sound - x)/(2*ms) : 1\nsound = get_sample(t) + get_sample(t) : 1 (constant over dt)",
        )
        .unwrap();
        net.add_neuron_group(NeuronGroup::new("ear", 2, eqs)).unwrap();
        let sound = net.record("ear", Recordable::Variable("sound".into()), Selector::All);
        let mut sim = net.build().unwrap();

        let err = sim.run(0.1).unwrap_err();
        assert!(matches!(err, SimError::SignalExhausted { step: 6, .. }));
        assert_eq!(sim.phase(), RunPhase::Halted);
        // one draw per step even with two calls in two neurons
        assert_eq!(sim.signals().samples_drawn(0), 5);
        assert!(sim.run(0.1).is_err());

        let rec = sim.finish();
        assert_eq!(rec.len(), 5);
        assert_eq!(rec.state(sound).unwrap().trace(1).unwrap().to_vec(), vec![2.0; 5]);
    }

    #[test]
    fn test_nan_halts_simulation() {
        let mut net = Network::new(SimulationConfig { dt: 1e-3, seed: 1 });
        let eqs = parse_equations("dv/dt = 1/ms : 1").unwrap();
        net.add_neuron_group(
            NeuronGroup::new("g", 1, eqs).with_threshold("v > 2.5").with_reset("v = v/(v - v)"),
        )
        .unwrap();
        let v = net.record("g", Recordable::Variable("v".into()), Selector::All);
        let mut sim = net.build().unwrap();
        let err = sim.run(0.01).unwrap_err();
        match err {
            SimError::NonFinite { variable, step, .. } => assert_eq!((variable.as_str(), step), ("v", 3)),
            other => panic!("unexpected {:?}", other),
        }
        let rec = sim.finish();
        assert_eq!(rec.state(v).unwrap().trace(0).unwrap().to_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_refractory_in_network() {
        let mut net = Network::new(SimulationConfig { dt: 1e-3, seed: 1 });
        let group = NeuronGroup::new("g", 1, parse_equations("dx/dt = 1/ms : 1 (unless refractory)").unwrap())
            .with_threshold("x >= 1")
            .with_reset("x = 0")
            .with_refractory(RefractorySpec::Duration(Quantity::new(3.0, Unit::Millisecond)));
        net.add_neuron_group(group).unwrap();
        let spikes = net.record("g", Recordable::Spikes, Selector::All);
        let mut sim = net.build().unwrap();
        sim.run(0.012).unwrap();
        let rec = sim.finish();
        let train = rec.spikes(spikes).unwrap().train(0);
        // frozen until the period has elapsed, then one step to climb
        let steps: Vec<u64> = train.iter().map(|t| (t / 1e-3).round() as u64).collect();
        assert_eq!(steps, vec![1, 4, 7, 10]);
        assert!(train.windows(2).all(|w| w[1] - w[0] >= 3e-3 - 1e-12));
    }

    #[test]
    fn test_zero_duration() {
        let (net, _, _) = delay_network();
        let mut sim = net.build().unwrap();
        assert_eq!(sim.run(0.0).unwrap(), RunStatus::Finished { steps: 0 });
        assert!(sim.run(-1.0).is_err());
        assert!(sim.finish().is_empty());
    }
}
