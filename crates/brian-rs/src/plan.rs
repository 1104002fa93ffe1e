//! Typed, unit-checked evaluation plans.
//!
//! An [`Expr`] is compiled once against a [`Resolver`] (the naming scope of a group or
//! a synapse set) into a flat postfix [`Plan`]. Compilation resolves every identifier,
//! inlines plain subexpressions, checks dimensions and rejects what cannot be
//! evaluated in the given context. Evaluation is a tight loop over [`Op`]s.

use crate::expr::{BinaryOp, Expr};
use crate::signals::SignalBank;
use crate::{Result, SimError};
use spikesim_core::{Dimension, SiQuantity, Unit};

/// Where a loaded value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Variable of the group being evaluated
    Own(usize),
    /// Presynaptic group variable
    Pre(usize),
    /// Postsynaptic group variable
    Post(usize),
    /// Per-synapse variable
    Synapse(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Exp,
    Log,
    Sqrt,
    Abs,
    Sin,
    Cos,
    Min,
    Max,
    Clip,
}

impl Func {
    fn lookup(name: &str) -> Option<Func> {
        let f = match name {
            "exp" => Func::Exp,
            "log" => Func::Log,
            "sqrt" => Func::Sqrt,
            "abs" => Func::Abs,
            "sin" => Func::Sin,
            "cos" => Func::Cos,
            "min" => Func::Min,
            "max" => Func::Max,
            "clip" => Func::Clip,
            _ => return None,
        };
        Some(f)
    }

    fn arity(&self) -> usize {
        match self {
            Func::Min | Func::Max => 2,
            Func::Clip => 3,
            _ => 1,
        }
    }

    pub fn is_builtin(name: &str) -> bool {
        Func::lookup(name).is_some()
    }
}

/// One postfix operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Const(f64),
    Load(Slot),
    Time,
    Dt,
    Index,
    Count,
    Noise(usize),
    /// Pops the time argument, pushes the memoised sample
    Signal(usize),
    Neg,
    Not,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Call(Func),
}

/// Static type of a compiled expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number(Dimension),
    Bool,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::Number(d) => write!(f, "{}", d),
            ValueKind::Bool => write!(f, "boolean"),
        }
    }
}

/// What a name means in some scope
#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Variable { slot: Slot, dimension: Dimension },
    /// Subexpression substituted into every referencing plan
    Inline { expr: Expr, dimension: Dimension },
    Constant(SiQuantity),
    Time,
    Dt,
    Index,
    Count,
    Noise(usize),
}

/// Naming scope used while compiling
pub trait Resolver {
    fn resolve(&self, name: &str) -> Option<Symbol>;

    /// Registered external function
    fn signal(&self, name: &str) -> Option<usize>;

    /// Human-readable location for error messages
    fn context(&self) -> String;
}

/// Names every scope understands: units, `inf`, `pi`
pub fn builtin_constant(name: &str) -> Option<SiQuantity> {
    match name {
        "inf" => return Some(SiQuantity::dimensionless(f64::INFINITY)),
        "pi" => return Some(SiQuantity::dimensionless(std::f64::consts::PI)),
        _ => {}
    }
    Unit::ALL
        .iter()
        .filter(|u| **u != Unit::Dimensionless)
        .find(|u| u.symbol() == name)
        .map(|u| SiQuantity::new(u.to_si_factor(), u.dimension()))
}

/// Noise symbols are `xi` and `xi_<suffix>`
pub fn is_noise_name(name: &str) -> bool {
    name == "xi" || name.starts_with("xi_")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub allow_noise: bool,
    pub allow_signals: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    ops: Vec<Op>,
    kind: ValueKind,
}

impl Plan {
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn uses_signals(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::Signal(_)))
    }

    pub fn eval<F: Frame + ?Sized>(&self, frame: &F, ctx: &mut EvalContext<'_>) -> Result<f64> {
        let stack = &mut ctx.stack;
        stack.clear();
        for op in &self.ops {
            let value = match *op {
                Op::Const(v) => v,
                Op::Load(slot) => frame.load(slot),
                Op::Time => ctx.t,
                Op::Dt => ctx.dt,
                Op::Index => frame.index(),
                Op::Count => frame.count(),
                Op::Noise(id) => ctx.noise.get(id).copied().unwrap_or(0.0),
                Op::Signal(id) => {
                    let at = pop(stack);
                    ctx.signals.sample(id, ctx.step, at)?
                }
                Op::Neg => -pop(stack),
                Op::Not => truth(pop(stack) == 0.0),
                Op::Call(func) => apply(func, stack),
                binary => {
                    let b = pop(stack);
                    let a = pop(stack);
                    match binary {
                        Op::Add => a + b,
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        Op::Div => a / b,
                        Op::Pow => a.powf(b),
                        Op::Lt => truth(a < b),
                        Op::Le => truth(a <= b),
                        Op::Gt => truth(a > b),
                        Op::Ge => truth(a >= b),
                        Op::Eq => truth(a == b),
                        Op::Ne => truth(a != b),
                        Op::And => truth(a != 0.0 && b != 0.0),
                        Op::Or => truth(a != 0.0 || b != 0.0),
                        _ => f64::NAN,
                    }
                }
            };
            stack.push(value);
        }
        Ok(pop(stack))
    }

    pub fn eval_bool<F: Frame + ?Sized>(&self, frame: &F, ctx: &mut EvalContext<'_>) -> Result<bool> {
        Ok(self.eval(frame, ctx)? != 0.0)
    }
}

fn truth(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn pop(stack: &mut Vec<f64>) -> f64 {
    // plans are balanced by construction
    stack.pop().unwrap_or(f64::NAN)
}

fn apply(func: Func, stack: &mut Vec<f64>) -> f64 {
    match func {
        Func::Exp => pop(stack).exp(),
        Func::Log => pop(stack).ln(),
        Func::Sqrt => pop(stack).sqrt(),
        Func::Abs => pop(stack).abs(),
        Func::Sin => pop(stack).sin(),
        Func::Cos => pop(stack).cos(),
        Func::Min => {
            let b = pop(stack);
            let a = pop(stack);
            a.min(b)
        }
        Func::Max => {
            let b = pop(stack);
            let a = pop(stack);
            a.max(b)
        }
        Func::Clip => {
            let hi = pop(stack);
            let lo = pop(stack);
            let x = pop(stack);
            // NaN passes through so the finiteness check still sees it
            if x < lo {
                lo
            } else if x > hi {
                hi
            } else {
                x
            }
        }
    }
}

// ============================================================================
// EVALUATION CONTEXT
// ============================================================================

/// Source of variable values for one evaluation
pub trait Frame {
    fn load(&self, slot: Slot) -> f64;

    /// Neuron index `i`
    fn index(&self) -> f64 {
        0.0
    }

    /// Group size `N`
    fn count(&self) -> f64 {
        0.0
    }
}

/// Per-step evaluation state shared by all plans of a phase
pub struct EvalContext<'a> {
    pub t: f64,
    pub dt: f64,
    pub step: u64,
    pub signals: &'a mut SignalBank,
    /// Noise values of the neuron being evaluated, by noise id
    pub noise: Vec<f64>,
    stack: Vec<f64>,
}

impl<'a> EvalContext<'a> {
    pub fn new(t: f64, dt: f64, step: u64, signals: &'a mut SignalBank) -> Self {
        Self {
            t,
            dt,
            step,
            signals,
            noise: Vec::new(),
            stack: Vec::with_capacity(16),
        }
    }
}

/// Frame shadowing `slots[k]` with `values[k]`, used to read off affine coefficients
pub struct Override<'a, F: ?Sized> {
    pub inner: &'a F,
    pub slots: &'a [Slot],
    pub values: &'a [f64],
}

impl<F: Frame + ?Sized> Frame for Override<'_, F> {
    fn load(&self, slot: Slot) -> f64 {
        match self.slots.iter().position(|&s| s == slot) {
            Some(k) => self.values[k],
            None => self.inner.load(slot),
        }
    }

    fn index(&self) -> f64 {
        self.inner.index()
    }

    fn count(&self) -> f64 {
        self.inner.count()
    }
}

// ============================================================================
// COMPILER
// ============================================================================

pub fn compile<R: Resolver + ?Sized>(expr: &Expr, resolver: &R, options: CompileOptions) -> Result<Plan> {
    let mut compiler = Compiler {
        resolver,
        options,
        inlining: Vec::new(),
        ops: Vec::new(),
    };
    let kind = compiler.emit(expr)?;
    Ok(Plan { ops: compiler.ops, kind })
}

/// Compile and require a number of the given dimension
pub fn compile_number<R: Resolver + ?Sized>(
    expr: &Expr,
    resolver: &R,
    options: CompileOptions,
    expected: Dimension,
    what: &str,
) -> Result<Plan> {
    let plan = compile(expr, resolver, options)?;
    if plan.kind != ValueKind::Number(expected) {
        return Err(unit_error(resolver, what, ValueKind::Number(expected), plan.kind));
    }
    Ok(plan)
}

/// Compile and require a boolean
pub fn compile_condition<R: Resolver + ?Sized>(
    expr: &Expr,
    resolver: &R,
    options: CompileOptions,
    what: &str,
) -> Result<Plan> {
    let plan = compile(expr, resolver, options)?;
    if plan.kind != ValueKind::Bool {
        return Err(unit_error(resolver, what, ValueKind::Bool, plan.kind));
    }
    Ok(plan)
}

fn unit_error<R: Resolver + ?Sized>(resolver: &R, what: &str, expected: ValueKind, got: ValueKind) -> SimError {
    SimError::UnitError {
        context: format!("{} of {}", what, resolver.context()),
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

struct Compiler<'a, R: ?Sized> {
    resolver: &'a R,
    options: CompileOptions,
    inlining: Vec<String>,
    ops: Vec<Op>,
}

impl<R: Resolver + ?Sized> Compiler<'_, R> {
    fn number(&self, kind: ValueKind, what: &str) -> Result<Dimension> {
        match kind {
            ValueKind::Number(d) => Ok(d),
            ValueKind::Bool => Err(SimError::UnitError {
                context: format!("operand of '{}' in {}", what, self.resolver.context()),
                expected: "number".into(),
                got: "boolean".into(),
            }),
        }
    }

    fn same(&self, lhs: Dimension, rhs: Dimension, what: &str) -> Result<Dimension> {
        if lhs != rhs {
            return Err(SimError::UnitError {
                context: format!("operands of '{}' in {}", what, self.resolver.context()),
                expected: lhs.to_string(),
                got: rhs.to_string(),
            });
        }
        Ok(lhs)
    }

    fn boolean(&self, kind: ValueKind, what: &str) -> Result<()> {
        if kind != ValueKind::Bool {
            return Err(SimError::UnitError {
                context: format!("operand of '{}' in {}", what, self.resolver.context()),
                expected: "boolean".into(),
                got: kind.to_string(),
            });
        }
        Ok(())
    }

    fn emit(&mut self, expr: &Expr) -> Result<ValueKind> {
        match expr {
            Expr::Number(v) => {
                self.ops.push(Op::Const(*v));
                Ok(ValueKind::Number(Dimension::DIMENSIONLESS))
            }
            Expr::Name(name) => self.emit_name(name),
            Expr::Neg(inner) => {
                let kind = self.emit(inner)?;
                let d = self.number(kind, "-")?;
                self.ops.push(Op::Neg);
                Ok(ValueKind::Number(d))
            }
            Expr::Not(inner) => {
                let kind = self.emit(inner)?;
                self.boolean(kind, "not")?;
                self.ops.push(Op::Not);
                Ok(ValueKind::Bool)
            }
            Expr::Binary(op, lhs, rhs) => self.emit_binary(*op, lhs, rhs),
            Expr::Call(name, args) => self.emit_call(name, args),
        }
    }

    fn emit_name(&mut self, name: &str) -> Result<ValueKind> {
        let symbol = self.resolver.resolve(name).ok_or_else(|| SimError::UnknownIdentifier {
            name: name.to_string(),
            context: self.resolver.context(),
        })?;
        let kind = match symbol {
            Symbol::Variable { slot, dimension } => {
                self.ops.push(Op::Load(slot));
                ValueKind::Number(dimension)
            }
            Symbol::Constant(q) => {
                self.ops.push(Op::Const(q.value));
                ValueKind::Number(q.dimension)
            }
            Symbol::Time => {
                self.ops.push(Op::Time);
                ValueKind::Number(Dimension::TIME)
            }
            Symbol::Dt => {
                self.ops.push(Op::Dt);
                ValueKind::Number(Dimension::TIME)
            }
            Symbol::Index => {
                self.ops.push(Op::Index);
                ValueKind::Number(Dimension::DIMENSIONLESS)
            }
            Symbol::Count => {
                self.ops.push(Op::Count);
                ValueKind::Number(Dimension::DIMENSIONLESS)
            }
            Symbol::Noise(id) => {
                if !self.options.allow_noise {
                    return Err(SimError::EquationError(format!(
                        "noise term '{}' is only allowed in differential equations ({})",
                        name,
                        self.resolver.context()
                    )));
                }
                self.ops.push(Op::Noise(id));
                ValueKind::Number(Dimension::NOISE)
            }
            Symbol::Inline { expr, dimension } => {
                if self.inlining.iter().any(|n| n == name) {
                    return Err(SimError::EquationError(format!(
                        "cyclic subexpression: {} -> {} ({})",
                        self.inlining.join(" -> "),
                        name,
                        self.resolver.context()
                    )));
                }
                self.inlining.push(name.to_string());
                let kind = self.emit(&expr)?;
                self.inlining.pop();
                if kind != ValueKind::Number(dimension) {
                    return Err(SimError::UnitError {
                        context: format!("subexpression '{}' of {}", name, self.resolver.context()),
                        expected: dimension.to_string(),
                        got: kind.to_string(),
                    });
                }
                kind
            }
        };
        Ok(kind)
    }

    fn emit_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<ValueKind> {
        let left = self.emit(lhs)?;
        let right = self.emit(rhs)?;
        let (kind, code) = match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let symbol = if op == BinaryOp::Add { "+" } else { "-" };
                let l = self.number(left, symbol)?;
                let r = self.number(right, symbol)?;
                let d = self.same(l, r, symbol)?;
                let code = if op == BinaryOp::Add { Op::Add } else { Op::Sub };
                (ValueKind::Number(d), code)
            }
            BinaryOp::Mul => {
                let d = self.number(left, "*")? * self.number(right, "*")?;
                (ValueKind::Number(d), Op::Mul)
            }
            BinaryOp::Div => {
                let d = self.number(left, "/")? / self.number(right, "/")?;
                (ValueKind::Number(d), Op::Div)
            }
            BinaryOp::Pow => {
                let base = self.number(left, "**")?;
                let exponent = self.number(right, "**")?;
                if !exponent.is_dimensionless() {
                    return Err(SimError::UnitError {
                        context: format!("exponent in {}", self.resolver.context()),
                        expected: Dimension::DIMENSIONLESS.to_string(),
                        got: exponent.to_string(),
                    });
                }
                let d = if base.is_dimensionless() {
                    base
                } else {
                    let power = const_value(rhs, self.resolver).ok_or_else(|| {
                        SimError::EquationError(format!(
                            "exponent of a dimensioned base must be a constant ({})",
                            self.resolver.context()
                        ))
                    })?;
                    base.powf(power).ok_or_else(|| SimError::UnitError {
                        context: format!("power in {}", self.resolver.context()),
                        expected: "half-integer dimension".into(),
                        got: format!("({})**{}", base, power),
                    })?
                };
                (ValueKind::Number(d), Op::Pow)
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Eq | BinaryOp::Ne => {
                let (code, symbol) = match op {
                    BinaryOp::Lt => (Op::Lt, "<"),
                    BinaryOp::Le => (Op::Le, "<="),
                    BinaryOp::Gt => (Op::Gt, ">"),
                    BinaryOp::Ge => (Op::Ge, ">="),
                    BinaryOp::Eq => (Op::Eq, "=="),
                    _ => (Op::Ne, "!="),
                };
                let l = self.number(left, symbol)?;
                let r = self.number(right, symbol)?;
                self.same(l, r, symbol)?;
                (ValueKind::Bool, code)
            }
            BinaryOp::And | BinaryOp::Or => {
                let (code, symbol) = if op == BinaryOp::And { (Op::And, "and") } else { (Op::Or, "or") };
                self.boolean(left, symbol)?;
                self.boolean(right, symbol)?;
                (ValueKind::Bool, code)
            }
        };
        self.ops.push(code);
        Ok(kind)
    }

    fn emit_call(&mut self, name: &str, args: &[Expr]) -> Result<ValueKind> {
        if let Some(func) = Func::lookup(name) {
            if args.len() != func.arity() {
                return Err(SimError::EquationError(format!(
                    "{}() takes {} argument(s), got {} ({})",
                    name,
                    func.arity(),
                    args.len(),
                    self.resolver.context()
                )));
            }
            let mut dims = Vec::with_capacity(args.len());
            for arg in args {
                let kind = self.emit(arg)?;
                dims.push(self.number(kind, name)?);
            }
            let result = match func {
                Func::Exp | Func::Log | Func::Sin | Func::Cos => {
                    self.same(Dimension::DIMENSIONLESS, dims[0], name)?
                }
                Func::Abs => dims[0],
                Func::Sqrt => dims[0].sqrt().ok_or_else(|| SimError::UnitError {
                    context: format!("sqrt in {}", self.resolver.context()),
                    expected: "half-integer dimension".into(),
                    got: format!("sqrt({})", dims[0]),
                })?,
                Func::Min | Func::Max => self.same(dims[0], dims[1], name)?,
                Func::Clip => {
                    self.same(dims[0], dims[1], name)?;
                    self.same(dims[0], dims[2], name)?
                }
            };
            self.ops.push(Op::Call(func));
            return Ok(ValueKind::Number(result));
        }

        let id = self.resolver.signal(name).ok_or_else(|| SimError::UnknownIdentifier {
            name: format!("{}()", name),
            context: self.resolver.context(),
        })?;
        if !self.options.allow_signals {
            return Err(SimError::ConfigError(format!(
                "external function {}() cannot be used in {}",
                name,
                self.resolver.context()
            )));
        }
        if args.len() != 1 {
            return Err(SimError::EquationError(format!(
                "{}() takes the time as its single argument ({})",
                name,
                self.resolver.context()
            )));
        }
        let kind = self.emit(&args[0])?;
        let d = self.number(kind, name)?;
        self.same(Dimension::TIME, d, name)?;
        self.ops.push(Op::Signal(id));
        Ok(ValueKind::Number(Dimension::DIMENSIONLESS))
    }
}

/// Fold an expression made only of numbers and dimensionless constants
pub fn const_value<R: Resolver + ?Sized>(expr: &Expr, resolver: &R) -> Option<f64> {
    match expr {
        Expr::Number(v) => Some(*v),
        Expr::Neg(inner) => const_value(inner, resolver).map(|v| -v),
        Expr::Name(name) => match resolver.resolve(name)? {
            Symbol::Constant(q) if q.dimension.is_dimensionless() => Some(q.value),
            _ => None,
        },
        Expr::Binary(op, lhs, rhs) => {
            let a = const_value(lhs, resolver)?;
            let b = const_value(rhs, resolver)?;
            match op {
                BinaryOp::Add => Some(a + b),
                BinaryOp::Sub => Some(a - b),
                BinaryOp::Mul => Some(a * b),
                BinaryOp::Div => Some(a / b),
                BinaryOp::Pow => Some(a.powf(b)),
                _ => None,
            }
        }
        _ => None,
    }
}

// ============================================================================
// STRUCTURAL ANALYSIS
// ============================================================================

/// Polynomial degree of `expr` in the symbols matched by `is_target`, capped at 2.
///
/// Anything non-polynomial in a target (division by it, a function of it, a
/// comparison) counts as 2. Call only on expressions that compiled, so inlined
/// subexpressions are known to be acyclic.
pub fn degree<R: Resolver + ?Sized>(expr: &Expr, resolver: &R, is_target: &dyn Fn(&Symbol) -> bool) -> u8 {
    let d = |e: &Expr| degree(e, resolver, is_target);
    match expr {
        Expr::Number(_) => 0,
        Expr::Name(name) => match resolver.resolve(name) {
            Some(Symbol::Inline { expr, .. }) => d(&expr),
            Some(symbol) if is_target(&symbol) => 1,
            _ => 0,
        },
        Expr::Neg(inner) => d(inner),
        Expr::Not(inner) => nonlinear_if(d(inner)),
        Expr::Binary(op, lhs, rhs) => {
            let (a, b) = (d(lhs), d(rhs));
            match op {
                BinaryOp::Add | BinaryOp::Sub => a.max(b),
                BinaryOp::Mul => (a + b).min(2),
                BinaryOp::Div => {
                    if b > 0 {
                        2
                    } else {
                        a
                    }
                }
                BinaryOp::Pow => {
                    if a == 0 && b == 0 {
                        0
                    } else if b == 0 && const_value(rhs, resolver) == Some(1.0) {
                        a
                    } else {
                        2
                    }
                }
                _ => nonlinear_if(a.max(b)),
            }
        }
        Expr::Call(_, args) => nonlinear_if(args.iter().map(d).max().unwrap_or(0)),
    }
}

fn nonlinear_if(d: u8) -> u8 {
    if d > 0 {
        2
    } else {
        0
    }
}
