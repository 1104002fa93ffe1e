//! Textual model syntax: expressions, statements and equation blocks.
//!
//! Parsing produces a small AST. Nothing here knows about variables or units
//! beyond their names; resolution and unit checking happen in [`crate::plan`].

use crate::{Result, SimError};
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use spikesim_core::{Dimension, Unit};

/// Grammar for expressions, reset/on_pre statements and equation blocks
#[derive(Parser)]
#[grammar_inline = r##"
WHITESPACE = _{ " " | "\t" }
COMMENT = _{ "#" ~ (!NEWLINE ~ ANY)* }

number = @{
    (ASCII_DIGIT+ ~ ("." ~ ASCII_DIGIT*)? | "." ~ ASCII_DIGIT+)
    ~ (("e" | "E") ~ ("+" | "-")? ~ ASCII_DIGIT+)?
}
identifier = @{ (ASCII_ALPHA | "_") ~ (ASCII_ALPHANUMERIC | "_")* }

kw_and = @{ "and" ~ !(ASCII_ALPHANUMERIC | "_") }
kw_or = @{ "or" ~ !(ASCII_ALPHANUMERIC | "_") }
kw_not = @{ "not" ~ !(ASCII_ALPHANUMERIC | "_") }

cmp_op = @{ "<=" | ">=" | "==" | "!=" | "<" | ">" }
add_op = @{ "+" | "-" }
mul_op = @{ "*" ~ !"*" | "/" }
pow_op = @{ "**" }
neg_op = @{ "-" | "+" }

expr = { disjunction }
disjunction = { conjunction ~ (kw_or ~ conjunction)* }
conjunction = { negation ~ (kw_and ~ negation)* }
negation = { kw_not ~ negation | comparison }
comparison = { sum ~ (cmp_op ~ sum)? }
sum = { product ~ (add_op ~ product)* }
product = { unary ~ (mul_op ~ unary)* }
unary = { neg_op ~ unary | power }
power = { primary ~ (pow_op ~ unary)? }
primary = _{ number | call | identifier | "(" ~ expr ~ ")" }
call = { identifier ~ "(" ~ (expr ~ ("," ~ expr)*)? ~ ")" }

expression = { SOI ~ expr ~ EOI }

assign_op = @{ "+=" | "-=" | "*=" | "/=" | "=" }
statement = { identifier ~ assign_op ~ expr }
separator = _{ ";" | NEWLINE }
statements = { SOI ~ separator* ~ (statement ~ (separator+ ~ statement)* ~ separator*)? ~ EOI }

signed_int = @{ "-"? ~ ASCII_DIGIT+ }
unit_one = @{ "1" }
unit_factor = { (unit_one | identifier) ~ (pow_op ~ signed_int)? }
unit_spec = { unit_factor ~ (mul_op ~ unit_factor)* }

flag_unless_refractory = { "unless" ~ "refractory" }
flag_constant_over_dt = { "constant" ~ "over" ~ "dt" }
flag_constant = { "constant" }
flag = _{ flag_unless_refractory | flag_constant_over_dt | flag_constant }
flags = { "(" ~ flag ~ ("," ~ flag)* ~ ")" }

diff_lhs = ${ "d" ~ identifier ~ "/" ~ "dt" }
differential = { diff_lhs ~ "=" ~ expr ~ ":" ~ unit_spec ~ flags? }
subexpression = { identifier ~ "=" ~ expr ~ ":" ~ unit_spec ~ flags? }
parameter = { identifier ~ ":" ~ unit_spec ~ flags? }
equation = _{ differential | subexpression | parameter }
equations = { SOI ~ NEWLINE* ~ (equation ~ (NEWLINE+ ~ equation)* ~ NEWLINE*)? ~ EOI }
"##]
pub struct ModelParser;

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
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
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Name(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

impl Expr {
    /// Every identifier referenced, including inside calls (function names excluded)
    pub fn names(&self, out: &mut Vec<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Name(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) | Expr::Not(inner) => inner.names(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.names(out);
                rhs.names(out);
            }
            Expr::Call(_, args) => args.iter().for_each(|a| a.names(out)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

/// `target op value`, e.g. `th = th*2.5 + 0.01` or `v += 0.5`
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub target: String,
    pub op: AssignOp,
    pub value: Expr,
}

/// Flags in parentheses after an equation's unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EquationFlags {
    pub unless_refractory: bool,
    pub constant_over_dt: bool,
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EquationLine {
    Differential { variable: String, expression: String, dimension: Dimension, flags: EquationFlags },
    Subexpression { variable: String, expression: String, dimension: Dimension, flags: EquationFlags },
    Parameter { name: String, dimension: Dimension, flags: EquationFlags },
}

// ============================================================================
// PARSING
// ============================================================================

fn pest_error(what: &str, err: pest::error::Error<Rule>) -> SimError {
    SimError::ParseError(format!("{}: {}", what, err))
}

fn next_pair<'i>(pairs: &mut pest::iterators::Pairs<'i, Rule>, what: &str) -> Result<Pair<'i, Rule>> {
    pairs
        .next()
        .ok_or_else(|| SimError::ParseError(format!("truncated {}", what)))
}

/// Parse a single expression such as `x > th` or `1/freq_post`
pub fn parse_expression(text: &str) -> Result<Expr> {
    let mut pairs = ModelParser::parse(Rule::expression, text)
        .map_err(|e| pest_error("expression", e))?;
    let top = next_pair(&mut pairs, "expression")?;
    let inner = next_pair(&mut top.into_inner(), "expression")?;
    build_expr(inner)
}

/// Parse `;`- or newline-separated assignments
pub fn parse_statements(text: &str) -> Result<Vec<Statement>> {
    let mut pairs = ModelParser::parse(Rule::statements, text)
        .map_err(|e| pest_error("statements", e))?;
    let top = next_pair(&mut pairs, "statements")?;

    let mut out = Vec::new();
    for pair in top.into_inner() {
        if pair.as_rule() != Rule::statement {
            continue;
        }
        let mut inner = pair.into_inner();
        let target = next_pair(&mut inner, "statement")?.as_str().to_string();
        let op = match next_pair(&mut inner, "statement")?.as_str() {
            "=" => AssignOp::Set,
            "+=" => AssignOp::Add,
            "-=" => AssignOp::Sub,
            "*=" => AssignOp::Mul,
            "/=" => AssignOp::Div,
            other => return Err(SimError::ParseError(format!("unknown assignment '{}'", other))),
        };
        let value = build_expr(next_pair(&mut inner, "statement")?)?;
        out.push(Statement { target, op, value });
    }
    Ok(out)
}

/// Parse a Brian-style equation block into its lines
pub fn parse_equation_lines(text: &str) -> Result<Vec<EquationLine>> {
    let mut pairs = ModelParser::parse(Rule::equations, text)
        .map_err(|e| pest_error("equations", e))?;
    let top = next_pair(&mut pairs, "equations")?;

    let mut lines = Vec::new();
    for pair in top.into_inner() {
        let rule = pair.as_rule();
        if !matches!(rule, Rule::differential | Rule::subexpression | Rule::parameter) {
            continue;
        }
        let mut inner = pair.into_inner();
        let head = next_pair(&mut inner, "equation")?;
        let name = match rule {
            Rule::differential => next_pair(&mut head.into_inner(), "dX/dt")?.as_str().to_string(),
            _ => head.as_str().to_string(),
        };

        let mut expression = None;
        let mut dimension = Dimension::DIMENSIONLESS;
        let mut flags = EquationFlags::default();
        for part in inner {
            match part.as_rule() {
                Rule::expr => {
                    // validate now so errors point at the equation text
                    build_expr(part.clone())?;
                    expression = Some(part.as_str().trim().to_string());
                }
                Rule::unit_spec => dimension = build_unit_spec(part)?,
                Rule::flags => flags = build_flags(part),
                _ => {}
            }
        }

        let line = match rule {
            Rule::differential => EquationLine::Differential {
                variable: name,
                expression: expression.unwrap_or_default(),
                dimension,
                flags,
            },
            Rule::subexpression => EquationLine::Subexpression {
                variable: name,
                expression: expression.unwrap_or_default(),
                dimension,
                flags,
            },
            _ => EquationLine::Parameter { name, dimension, flags },
        };
        lines.push(line);
    }
    Ok(lines)
}

fn build_flags(pair: Pair<Rule>) -> EquationFlags {
    let mut flags = EquationFlags::default();
    for flag in pair.into_inner() {
        match flag.as_rule() {
            Rule::flag_unless_refractory => flags.unless_refractory = true,
            Rule::flag_constant_over_dt => flags.constant_over_dt = true,
            Rule::flag_constant => flags.constant = true,
            _ => {}
        }
    }
    flags
}

fn build_unit_spec(pair: Pair<Rule>) -> Result<Dimension> {
    let mut dimension = Dimension::DIMENSIONLESS;
    let mut dividing = false;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::mul_op => dividing = part.as_str() == "/",
            Rule::unit_factor => {
                let mut inner = part.into_inner();
                let base = next_pair(&mut inner, "unit")?;
                let unit = Unit::parse(base.as_str())?;
                let mut factor = unit.dimension();
                if let Some(exp) = inner.find(|p| p.as_rule() == Rule::signed_int) {
                    let power: i32 = exp
                        .as_str()
                        .parse()
                        .map_err(|_| SimError::ParseError(format!("bad unit power '{}'", exp.as_str())))?;
                    factor = factor.powf(power as f64).ok_or_else(|| {
                        SimError::ParseError(format!("unit power out of range: {}", power))
                    })?;
                }
                dimension = if dividing { dimension / factor } else { dimension * factor };
            }
            _ => {}
        }
    }
    Ok(dimension)
}

fn binary_op(text: &str) -> Result<BinaryOp> {
    let op = match text {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "**" => BinaryOp::Pow,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        other => return Err(SimError::ParseError(format!("unknown operator '{}'", other))),
    };
    Ok(op)
}

fn build_expr(pair: Pair<Rule>) -> Result<Expr> {
    match pair.as_rule() {
        Rule::expr => build_expr(next_pair(&mut pair.into_inner(), "expression")?),
        Rule::disjunction | Rule::conjunction | Rule::sum | Rule::product | Rule::comparison => {
            let mut inner = pair.into_inner();
            let mut lhs = build_expr(next_pair(&mut inner, "operand")?)?;
            while let Some(op) = inner.next() {
                let rhs = build_expr(next_pair(&mut inner, "operand")?)?;
                lhs = Expr::Binary(binary_op(op.as_str())?, Box::new(lhs), Box::new(rhs));
            }
            Ok(lhs)
        }
        Rule::negation => {
            let mut inner = pair.into_inner();
            let first = next_pair(&mut inner, "negation")?;
            if first.as_rule() == Rule::kw_not {
                Ok(Expr::Not(Box::new(build_expr(next_pair(&mut inner, "negation")?)?)))
            } else {
                build_expr(first)
            }
        }
        Rule::unary => {
            let mut inner = pair.into_inner();
            let first = next_pair(&mut inner, "unary")?;
            if first.as_rule() == Rule::neg_op {
                let operand = build_expr(next_pair(&mut inner, "unary")?)?;
                if first.as_str() == "-" {
                    Ok(Expr::Neg(Box::new(operand)))
                } else {
                    Ok(operand)
                }
            } else {
                build_expr(first)
            }
        }
        Rule::power => {
            let mut inner = pair.into_inner();
            let base = build_expr(next_pair(&mut inner, "power")?)?;
            match inner.next() {
                Some(_pow) => {
                    let exponent = build_expr(next_pair(&mut inner, "exponent")?)?;
                    Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)))
                }
                None => Ok(base),
            }
        }
        Rule::call => {
            let mut inner = pair.into_inner();
            let name = next_pair(&mut inner, "call")?.as_str().to_string();
            let args = inner.map(build_expr).collect::<Result<Vec<_>>>()?;
            Ok(Expr::Call(name, args))
        }
        Rule::number => pair
            .as_str()
            .parse::<f64>()
            .map(Expr::Number)
            .map_err(|_| SimError::ParseError(format!("bad number '{}'", pair.as_str()))),
        Rule::identifier => Ok(Expr::Name(pair.as_str().to_string())),
        other => Err(SimError::ParseError(format!("unexpected {:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Box<Expr> {
        Box::new(Expr::Name(s.into()))
    }

    #[test]
    fn test_threshold_expression() {
        let e = parse_expression("x>th").unwrap();
        assert_eq!(e, Expr::Binary(BinaryOp::Gt, name("x"), name("th")));
    }

    #[test]
    fn test_precedence() {
        // -a**2 == -(a**2), and * binds tighter than +
        let e = parse_expression("1 + -a**2 * b").unwrap();
        let expected = Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::Number(1.0)),
            Box::new(Expr::Binary(
                BinaryOp::Mul,
                Box::new(Expr::Neg(Box::new(Expr::Binary(
                    BinaryOp::Pow,
                    name("a"),
                    Box::new(Expr::Number(2.0)),
                )))),
                name("b"),
            )),
        );
        assert_eq!(e, expected);
    }

    #[test]
    fn test_noise_term() {
        let e = parse_expression("-v/tau+sigma*(2./tau)**.5*xi").unwrap();
        let mut names = Vec::new();
        e.names(&mut names);
        assert_eq!(names, vec!["v", "tau", "sigma", "xi"]);
    }

    #[test]
    fn test_logical_keywords() {
        let e = parse_expression("not a > 1 and notable < 2 or b").unwrap();
        match e {
            Expr::Binary(BinaryOp::Or, lhs, _) => match *lhs {
                Expr::Binary(BinaryOp::And, first, second) => {
                    assert!(matches!(*first, Expr::Not(_)));
                    assert_eq!(*second, Expr::Binary(BinaryOp::Lt, name("notable"), Box::new(Expr::Number(2.0))));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_call() {
        let e = parse_expression("clip(get_sample(t), 0, inf)").unwrap();
        match e {
            Expr::Call(f, args) => {
                assert_eq!(f, "clip");
                assert_eq!(args.len(), 3);
                assert_eq!(args[0], Expr::Call("get_sample".into(), vec![Expr::Name("t".into())]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scientific_numbers() {
        assert_eq!(parse_expression("1e-3").unwrap(), Expr::Number(1e-3));
        assert_eq!(parse_expression(".5").unwrap(), Expr::Number(0.5));
        assert_eq!(parse_expression("2.").unwrap(), Expr::Number(2.0));
    }

    #[test]
    fn test_bad_expression() {
        assert!(parse_expression("x >").is_err());
        assert!(parse_expression("a = b").is_err());
    }

    #[test]
    fn test_reset_statements() {
        let stmts = parse_statements("x=0; th = th*2.5 + 0.01").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].target, "x");
        assert_eq!(stmts[0].op, AssignOp::Set);
        assert_eq!(stmts[1].target, "th");

        let stmts = parse_statements("v += 0.5\nw -= 1").unwrap();
        assert_eq!(stmts[0].op, AssignOp::Add);
        assert_eq!(stmts[1].op, AssignOp::Sub);

        assert!(parse_statements("").unwrap().is_empty());

        let stmts = parse_statements("x = 0 # reset\n# then adapt\nth = 1").unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[1].target, "th");
    }

    #[test]
    fn test_equation_lines() {
        let text = r#"
            dx/dt = (sound - x)/tau_ear: 1 (unless refractory)
            dth/dt = (0.1*x - th)/tau_th : 1
            # sampled once per step
            sound = clip(get_sample(t), 0, inf) : 1 (constant over dt)
            freq : Hz (constant)
        "#;
        let lines = parse_equation_lines(text).unwrap();
        assert_eq!(lines.len(), 4);

        match &lines[0] {
            EquationLine::Differential { variable, expression, flags, .. } => {
                assert_eq!(variable, "x");
                assert_eq!(expression, "(sound - x)/tau_ear");
                assert!(flags.unless_refractory);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &lines[2] {
            EquationLine::Subexpression { variable, flags, .. } => {
                assert_eq!(variable, "sound");
                assert!(flags.constant_over_dt);
                assert!(!flags.constant);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &lines[3] {
            EquationLine::Parameter { name, dimension, flags } => {
                assert_eq!(name, "freq");
                assert_eq!(*dimension, Dimension::FREQUENCY);
                assert!(flags.constant);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_compound_units() {
        let lines = parse_equation_lines("dv/dt = a : volt/second\ng : siemens*ohm").unwrap();
        match &lines[0] {
            EquationLine::Differential { dimension, .. } => {
                assert_eq!(*dimension, Dimension::VOLTAGE / Dimension::TIME)
            }
            other => panic!("unexpected {:?}", other),
        }
        match &lines[1] {
            EquationLine::Parameter { dimension, .. } => assert!(dimension.is_dimensionless()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_unit() {
        assert!(parse_equation_lines("v : parsec").is_err());
    }
}
