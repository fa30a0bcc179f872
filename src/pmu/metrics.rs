#![allow(missing_docs)]

use crate::{Error, Result};
use lazy_static::lazy_static;
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::*;
use std::collections::HashMap;

/// Helper struct to parse metric expressions.
#[derive(Parser)]
#[grammar = "pmu/metric_parser.pest"]
struct MetricExprParser;

lazy_static! {
    /// `PrattParser` used internally to parse a metric's expression.
    static ref PRATT: PrattParser<Rule> = {
        PrattParser::new()
            .op(Op::infix(Rule::or, Assoc::Left))
            .op(Op::infix(Rule::and, Assoc::Left))
            .op(Op::infix(Rule::eq, Assoc::Left) | Op::infix(Rule::ne, Assoc::Left))
            .op(Op::infix(Rule::gt, Assoc::Left)
                | Op::infix(Rule::ge, Assoc::Left)
                | Op::infix(Rule::lt, Assoc::Left)
                | Op::infix(Rule::le, Assoc::Left))
            .op(Op::infix(Rule::add, Assoc::Left) | Op::infix(Rule::sub, Assoc::Left))
            .op(Op::infix(Rule::mul, Assoc::Left) | Op::infix(Rule::div, Assoc::Left))
            .op(Op::prefix(Rule::neg) | Op::prefix(Rule::not))
    };
}

/// Result of evaluating a `MetricExpr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// A number.
    Num(f64),
    /// A boolean, produced by comparisons and logical operators.
    Bool(bool),
}

impl Value {
    /// Get the number held by the value.
    pub fn as_num(self) -> Result<f64> {
        match self {
            Value::Num(x) => Ok(x),
            Value::Bool(b) => Err(Error::TypeMismatch(format!(
                "expected a number, found {}",
                b
            ))),
        }
    }

    /// Get the boolean held by the value.
    pub fn as_bool(self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(b),
            Value::Num(x) => Err(Error::TypeMismatch(format!(
                "expected a boolean, found {}",
                x
            ))),
        }
    }
}

/// Parsed (sub)expression of a metric formula.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricExpr {
    /// A constant number.
    Num(f64),
    /// A constant boolean.
    Bool(bool),
    /// A bracketed variable, stored without the brackets.
    Var(String),
    /// Arithmetic negation.
    Neg(Box<MetricExpr>),
    /// Logical negation.
    Not(Box<MetricExpr>),
    /// Addition operator.
    Add(Box<MetricExpr>, Box<MetricExpr>),
    /// Subtraction operator.
    Sub(Box<MetricExpr>, Box<MetricExpr>),
    /// Multiplication operator.
    Mul(Box<MetricExpr>, Box<MetricExpr>),
    /// Division operator.
    Div(Box<MetricExpr>, Box<MetricExpr>),
    /// Equality.
    Eq(Box<MetricExpr>, Box<MetricExpr>),
    /// Inequality.
    Ne(Box<MetricExpr>, Box<MetricExpr>),
    /// Greater than.
    Gt(Box<MetricExpr>, Box<MetricExpr>),
    /// Greater than or equal.
    Ge(Box<MetricExpr>, Box<MetricExpr>),
    /// Less than.
    Lt(Box<MetricExpr>, Box<MetricExpr>),
    /// Less than or equal.
    Le(Box<MetricExpr>, Box<MetricExpr>),
    /// Logical and.
    And(Box<MetricExpr>, Box<MetricExpr>),
    /// Logical or.
    Or(Box<MetricExpr>, Box<MetricExpr>),
    /// Ternary `cond ? a : b` block.
    If(Box<MetricExpr>, Box<MetricExpr>, Box<MetricExpr>),
    /// Min block
    Min(Vec<MetricExpr>),
    /// Max block
    Max(Vec<MetricExpr>),
}

impl MetricExpr {
    /// Create a new `MetricExpr` from a supplied `&str`.
    pub fn parse_str(input: &str) -> Result<MetricExpr> {
        let mut metric = MetricExprParser::parse(Rule::metric, input)?;
        let ternary = metric
            .next()
            .and_then(|m| m.into_inner().next())
            .ok_or_else(|| Error::TypeMismatch(format!("empty expression: {}", input)))?;
        MetricExpr::_to_ternary(ternary)
    }

    /// Transform a `ternary` pair into a `MetricExpr`.
    fn _to_ternary(pair: Pair<Rule>) -> Result<MetricExpr> {
        let parts: Vec<Pair<Rule>> = pair.into_inner().collect();
        match parts.as_slice() {
            [e] => MetricExpr::_to_expr(e.clone().into_inner()),
            [c, a, b] => Ok(MetricExpr::If(
                Box::new(MetricExpr::_to_expr(c.clone().into_inner())?),
                Box::new(MetricExpr::_to_ternary(a.clone())?),
                Box::new(MetricExpr::_to_ternary(b.clone())?),
            )),
            _ => unreachable!(),
        }
    }

    /// Recursive call to transform `Pair` objects into `MetricExpr`s.
    fn _to_expr(expr: Pairs<Rule>) -> Result<MetricExpr> {
        PRATT
            .map_primary(MetricExpr::_to_primary)
            .map_prefix(|op, rhs| match op.as_rule() {
                Rule::neg => Ok(MetricExpr::Neg(Box::new(rhs?))),
                Rule::not => Ok(MetricExpr::Not(Box::new(rhs?))),
                _ => unreachable!(),
            })
            .map_infix(|lhs, op, rhs| {
                let (lhs, rhs) = (Box::new(lhs?), Box::new(rhs?));
                Ok(match op.as_rule() {
                    Rule::add => MetricExpr::Add(lhs, rhs),
                    Rule::sub => MetricExpr::Sub(lhs, rhs),
                    Rule::mul => MetricExpr::Mul(lhs, rhs),
                    Rule::div => MetricExpr::Div(lhs, rhs),
                    Rule::eq => MetricExpr::Eq(lhs, rhs),
                    Rule::ne => MetricExpr::Ne(lhs, rhs),
                    Rule::gt => MetricExpr::Gt(lhs, rhs),
                    Rule::ge => MetricExpr::Ge(lhs, rhs),
                    Rule::lt => MetricExpr::Lt(lhs, rhs),
                    Rule::le => MetricExpr::Le(lhs, rhs),
                    Rule::and => MetricExpr::And(lhs, rhs),
                    Rule::or => MetricExpr::Or(lhs, rhs),
                    _ => unreachable!(),
                })
            })
            .parse(expr)
    }

    /// Transform an operand into a `MetricExpr`.
    fn _to_primary(pair: Pair<Rule>) -> Result<MetricExpr> {
        match pair.as_rule() {
            Rule::num => Ok(MetricExpr::Num(pair.as_str().parse()?)),
            Rule::var => {
                let s = pair.as_str();
                Ok(MetricExpr::Var(s[1..s.len() - 1].to_string()))
            }
            Rule::boolean => Ok(MetricExpr::Bool(pair.as_str() == "true")),
            Rule::call => {
                let mut inner = pair.into_inner();
                let name = inner.next().map(|p| p.as_str()).unwrap_or_default();
                let args = inner
                    .map(MetricExpr::_to_ternary)
                    .collect::<Result<Vec<MetricExpr>>>()?;
                match name {
                    "min" => Ok(MetricExpr::Min(args)),
                    "max" => Ok(MetricExpr::Max(args)),
                    _ => Err(Error::UnknownFunction(name.to_string())),
                }
            }
            Rule::ternary => MetricExpr::_to_ternary(pair),
            _ => unreachable!(),
        }
    }

    /// Get names of all counters used in this expression.
    pub fn get_counters(&self) -> Vec<&String> {
        macro_rules! body {
            ($($a:expr),*) => {{
                let mut tmp = vec![];
                $(tmp.extend($a.get_counters());)*
                tmp
            }};
        }
        match self {
            MetricExpr::Var(ref x) => vec![x],
            MetricExpr::Num(_) | MetricExpr::Bool(_) => vec![],
            MetricExpr::Neg(ref a) | MetricExpr::Not(ref a) => a.get_counters(),
            MetricExpr::Add(ref a, ref b)
            | MetricExpr::Sub(ref a, ref b)
            | MetricExpr::Mul(ref a, ref b)
            | MetricExpr::Div(ref a, ref b)
            | MetricExpr::Eq(ref a, ref b)
            | MetricExpr::Ne(ref a, ref b)
            | MetricExpr::Gt(ref a, ref b)
            | MetricExpr::Ge(ref a, ref b)
            | MetricExpr::Lt(ref a, ref b)
            | MetricExpr::Le(ref a, ref b)
            | MetricExpr::And(ref a, ref b)
            | MetricExpr::Or(ref a, ref b) => body!(a, b),
            MetricExpr::If(ref c, ref a, ref b) => body!(c, a, b),
            MetricExpr::Min(ref args) | MetricExpr::Max(ref args) => {
                args.iter().flat_map(|a| a.get_counters()).collect()
            }
        }
    }

    /// Evaluate the expression with values for its variables.
    ///
    /// Logical operators and the ternary short-circuit, so untaken branches never fault.
    pub fn eval(&self, vars: &HashMap<String, f64>) -> Result<Value> {
        let num = |e: &MetricExpr| e.eval(vars).and_then(Value::as_num);
        let boolean = |e: &MetricExpr| e.eval(vars).and_then(Value::as_bool);
        Ok(match self {
            MetricExpr::Num(x) => Value::Num(*x),
            MetricExpr::Bool(b) => Value::Bool(*b),
            MetricExpr::Var(name) => match vars.get(name) {
                Some(x) => Value::Num(*x),
                None => return Err(Error::UnknownVariable(name.clone())),
            },
            MetricExpr::Neg(a) => Value::Num(-num(a)?),
            MetricExpr::Not(a) => Value::Bool(!boolean(a)?),
            MetricExpr::Add(a, b) => Value::Num(num(a)? + num(b)?),
            MetricExpr::Sub(a, b) => Value::Num(num(a)? - num(b)?),
            MetricExpr::Mul(a, b) => Value::Num(num(a)? * num(b)?),
            MetricExpr::Div(a, b) => Value::Num(num(a)? / num(b)?),
            MetricExpr::Eq(a, b) => Value::Bool(a.eval(vars)? == b.eval(vars)?),
            MetricExpr::Ne(a, b) => Value::Bool(a.eval(vars)? != b.eval(vars)?),
            MetricExpr::Gt(a, b) => Value::Bool(num(a)? > num(b)?),
            MetricExpr::Ge(a, b) => Value::Bool(num(a)? >= num(b)?),
            MetricExpr::Lt(a, b) => Value::Bool(num(a)? < num(b)?),
            MetricExpr::Le(a, b) => Value::Bool(num(a)? <= num(b)?),
            MetricExpr::And(a, b) => Value::Bool(boolean(a)? && boolean(b)?),
            MetricExpr::Or(a, b) => Value::Bool(boolean(a)? || boolean(b)?),
            MetricExpr::If(c, a, b) => {
                if boolean(c)? {
                    a.eval(vars)?
                } else {
                    b.eval(vars)?
                }
            }
            MetricExpr::Min(args) => Value::Num(MetricExpr::_fold(args, vars, f64::min)?),
            MetricExpr::Max(args) => Value::Num(MetricExpr::_fold(args, vars, f64::max)?),
        })
    }

    /// Reduce the numeric values of `args` with `f`.
    fn _fold(
        args: &[MetricExpr],
        vars: &HashMap<String, f64>,
        f: fn(f64, f64) -> f64,
    ) -> Result<f64> {
        let mut acc: Option<f64> = None;
        for arg in args {
            let x = arg.eval(vars)?.as_num()?;
            acc = Some(acc.map_or(x, |a| f(a, x)));
        }
        acc.ok_or_else(|| Error::TypeMismatch(String::from("min/max called without arguments")))
    }
}
