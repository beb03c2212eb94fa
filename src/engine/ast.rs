//! Syntax tree of a rule program.

use crate::transport::Value;
use std::fmt;

/// Parsed program, before semantic checks
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceProgram {
    /// Statements in source order
    pub statements: Vec<Statement>,
}

/// Top-level statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// `materialize(name, ttl, size, keys(...)).`
    Materialize(Materialize),
    /// Standalone `periodic(@X, E, period, repeat, delay, jitter).`
    Periodic(Atom),
    /// `label head :- body.`
    Rule(Rule),
}

/// Finite amount or `infinity`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Finite amount
    Finite(u64),
    /// The `infinity` keyword
    Infinity,
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finite(n) => write!(f, "{n}"),
            Self::Infinity => f.write_str("infinity"),
        }
    }
}

/// Relation declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialize {
    /// Relation name
    pub name: String,
    /// Lifetime in time units
    pub ttl: Limit,
    /// Maximum row count
    pub size: Limit,
    /// 1-based key positions
    pub keys: Vec<usize>,
    /// Source line
    pub line: usize,
}

/// Argument of an atom
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// Named variable
    Var(String),
    /// `_`
    Wildcard,
    /// Literal or substituted constant
    Const(Value),
    /// `*`, the broadcast address
    Broadcast,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var(name) => f.write_str(name),
            Self::Wildcard => f.write_str("_"),
            Self::Const(value) => write!(f, "{value}"),
            Self::Broadcast => f.write_str("*"),
        }
    }
}

/// `pred(@loc, args...)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    /// Predicate name
    pub predicate: String,
    /// Location term (attribute 1)
    pub location: Term,
    /// Remaining attributes
    pub args: Vec<Term>,
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(@{}", self.predicate, self.location)?;
        for arg in &self.args {
            write!(f, ", {arg}")?;
        }
        f.write_str(")")
    }
}

/// Binary arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Literal or constant
    Const(Value),
    /// Variable reference
    Var(String),
    /// `-expr`
    Neg(Box<Expr>),
    /// `lhs op rhs`
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

impl Expr {
    /// Variables referenced by the expression
    pub fn variables(&self) -> Vec<&str> {
        match self {
            Self::Const(_) => Vec::new(),
            Self::Var(name) => vec![name.as_str()],
            Self::Neg(inner) => inner.variables(),
            Self::Binary(lhs, _, rhs) => {
                let mut vars = lhs.variables();
                vars.extend(rhs.variables());
                vars
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const(value) => write!(f, "{value}"),
            Self::Var(name) => f.write_str(name),
            Self::Neg(inner) => write!(f, "-{inner}"),
            Self::Binary(lhs, op, rhs) => {
                let op = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                };
                write!(f, "({lhs} {op} {rhs})")
            }
        }
    }
}

/// `Var := Expr`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Bound variable
    pub var: String,
    /// Value
    pub expr: Expr,
}

/// Derivation rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Label, or a generated `rule<N>` name
    pub name: String,
    /// Derived fact pattern
    pub head: Atom,
    /// Conjuncts, joined on shared variables
    pub body: Vec<Atom>,
    /// Evaluated in order once the conjuncts are bound
    pub assignments: Vec<Assignment>,
    /// Source line
    pub line: usize,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} :- ", self.name, self.head)?;
        let body = self
            .body
            .iter()
            .map(ToString::to_string)
            .chain(
                self.assignments
                    .iter()
                    .map(|a| format!("{} := {}", a.var, a.expr)),
            )
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{body}.")
    }
}
