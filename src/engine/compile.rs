//! Semantic checks that turn a parsed program into an executable one.
//!
//! Every problem is reported at load time: unbound head or assignment
//! variables, malformed periodic sources and invalid key declarations never
//! reach a running node.

use crate::engine::ast::{Atom, Limit, Rule, SourceProgram, Statement, Term};
use crate::store::{Capacity, Table, Ttl};
use crate::transport::{Address, Fact, NodeId, Value};
use crate::utils::CompileError;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

type CompileResult<T> = std::result::Result<T, CompileError>;

/// Predicate of timer-generated facts
pub const PERIODIC: &str = "periodic";

/// A relation to materialize, with limits in time units and rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDecl {
    /// Relation name
    pub name: String,
    /// Lifetime in time units; `None` keeps rows forever
    pub ttl: Option<u64>,
    /// Row limit; `None` is unbounded
    pub max_size: Option<usize>,
    /// 1-based key positions
    pub keys: Vec<usize>,
}

impl TableDecl {
    /// Empty table for this relation, with `time_unit` as the TTL unit
    pub fn table(&self, time_unit: Duration) -> Table {
        let ttl = match self.ttl {
            Some(units) => Ttl::Finite(to_duration(time_unit, units)),
            None => Ttl::Infinite,
        };
        let capacity = match self.max_size {
            Some(rows) => Capacity::Bounded(rows),
            None => Capacity::Unbounded,
        };
        Table::new(self.name.clone(), ttl, capacity, self.keys.clone())
    }
}

/// `units` time units of length `unit`, saturating
pub fn to_duration(unit: Duration, units: u64) -> Duration {
    u32::try_from(units)
        .ok()
        .and_then(|n| unit.checked_mul(n))
        .unwrap_or(Duration::MAX)
}

/// A per-node periodic event source, in time units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerSpec {
    /// Time between firings
    pub period: u64,
    /// Number of firings; 0 fires forever
    pub repeat: u64,
    /// Delay before the first firing
    pub initial_delay: u64,
    /// Exclusive upper bound of the per-firing random offset
    pub jitter: u64,
}

impl TimerSpec {
    /// The fact a firing hands to the rule engine
    pub fn trigger_fact(&self, node: &NodeId, seq: u64) -> Fact {
        Fact::new(
            PERIODIC,
            Address::Node(node.clone()),
            vec![
                Value::Int(seq as i64),
                Value::Int(self.period as i64),
                Value::Int(self.repeat as i64),
                Value::Int(self.initial_delay as i64),
                Value::Int(self.jitter as i64),
            ],
        )
    }
}

/// Executable program
#[derive(Debug, Clone, Default)]
pub struct Program {
    rules: Vec<Rule>,
    tables: Vec<TableDecl>,
    timers: Vec<TimerSpec>,
    triggers: BTreeMap<String, Vec<(usize, usize)>>,
}

impl Program {
    /// Rules in source order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Declared relations
    pub fn tables(&self) -> &[TableDecl] {
        &self.tables
    }

    /// Distinct periodic sources
    pub fn timers(&self) -> &[TimerSpec] {
        &self.timers
    }

    /// `(rule index, conjunct index)` pairs whose conjunct uses `predicate`
    pub fn triggered_by(&self, predicate: &str) -> &[(usize, usize)] {
        self.triggers
            .get(predicate)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Check a parsed program and build its trigger index
pub fn compile(source: SourceProgram) -> CompileResult<Program> {
    let mut program = Program::default();
    let mut timers = BTreeSet::new();

    for statement in source.statements {
        match statement {
            Statement::Materialize(decl) => {
                if program.tables.iter().any(|t| t.name == decl.name) {
                    return Err(CompileError::DuplicateTable { relation: decl.name });
                }
                if let Some(&position) = decl.keys.iter().find(|&&p| p == 0) {
                    return Err(CompileError::InvalidKey {
                        relation: decl.name,
                        position,
                    });
                }
                let max_size = match decl.size {
                    Limit::Finite(0) => {
                        return Err(CompileError::InvalidSize { relation: decl.name })
                    }
                    Limit::Finite(n) => Some(n as usize),
                    Limit::Infinity => None,
                };
                program.tables.push(TableDecl {
                    name: decl.name,
                    ttl: match decl.ttl {
                        Limit::Finite(n) => Some(n),
                        Limit::Infinity => None,
                    },
                    max_size,
                    keys: decl.keys,
                });
            }
            Statement::Periodic(atom) => {
                timers.insert(timer_spec(&atom)?);
            }
            Statement::Rule(rule) => {
                for atom in rule.body.iter().filter(|a| a.predicate == PERIODIC) {
                    timers.insert(timer_spec(atom)?);
                }
                check_rule(&rule)?;
                program.rules.push(rule);
            }
        }
    }

    for rule in &program.rules {
        if let Some(table) = program.tables.iter().find(|t| t.name == rule.head.predicate) {
            let arity = rule.head.args.len() + 1;
            if let Some(&position) = table.keys.iter().find(|&&p| p > arity) {
                return Err(CompileError::InvalidKey {
                    relation: table.name.clone(),
                    position,
                });
            }
        }
    }

    for (rule_index, rule) in program.rules.iter().enumerate() {
        for (conjunct, atom) in rule.body.iter().enumerate() {
            program
                .triggers
                .entry(atom.predicate.clone())
                .or_default()
                .push((rule_index, conjunct));
        }
    }
    program.timers = timers.into_iter().collect();

    Ok(program)
}

fn timer_spec(atom: &Atom) -> CompileResult<TimerSpec> {
    let invalid = |reason: String| CompileError::InvalidTimer {
        reason: format!("{atom}: {reason}"),
    };

    if !matches!(atom.location, Term::Var(_) | Term::Wildcard) {
        return Err(invalid("location must be a variable".to_string()));
    }
    let [event, period, repeat, delay, jitter] = atom.args.as_slice() else {
        return Err(invalid(format!(
            "expected 5 arguments after the location, found {}",
            atom.args.len()
        )));
    };
    if !matches!(event, Term::Var(_) | Term::Wildcard) {
        return Err(invalid("event argument must be a variable".to_string()));
    }

    let number = |term: &Term, what: &str| match term {
        Term::Const(Value::Int(n)) if *n >= 0 => Ok(*n as u64),
        other => Err(invalid(format!(
            "{what} must be a non-negative integer constant, found {other}"
        ))),
    };
    let spec = TimerSpec {
        period: number(period, "period")?,
        repeat: number(repeat, "repeat count")?,
        initial_delay: number(delay, "initial delay")?,
        jitter: number(jitter, "jitter")?,
    };
    if spec.period == 0 {
        return Err(invalid("period must be positive".to_string()));
    }
    Ok(spec)
}

fn check_rule(rule: &Rule) -> CompileResult<()> {
    if rule.body.is_empty() {
        return Err(CompileError::EmptyBody {
            rule: rule.name.clone(),
        });
    }

    let mut bound = BTreeSet::new();
    for atom in &rule.body {
        if atom.location == Term::Broadcast {
            return Err(CompileError::InvalidLocation {
                rule: rule.name.clone(),
                reason: format!("body conjunct {atom} cannot be located at '*'"),
            });
        }
        for term in std::iter::once(&atom.location).chain(&atom.args) {
            if let Term::Var(name) = term {
                bound.insert(name.as_str());
            }
        }
    }

    let unbound = |variable: &str| CompileError::UnboundVariable {
        rule: rule.name.clone(),
        variable: variable.to_string(),
    };

    for assignment in &rule.assignments {
        if let Some(var) = assignment
            .expr
            .variables()
            .into_iter()
            .find(|var| !bound.contains(var))
        {
            return Err(unbound(var));
        }
        bound.insert(assignment.var.as_str());
    }

    match &rule.head.location {
        Term::Var(name) if !bound.contains(name.as_str()) => return Err(unbound(name)),
        Term::Var(_) | Term::Broadcast | Term::Const(Value::Str(_)) => {}
        Term::Wildcard => {
            return Err(CompileError::WildcardNotAllowed {
                rule: rule.name.clone(),
                place: "the head location".to_string(),
            })
        }
        Term::Const(other) => {
            return Err(CompileError::InvalidLocation {
                rule: rule.name.clone(),
                reason: format!("{other} is not an address"),
            })
        }
    }

    for term in &rule.head.args {
        match term {
            Term::Var(name) if !bound.contains(name.as_str()) => return Err(unbound(name)),
            Term::Wildcard => {
                return Err(CompileError::WildcardNotAllowed {
                    rule: rule.name.clone(),
                    place: "the head".to_string(),
                })
            }
            _ => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::parse_program;

    fn build(source: &str) -> CompileResult<Program> {
        let parsed = parse_program(source, &BTreeMap::new()).expect("test program parses");
        compile(parsed)
    }

    #[test]
    fn test_compile_discovery_program() {
        let program = build(crate::engine::DEFAULT_PROGRAM).unwrap();

        assert_eq!(program.rules().len(), 3);
        assert_eq!(
            program.tables(),
            &[TableDecl {
                name: "link".to_string(),
                ttl: Some(11),
                max_size: None,
                keys: vec![1, 2],
            }]
        );
        assert_eq!(
            program.timers(),
            &[TimerSpec {
                period: 5,
                repeat: 0,
                initial_delay: 1,
                jitter: 4,
            }]
        );
        assert_eq!(program.triggered_by("beacon"), &[(1, 0)]);
        assert_eq!(program.triggered_by("beaconLoc"), &[(2, 0)]);
        assert!(program.triggered_by("link").is_empty());
    }

    #[test]
    fn test_table_from_decl() {
        let decl = TableDecl {
            name: "link".to_string(),
            ttl: Some(11),
            max_size: Some(8),
            keys: vec![1, 2],
        };
        let table = decl.table(Duration::from_millis(500));
        assert_eq!(table.name(), "link");
        assert_eq!(table.ttl(), Ttl::Finite(Duration::from_millis(5500)));
        assert_eq!(to_duration(Duration::from_secs(1), u64::MAX), Duration::MAX);
    }

    #[test]
    fn test_unbound_head_variable() {
        let err = build("r3 link(@X, Y, C) :- beaconLoc(@X, Y).").unwrap_err();
        assert_eq!(
            err,
            CompileError::UnboundVariable {
                rule: "r3".to_string(),
                variable: "C".to_string()
            }
        );
    }

    #[test]
    fn test_unbound_assignment_variable() {
        let err = build("r link(@X, Y, C) :- beaconLoc(@X, Y), C := Z + 1.").unwrap_err();
        assert!(matches!(err, CompileError::UnboundVariable { ref variable, .. } if variable == "Z"));

        // Earlier assignments bind variables for later ones.
        assert!(build("r link(@X, Y, C) :- beaconLoc(@X, Y), D := 1, C := D + 1.").is_ok());
    }

    #[test]
    fn test_wildcards_and_locations() {
        assert!(matches!(
            build("r link(@X, _) :- b(@X).").unwrap_err(),
            CompileError::WildcardNotAllowed { .. }
        ));
        assert!(matches!(
            build("r link(@X) :- b(@*).").unwrap_err(),
            CompileError::InvalidLocation { .. }
        ));
        assert!(matches!(
            build("r link(@3) :- b(@X).").unwrap_err(),
            CompileError::InvalidLocation { .. }
        ));
        assert!(build("r ping(@\"A\", X) :- b(@X).").is_ok());
    }

    #[test]
    fn test_invalid_timers() {
        assert!(matches!(
            build("r b(@*, X) :- periodic(@X, E, 0, 0, 1, 4).").unwrap_err(),
            CompileError::InvalidTimer { .. }
        ));
        assert!(matches!(
            build("r b(@*, X) :- periodic(@X, E, 5).").unwrap_err(),
            CompileError::InvalidTimer { .. }
        ));
        assert!(matches!(
            build("r b(@*, X) :- periodic(@X, E, P, 0, 1, 4).").unwrap_err(),
            CompileError::InvalidTimer { .. }
        ));
    }

    #[test]
    fn test_identical_timers_are_shared() {
        let program = build(
            "periodic(@X, E, 5, 0, 1, 4).\n\
             a(@*, X) :- periodic(@X, E, 5, 0, 1, 4).\n\
             b(@*, X) :- periodic(@X, _, 2, 3, 0, 0).",
        )
        .unwrap();
        assert_eq!(program.timers().len(), 2);
    }

    #[test]
    fn test_invalid_tables() {
        assert!(matches!(
            build("materialize(link, 1, infinity, keys(1)).\nmaterialize(link, 2, infinity, keys(1)).")
                .unwrap_err(),
            CompileError::DuplicateTable { .. }
        ));
        assert!(matches!(
            build("materialize(link, 1, infinity, keys(0)).").unwrap_err(),
            CompileError::InvalidKey { position: 0, .. }
        ));
        assert!(matches!(
            build("materialize(link, 1, 0, keys(1)).").unwrap_err(),
            CompileError::InvalidSize { .. }
        ));
        assert!(matches!(
            build("materialize(link, 1, infinity, keys(1, 4)).\nr link(@X, Y) :- b(@X, Y).")
                .unwrap_err(),
            CompileError::InvalidKey { position: 4, .. }
        ));
    }
}
