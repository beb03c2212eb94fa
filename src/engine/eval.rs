//! Event-driven rule evaluation.
//!
//! One incoming fact starts a cascade: every rule with a conjunct over the
//! fact's predicate is fired with that conjunct bound to the fact, the other
//! conjuncts are joined against the node's materialized tables, and each
//! derived head is routed. Local heads of materialized relations are stored
//! and re-enter the worklist when they change the table; local transient
//! heads re-enter unconditionally; remote and broadcast heads are handed back
//! for sending. A trigger of a materialized relation, such as a fact shipped
//! here by another node, is stored first and only cascades if it changed the
//! table.

use crate::engine::ast::{Assignment, Atom, BinOp, Expr, Rule, Term};
use crate::engine::compile::Program;
use crate::store::{Catalog, UpsertOutcome};
use crate::transport::{Address, Fact, NodeId, Value};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Variable bindings of one rule firing
pub type Bindings = BTreeMap<String, Value>;

/// Everything one cascade produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Derivation {
    /// Heads addressed to other nodes or to `*`, in derivation order
    pub outbound: Vec<(Address, Fact)>,
    /// Local heads written to a table, with what the write did
    pub stored: Vec<(Fact, UpsertOutcome)>,
    /// Local heads of non-materialized relations
    pub transient: usize,
    /// Heads derived per rule name
    pub firings: BTreeMap<String, u64>,
    /// Facts taken off the worklist
    pub steps: usize,
    /// Cascade stopped at the step limit
    pub truncated: bool,
    /// Bindings dropped because an expression or a write failed
    pub failures: usize,
}

impl Derivation {
    /// Whether nothing was derived
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.stored.is_empty() && self.transient == 0
    }
}

/// Evaluator of one program on behalf of one node
#[derive(Debug, Clone, Copy)]
pub struct Evaluator<'a> {
    program: &'a Program,
    local: &'a NodeId,
    max_steps: usize,
}

impl<'a> Evaluator<'a> {
    /// Evaluator for `local`, processing at most `max_steps` facts per cascade
    pub fn new(program: &'a Program, local: &'a NodeId, max_steps: usize) -> Self {
        Self {
            program,
            local,
            max_steps,
        }
    }

    /// Run the cascade started by `trigger` to a fixpoint.
    ///
    /// `trigger` must already be located at the local node.
    pub fn evaluate(&self, trigger: Fact, catalog: &mut Catalog, now: Duration) -> Derivation {
        let mut derivation = Derivation::default();
        let mut worklist = VecDeque::new();
        if catalog.table(&trigger.predicate).is_some() {
            self.store(trigger, catalog, now, &mut worklist, &mut derivation);
        } else {
            worklist.push_back(trigger);
        }

        while let Some(fact) = worklist.pop_front() {
            if derivation.steps >= self.max_steps {
                derivation.truncated = true;
                log::warn!(
                    "{}: cascade stopped after {} steps, {} facts left unprocessed",
                    self.local,
                    derivation.steps,
                    worklist.len() + 1
                );
                break;
            }
            derivation.steps += 1;

            for &(rule_index, conjunct) in self.program.triggered_by(&fact.predicate) {
                let rule = &self.program.rules()[rule_index];
                for head in self.fire(rule, conjunct, &fact, catalog, &mut derivation) {
                    *derivation.firings.entry(rule.name.clone()).or_default() += 1;
                    self.route(head, catalog, now, &mut worklist, &mut derivation);
                }
            }
        }

        derivation
    }

    fn fire(
        &self,
        rule: &Rule,
        conjunct: usize,
        fact: &Fact,
        catalog: &Catalog,
        derivation: &mut Derivation,
    ) -> Vec<Fact> {
        let Some(seed) = unify(&rule.body[conjunct], fact, Bindings::new()) else {
            return Vec::new();
        };

        let mut partial = vec![seed];
        for (index, atom) in rule.body.iter().enumerate() {
            if index == conjunct {
                continue;
            }
            let mut joined = Vec::new();
            for bindings in &partial {
                for stored in catalog.facts(&atom.predicate) {
                    if let Some(extended) = unify(atom, stored, bindings.clone()) {
                        joined.push(extended);
                    }
                }
            }
            partial = joined;
            if partial.is_empty() {
                return Vec::new();
            }
        }

        let mut heads = Vec::new();
        for bindings in partial {
            let result = assign(&rule.assignments, bindings)
                .and_then(|bound| bound.map(|b| instantiate(&rule.head, &b)).transpose());
            match result {
                Ok(Some(head)) => heads.push(head),
                Ok(None) => {}
                Err(reason) => {
                    log::warn!("{}: rule {} skipped a binding: {reason}", self.local, rule.name);
                    derivation.failures += 1;
                }
            }
        }
        heads
    }

    fn route(
        &self,
        head: Fact,
        catalog: &mut Catalog,
        now: Duration,
        worklist: &mut VecDeque<Fact>,
        derivation: &mut Derivation,
    ) {
        if !head.location.is_local_to(self.local) {
            log::trace!("{}: derived {head} for sending", self.local);
            derivation.outbound.push((head.location.clone(), head));
            return;
        }

        if catalog.table(&head.predicate).is_none() {
            log::trace!("{}: derived transient {head}", self.local);
            derivation.transient += 1;
            worklist.push_back(head);
            return;
        }
        self.store(head, catalog, now, worklist, derivation);
    }

    /// Upsert a local fact of a materialized relation; it re-enters the
    /// worklist only if the table changed
    fn store(
        &self,
        fact: Fact,
        catalog: &mut Catalog,
        now: Duration,
        worklist: &mut VecDeque<Fact>,
        derivation: &mut Derivation,
    ) {
        let Some(table) = catalog.table_mut(&fact.predicate) else {
            return;
        };
        match table.upsert(fact.clone(), now) {
            Ok(outcome) => {
                log::trace!("{}: stored {fact} ({outcome:?})", self.local);
                if outcome.is_change() {
                    worklist.push_back(fact.clone());
                }
                derivation.stored.push((fact, outcome));
            }
            Err(e) => {
                log::warn!("{}: could not store {fact}: {e}", self.local);
                derivation.failures += 1;
            }
        }
    }
}

/// Extend `bindings` so that `atom` matches `fact`
pub fn unify(atom: &Atom, fact: &Fact, mut bindings: Bindings) -> Option<Bindings> {
    if atom.predicate != fact.predicate || atom.args.len() != fact.attrs.len() {
        return None;
    }
    let location = Value::Addr(fact.location.clone());
    if !match_term(&atom.location, &location, &mut bindings) {
        return None;
    }
    for (term, value) in atom.args.iter().zip(&fact.attrs) {
        if !match_term(term, value, &mut bindings) {
            return None;
        }
    }
    Some(bindings)
}

fn match_term(term: &Term, value: &Value, bindings: &mut Bindings) -> bool {
    match term {
        Term::Wildcard => true,
        Term::Broadcast => *value == Value::Addr(Address::Broadcast),
        Term::Const(constant) => constant_matches(constant, value),
        Term::Var(name) => match bindings.get(name) {
            Some(bound) => bound == value,
            None => {
                bindings.insert(name.clone(), value.clone());
                true
            }
        },
    }
}

// A string literal names a node when compared with an address.
fn constant_matches(constant: &Value, value: &Value) -> bool {
    match (constant, value) {
        (Value::Str(name), Value::Addr(Address::Node(id))) => name == id.as_str(),
        _ => constant == value,
    }
}

// `Ok(None)` when an assignment to a bound variable disagrees with it.
fn assign(assignments: &[Assignment], mut bindings: Bindings) -> Result<Option<Bindings>, String> {
    for assignment in assignments {
        let value = eval_expr(&assignment.expr, &bindings)?;
        match bindings.get(&assignment.var) {
            Some(bound) if *bound != value => return Ok(None),
            Some(_) => {}
            None => {
                bindings.insert(assignment.var.clone(), value);
            }
        }
    }
    Ok(Some(bindings))
}

/// Value of `expr` under `bindings`
pub fn eval_expr(expr: &Expr, bindings: &Bindings) -> Result<Value, String> {
    match expr {
        Expr::Const(value) => Ok(value.clone()),
        Expr::Var(name) => bindings
            .get(name)
            .cloned()
            .ok_or_else(|| format!("variable {name} is unbound")),
        Expr::Neg(inner) => match eval_expr(inner, bindings)? {
            Value::Int(n) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| format!("-{n} overflows")),
            other => Err(format!("cannot negate a {}", other.type_name())),
        },
        Expr::Binary(lhs, op, rhs) => {
            let lhs = eval_expr(lhs, bindings)?;
            let rhs = eval_expr(rhs, bindings)?;
            match (lhs, *op, rhs) {
                (Value::Int(a), op, Value::Int(b)) => {
                    let result = match op {
                        BinOp::Add => a.checked_add(b),
                        BinOp::Sub => a.checked_sub(b),
                        BinOp::Mul => a.checked_mul(b),
                    };
                    result
                        .map(Value::Int)
                        .ok_or_else(|| format!("{a} {op:?} {b} overflows"))
                }
                (Value::Str(a), BinOp::Add, Value::Str(b)) => Ok(Value::Str(a + &b)),
                (a, op, b) => Err(format!(
                    "cannot apply {op:?} to {} and {}",
                    a.type_name(),
                    b.type_name()
                )),
            }
        }
    }
}

fn instantiate(head: &Atom, bindings: &Bindings) -> Result<Fact, String> {
    let location = match &head.location {
        Term::Broadcast => Address::Broadcast,
        Term::Const(Value::Str(name)) => Address::node(name.as_str()),
        Term::Var(name) => match bindings.get(name) {
            Some(Value::Addr(addr)) => addr.clone(),
            Some(Value::Str(name)) => Address::node(name.as_str()),
            Some(other) => {
                return Err(format!(
                    "head location {name} is a {}, not an address",
                    other.type_name()
                ))
            }
            None => return Err(format!("variable {name} is unbound")),
        },
        other => return Err(format!("{other} is not a head location")),
    };

    let attrs = head
        .args
        .iter()
        .map(|term| match term {
            Term::Var(name) => bindings
                .get(name)
                .cloned()
                .ok_or_else(|| format!("variable {name} is unbound")),
            Term::Const(value) => Ok(value.clone()),
            Term::Broadcast => Ok(Value::Addr(Address::Broadcast)),
            Term::Wildcard => Err("wildcard in head".to_string()),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Fact::new(head.predicate.clone(), location, attrs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{load_program, DEFAULT_PROGRAM};
    use crate::store::{link_fact, LINK_RELATION};

    fn program(source: &str) -> Program {
        load_program(source, &BTreeMap::new()).unwrap()
    }

    fn catalog(program: &Program) -> Catalog {
        Catalog::new(
            program
                .tables()
                .iter()
                .map(|decl| decl.table(Duration::from_secs(1))),
        )
    }

    fn node(id: &str) -> Value {
        Value::Addr(Address::node(id))
    }

    #[test]
    fn test_tick_broadcasts_beacon() {
        let program = program(DEFAULT_PROGRAM);
        let local = NodeId::new("B");
        let mut tables = catalog(&program);
        let tick = program.timers()[0].trigger_fact(&local, 0);

        let derivation = Evaluator::new(&program, &local, 64).evaluate(tick, &mut tables, Duration::ZERO);

        let beacon = Fact::new("beacon", Address::Broadcast, vec![node("B")]);
        assert_eq!(derivation.outbound, vec![(Address::Broadcast, beacon)]);
        assert!(derivation.stored.is_empty());
        assert_eq!(derivation.firings.get("r1"), Some(&1));
    }

    #[test]
    fn test_beacon_derives_link() {
        let program = program(DEFAULT_PROGRAM);
        let local = NodeId::new("A");
        let mut tables = catalog(&program);
        let evaluator = Evaluator::new(&program, &local, 64);
        let beacon = Fact::new("beacon", Address::node("A"), vec![node("B")]);

        let first = evaluator.evaluate(beacon.clone(), &mut tables, Duration::from_secs(6));
        let expected = link_fact(&local, &NodeId::new("B"), 1);
        assert_eq!(
            first.stored,
            vec![(expected.clone(), UpsertOutcome::Inserted { evicted: None })]
        );
        assert_eq!(first.transient, 1);
        assert!(first.outbound.is_empty());

        let again = evaluator.evaluate(beacon, &mut tables, Duration::from_secs(11));
        assert_eq!(again.stored, vec![(expected, UpsertOutcome::Refreshed)]);

        let link = tables.table(LINK_RELATION).unwrap();
        assert_eq!(link.len(), 1);
        assert_eq!(link.snapshot()[0].last_refresh, Duration::from_secs(11));
    }

    #[test]
    fn test_join_against_tables() {
        let program = program(
            "materialize(link, infinity, infinity, keys(1,2)).
             materialize(route, infinity, infinity, keys(1,2)).
             twoHop route(@X, Z, C) :- advert(@X, Y, Z), link(@X, Y, C1), C := C1 + 1.
             fanout probe(@X, Y) :- tick(@X), link(@X, Y, _).",
        );
        let local = NodeId::new("A");
        let mut tables = catalog(&program);
        for neighbor in ["B", "C"] {
            tables
                .table_mut(LINK_RELATION)
                .unwrap()
                .upsert(link_fact(&local, &NodeId::new(neighbor), 1), Duration::ZERO)
                .unwrap();
        }
        let evaluator = Evaluator::new(&program, &local, 64);

        let advert = Fact::new("advert", Address::node("A"), vec![node("B"), node("D")]);
        let derivation = evaluator.evaluate(advert, &mut tables, Duration::ZERO);
        let route = Fact::new("route", Address::node("A"), vec![node("D"), Value::Int(2)]);
        assert_eq!(
            derivation.stored,
            vec![(route, UpsertOutcome::Inserted { evicted: None })]
        );

        let stranger = Fact::new("advert", Address::node("A"), vec![node("E"), node("D")]);
        assert!(evaluator.evaluate(stranger, &mut tables, Duration::ZERO).is_empty());

        let tick = Fact::new("tick", Address::node("A"), vec![]);
        let derivation = evaluator.evaluate(tick, &mut tables, Duration::ZERO);
        assert_eq!(derivation.transient, 2);
        assert_eq!(derivation.firings.get("fanout"), Some(&2));
    }

    #[test]
    fn test_materialized_trigger_is_stored() {
        let program = program(
            "materialize(link, infinity, infinity, keys(1,2)).
             notice seen(@X, Y) :- link(@X, Y, _).",
        );
        let local = NodeId::new("A");
        let mut tables = catalog(&program);
        let evaluator = Evaluator::new(&program, &local, 64);
        let arrived = link_fact(&local, &NodeId::new("B"), 1);

        let first = evaluator.evaluate(arrived.clone(), &mut tables, Duration::from_secs(2));
        assert_eq!(
            first.stored,
            vec![(arrived.clone(), UpsertOutcome::Inserted { evicted: None })]
        );
        assert_eq!(first.transient, 1);

        // Unchanged rows are refreshed without re-firing dependent rules
        let again = evaluator.evaluate(arrived.clone(), &mut tables, Duration::from_secs(3));
        assert_eq!(again.stored, vec![(arrived, UpsertOutcome::Refreshed)]);
        assert_eq!(again.transient, 0);
        assert_eq!(tables.table(LINK_RELATION).unwrap().len(), 1);
    }

    #[test]
    fn test_remote_head_is_sent() {
        let program = program("pong reply(@Y, X) :- ping(@X, Y).");
        let local = NodeId::new("A");
        let mut tables = catalog(&program);

        let ping = Fact::new("ping", Address::node("A"), vec![node("B")]);
        let derivation = Evaluator::new(&program, &local, 64).evaluate(ping, &mut tables, Duration::ZERO);

        let reply = Fact::new("reply", Address::node("B"), vec![node("A")]);
        assert_eq!(derivation.outbound, vec![(Address::node("B"), reply)]);
    }

    #[test]
    fn test_constants_and_filters() {
        let program = program(
            "fromB seen(@X, Y) :- hello(@X, \"B\", Y).
             same twin(@X) :- pair(@X, A, B), A := B.",
        );
        let local = NodeId::new("A");
        let mut tables = catalog(&program);
        let evaluator = Evaluator::new(&program, &local, 64);

        let from_b = Fact::new("hello", Address::node("A"), vec![node("B"), Value::Int(1)]);
        assert_eq!(evaluator.evaluate(from_b, &mut tables, Duration::ZERO).transient, 1);
        let from_c = Fact::new("hello", Address::node("A"), vec![node("C"), Value::Int(1)]);
        assert!(evaluator.evaluate(from_c, &mut tables, Duration::ZERO).is_empty());

        let equal = Fact::new("pair", Address::node("A"), vec![Value::Int(3), Value::Int(3)]);
        assert_eq!(evaluator.evaluate(equal, &mut tables, Duration::ZERO).transient, 1);
        let unequal = Fact::new("pair", Address::node("A"), vec![Value::Int(3), Value::Int(4)]);
        assert!(evaluator.evaluate(unequal, &mut tables, Duration::ZERO).is_empty());
    }

    #[test]
    fn test_type_error_skips_binding() {
        let program = program("bad out(@X, C) :- tick(@X), C := X + 1.");
        let local = NodeId::new("A");
        let mut tables = catalog(&program);

        let tick = Fact::new("tick", Address::node("A"), vec![]);
        let derivation = Evaluator::new(&program, &local, 64).evaluate(tick, &mut tables, Duration::ZERO);
        assert_eq!(derivation.failures, 1);
        assert!(derivation.is_empty());
    }

    #[test]
    fn test_cascade_limit() {
        let program = program("grow count(@X, N) :- count(@X, M), N := M + 1.");
        let local = NodeId::new("A");
        let mut tables = catalog(&program);

        let seed = Fact::new("count", Address::node("A"), vec![Value::Int(0)]);
        let derivation = Evaluator::new(&program, &local, 10).evaluate(seed, &mut tables, Duration::ZERO);
        assert!(derivation.truncated);
        assert_eq!(derivation.steps, 10);
        assert_eq!(derivation.transient, 10);
    }

    #[test]
    fn test_expressions() {
        let bindings = Bindings::from([("N".to_string(), Value::Int(4))]);
        let expr = Expr::Binary(
            Box::new(Expr::Neg(Box::new(Expr::Var("N".to_string())))),
            BinOp::Mul,
            Box::new(Expr::Const(Value::Int(3))),
        );
        assert_eq!(eval_expr(&expr, &bindings), Ok(Value::Int(-12)));

        let overflow = Expr::Binary(
            Box::new(Expr::Const(Value::Int(i64::MAX))),
            BinOp::Add,
            Box::new(Expr::Const(Value::Int(1))),
        );
        assert!(eval_expr(&overflow, &bindings).is_err());

        let concat = Expr::Binary(
            Box::new(Expr::Const(Value::Str("be".to_string()))),
            BinOp::Add,
            Box::new(Expr::Const(Value::Str("acon".to_string()))),
        );
        assert_eq!(eval_expr(&concat, &bindings), Ok(Value::Str("beacon".to_string())));
    }
}
