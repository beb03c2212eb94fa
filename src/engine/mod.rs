//! Rule engine: parsing, checking and evaluating rule programs.

pub mod ast;
pub mod compile;
pub mod eval;
pub mod parser;

pub use compile::{compile, to_duration, Program, TableDecl, TimerSpec, PERIODIC};
pub use eval::{Derivation, Evaluator};
pub use parser::parse_program;

use crate::utils::Result;
use std::collections::BTreeMap;

/// The one-hop discovery program (rules r1 to r3)
pub const DEFAULT_PROGRAM: &str = include_str!("../../protocols/discovery.ndl");

/// Parse and compile `source`; `constants` override its `#define`s
pub fn load_program(source: &str, constants: &BTreeMap<String, i64>) -> Result<Program> {
    let parsed = parse_program(source, constants)?;
    let program = compile(parsed)?;
    log::debug!(
        "Loaded program: {} rules, {} tables, {} timers",
        program.rules().len(),
        program.tables().len(),
        program.timers().len()
    );
    Ok(program)
}
