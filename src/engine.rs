//! Driver: compiling programs and executing subroutines
//!
//! The host-facing surface: [`parse_vcl`](crate::parser::parse_vcl) produces
//! a [`Program`], [`compile`] turns it into executable [`Subroutines`], and
//! [`execute_vcl`] runs one subroutine against a context and returns the
//! terminal action string (`lookup`, `pass`, `hash`, `fetch`, `deliver`,
//! `restart`, `error`).

use crate::ast::{Program, Subroutine};
use crate::context::{Phase, VclContext};
use crate::error::VclError;
use crate::eval::{Outcome, run_subroutine};
use crate::parser::parse_vcl;
use indexmap::IndexMap;
use log::debug;

/// Compiled program: executable subroutines plus the declarations contexts
/// adopt on first execution
#[derive(Debug, Clone)]
pub struct Subroutines {
    subs: IndexMap<String, Subroutine>,
    declarations: Program,
}

impl Subroutines {
    /// Looks up a compiled subroutine
    pub fn get(&self, name: &str) -> Option<&Subroutine> {
        self.subs.get(name)
    }

    /// True when the named subroutine exists
    pub fn contains(&self, name: &str) -> bool {
        self.subs.contains_key(name)
    }

    /// Subroutine names in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subs.keys().map(String::as_str)
    }

    /// The declarations (ACLs, tables, backends, directors) and diagnostics
    /// carried alongside the subroutines
    pub fn declarations(&self) -> &Program {
        &self.declarations
    }
}

/// Compiles a parsed program into executable subroutines
///
/// Later definitions of the same subroutine name win, which makes textual
/// concatenation of multiple sources a workable composition strategy.
pub fn compile(program: &Program) -> Subroutines {
    let mut subs = IndexMap::new();
    for sub in &program.subroutines {
        subs.insert(sub.name.clone(), sub.clone());
    }
    let mut declarations = program.clone();
    declarations.subroutines.clear();
    Subroutines { subs, declarations }
}

/// Parses and compiles VCL source in one step
pub fn load_vcl_content(source: &str) -> Subroutines {
    compile(&parse_vcl(source))
}

/// Creates a fresh execution context
pub fn create_vcl_context() -> VclContext {
    VclContext::new()
}

/// Executes the named subroutine and returns the terminal action
///
/// On an error transition the driver suspends, invokes `vcl_error` when
/// defined, and returns its action. A `restart` bumps the context's restart
/// counter and fails once the ceiling is exceeded.
pub fn execute_vcl(
    subs: &Subroutines,
    name: &str,
    ctx: &mut VclContext,
) -> Result<String, VclError> {
    let sub = subs
        .get(name)
        .ok_or_else(|| VclError::UndefinedSubroutine {
            name: name.to_string(),
        })?;
    ctx.adopt_declarations(&subs.declarations);

    match run_subroutine(sub, ctx)? {
        Outcome::Return(action) if !action.is_empty() => Ok(action),
        Outcome::Return(_) | Outcome::Completed => Ok(default_action(ctx.phase).to_string()),
        Outcome::Restart => register_restart(ctx),
        Outcome::Error { status, message } => {
            debug!(target: "vcl", "error transition {status}: {message}");
            let handler = if name == "vcl_error" {
                None
            } else {
                subs.get("vcl_error")
            };
            match handler {
                Some(error_sub) => match run_subroutine(error_sub, ctx)? {
                    Outcome::Return(action) if !action.is_empty() => Ok(action),
                    Outcome::Return(_) | Outcome::Completed => Ok("deliver".to_string()),
                    Outcome::Restart => register_restart(ctx),
                    // A second error inside vcl_error is terminal.
                    Outcome::Error { .. } => Ok("error".to_string()),
                },
                None => Ok("error".to_string()),
            }
        }
    }
}

fn register_restart(ctx: &mut VclContext) -> Result<String, VclError> {
    ctx.restarts += 1;
    if ctx.restarts > ctx.max_restarts {
        return Err(VclError::TooManyRestarts {
            max: ctx.max_restarts,
        });
    }
    Ok("restart".to_string())
}

/// The action an implicit fall-through produces, per phase
fn default_action(phase: Phase) -> &'static str {
    match phase {
        Phase::Recv => "lookup",
        Phase::Hash => "hash",
        Phase::Hit => "deliver",
        Phase::Miss => "fetch",
        Phase::Pass => "pass",
        Phase::Fetch => "deliver",
        Phase::Deliver => "deliver",
        Phase::Error => "deliver",
        Phase::Log => "deliver",
    }
}
