//! Tree-walking evaluator
//!
//! Statements run through a statement-pointer loop rather than plain
//! recursion, so `goto` is an O(1) index jump against a label map pre-scanned
//! at subroutine entry, and runaway goto cycles hit a bounded step ceiling.
//! Control flow (`return`, `error`, `restart`) travels as explicit
//! [`Outcome`] values; no host panics cross the language boundary.

use crate::ast::{BinaryOp, Expression, Statement, Subroutine, UnaryOp, VarType};
use crate::builtins::{self, BuiltinResult};
use crate::context::{Phase, VclContext};
use crate::error::{EvalError, VclError};
use crate::runtime::Runtime;
use crate::value::{Value, parse_duration};
use log::{debug, trace};
use std::collections::HashMap;

/// Ceiling on executed statements per subroutine; goto cycles that run this
/// long are reported as fatal rather than spinning
const STEP_LIMIT: usize = 100_000;

/// How a subroutine finished
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Fell off the end without an explicit return
    Completed,
    /// `return(action)`
    Return(String),
    /// `error` statement or `waf.block`; the driver runs `vcl_error` next
    Error {
        /// Status recorded on `obj.status`
        status: i64,
        /// Message recorded on `obj.response` and `fastly.error`
        message: String,
    },
    /// `restart;` — the driver counts and bounds these
    Restart,
}

/// Intra-subroutine control flow
enum Flow {
    Next,
    Jump(String),
    Done(Outcome),
}

/// Interrupts raised while evaluating an expression
enum Interrupt {
    Fail(EvalError),
    Transition { status: i64, message: String },
}

impl From<EvalError> for Interrupt {
    fn from(e: EvalError) -> Self {
        Interrupt::Fail(e)
    }
}

type ExprResult = Result<Value, Interrupt>;

/// Executes one subroutine against the context and reports how it finished
pub fn run_subroutine(sub: &Subroutine, ctx: &mut VclContext) -> Result<Outcome, VclError> {
    ctx.phase = Phase::for_subroutine(&sub.name);
    ctx.clear_locals();

    // Labels are resolved up front over the top-level statement list.
    let labels: HashMap<&str, usize> = sub
        .body
        .iter()
        .enumerate()
        .filter_map(|(idx, stmt)| match stmt {
            Statement::Label { name } => Some((name.as_str(), idx)),
            _ => None,
        })
        .collect();

    let mut idx = 0usize;
    let mut steps = 0usize;
    while idx < sub.body.len() {
        steps += 1;
        if steps > STEP_LIMIT {
            return Err(VclError::StepLimitExceeded {
                name: sub.name.clone(),
            });
        }
        match exec_statement(&sub.body[idx], ctx)? {
            Flow::Next => idx += 1,
            Flow::Jump(label) => {
                let target = labels.get(label.as_str()).ok_or(EvalError::UndefinedLabel {
                    label: label.clone(),
                })?;
                idx = *target;
            }
            Flow::Done(outcome) => return Ok(outcome),
        }
    }
    Ok(Outcome::Completed)
}

/// Runs a nested block; `Jump` propagates to the top-level pointer loop
fn exec_block(body: &[Statement], ctx: &mut VclContext) -> Result<Flow, VclError> {
    for stmt in body {
        match exec_statement(stmt, ctx)? {
            Flow::Next => {}
            other => return Ok(other),
        }
    }
    Ok(Flow::Next)
}

fn exec_statement(stmt: &Statement, ctx: &mut VclContext) -> Result<Flow, VclError> {
    match stmt {
        Statement::Set { target, expr } => {
            let value = match eval_checked(expr, ctx)? {
                Ok(value) => value,
                Err(flow) => return Ok(flow),
            };
            // A bare identifier that resolves to nothing names a backend or
            // director (`set req.backend = api;`).
            let value = match (&value, expr) {
                (Value::Null, Expression::Ident(name)) => Value::Str(name.clone()),
                _ => value,
            };
            assign(target, value, ctx);
            Ok(Flow::Next)
        }
        Statement::Unset { target } => {
            assign(target, Value::Str(String::new()), ctx);
            Ok(Flow::Next)
        }
        Statement::If {
            test,
            consequent,
            alternate,
        } => {
            let cond = match eval_checked(test, ctx)? {
                Ok(value) => value,
                Err(flow) => return Ok(flow),
            };
            if cond.truthy() {
                exec_block(consequent, ctx)
            } else {
                exec_block(alternate, ctx)
            }
        }
        Statement::Return { action } => Ok(Flow::Done(Outcome::Return(action.clone()))),
        Statement::Error { status, message } => {
            let message = match message {
                Some(expr) => match eval_checked(expr, ctx)? {
                    Ok(value) => value.to_vcl_string(),
                    Err(flow) => return Ok(flow),
                },
                None => String::new(),
            };
            apply_error(ctx, *status, &message);
            Ok(Flow::Done(Outcome::Error {
                status: *status,
                message,
            }))
        }
        Statement::Log { expr } => {
            let message = match eval_checked(expr, ctx)? {
                Ok(value) => value.to_vcl_string(),
                Err(flow) => return Ok(flow),
            };
            debug!(target: "vcl", "{message}");
            ctx.logs.push(message);
            Ok(Flow::Next)
        }
        Statement::Synthetic { expr } => {
            let body = match eval_checked(expr, ctx)? {
                Ok(value) => value.to_vcl_string(),
                Err(flow) => return Ok(flow),
            };
            if ctx.phase == Phase::Deliver {
                ctx.resp.body = body;
            } else {
                ctx.obj.response = body;
            }
            Ok(Flow::Next)
        }
        Statement::HashData { expr } => {
            let fragment = match eval_checked(expr, ctx)? {
                Ok(value) => value.to_vcl_string(),
                Err(flow) => return Ok(flow),
            };
            ctx.hash_data.push(fragment);
            Ok(Flow::Next)
        }
        Statement::Goto { label } => Ok(Flow::Jump(label.clone())),
        Statement::Label { .. } => Ok(Flow::Next),
        Statement::Restart => Ok(Flow::Done(Outcome::Restart)),
        Statement::Call { name, args } => {
            let evaluated = match eval_call_args(args, ctx) {
                Ok(values) => values,
                Err(Interrupt::Transition { status, message }) => {
                    apply_error(ctx, status, &message);
                    return Ok(Flow::Done(Outcome::Error { status, message }));
                }
                Err(Interrupt::Fail(e)) => return Err(e.into()),
            };
            match builtins::dispatch(name, &evaluated, ctx) {
                Ok(BuiltinResult::Value(_)) => Ok(Flow::Next),
                Ok(BuiltinResult::Transition { status, message }) => {
                    apply_error(ctx, status, &message);
                    Ok(Flow::Done(Outcome::Error { status, message }))
                }
                Err(e) => Err(e.into()),
            }
        }
        Statement::Declare { name, ty } => {
            ctx.vars.insert(name.clone(), zero_value(*ty));
            Ok(Flow::Next)
        }
    }
}

/// Evaluates an expression inside a statement, converting a builtin
/// transition into the flow that aborts the subroutine
fn eval_checked(expr: &Expression, ctx: &mut VclContext) -> Result<Result<Value, Flow>, VclError> {
    match eval_expr(expr, ctx) {
        Ok(value) => Ok(Ok(value)),
        Err(Interrupt::Transition { status, message }) => {
            apply_error(ctx, status, &message);
            Ok(Err(Flow::Done(Outcome::Error { status, message })))
        }
        Err(Interrupt::Fail(e)) => Err(e.into()),
    }
}

/// Records an error transition on the context
pub fn apply_error(ctx: &mut VclContext, status: i64, message: &str) {
    ctx.obj.status = status;
    ctx.obj.response = message.to_string();
    ctx.fastly_error = Some(message.to_string());
}

fn zero_value(ty: VarType) -> Value {
    match ty {
        VarType::String => Value::Str(String::new()),
        VarType::Integer => Value::Integer(0),
        VarType::Float => Value::Float(0.0),
        VarType::Bool => Value::Bool(false),
        VarType::Time | VarType::Rtime => Value::Duration(0.0),
        VarType::Ip | VarType::Acl | VarType::Backend => Value::Null,
    }
}

// -- expressions ------------------------------------------------------------

/// Evaluates an expression to a value
fn eval_expr(expr: &Expression, ctx: &mut VclContext) -> ExprResult {
    match expr {
        Expression::Str(s) => Ok(Value::Str(s.clone())),
        Expression::Integer(n) => Ok(Value::Integer(*n)),
        Expression::Float(x) => Ok(Value::Float(*x)),
        Expression::Bool(b) => Ok(Value::Bool(*b)),
        Expression::Regex { pattern, flags } => {
            let re = Runtime::global().compile_regex(pattern, flags.contains('i'))?;
            Ok(Value::Regex(re))
        }
        Expression::Ident(name) => Ok(resolve(name, ctx)),
        Expression::Unary { op, operand } => {
            let value = eval_expr(operand, ctx)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                UnaryOp::Neg => match value {
                    Value::Integer(n) => Ok(Value::Integer(-n)),
                    Value::Float(x) => Ok(Value::Float(-x)),
                    Value::Duration(secs) => Ok(Value::Duration(-secs)),
                    other => match other.as_number() {
                        Some(x) => Ok(Value::Float(-x)),
                        None => Err(EvalError::InvalidOperands {
                            op: "-".to_string(),
                        }
                        .into()),
                    },
                },
            }
        }
        Expression::Ternary {
            cond,
            then,
            otherwise,
        } => {
            if eval_expr(cond, ctx)?.truthy() {
                eval_expr(then, ctx)
            } else {
                eval_expr(otherwise, ctx)
            }
        }
        Expression::Call { name, args } => {
            let evaluated = eval_call_args(args, ctx)?;
            match builtins::dispatch(name, &evaluated, ctx) {
                Ok(BuiltinResult::Value(value)) => Ok(value),
                Ok(BuiltinResult::Transition { status, message }) => {
                    Err(Interrupt::Transition { status, message })
                }
                Err(e) => Err(e.into()),
            }
        }
        Expression::Binary { op, left, right } => eval_binary(*op, left, right, ctx),
    }
}

/// Evaluates call arguments; a bare identifier that resolves to nothing
/// (a table, ACL or backend name) is passed through as its own name
fn eval_call_args(args: &[Expression], ctx: &mut VclContext) -> Result<Vec<Value>, Interrupt> {
    let mut evaluated = Vec::with_capacity(args.len());
    for arg in args {
        let value = eval_expr(arg, ctx)?;
        let value = match (&value, arg) {
            (Value::Null, Expression::Ident(name)) => Value::Str(name.clone()),
            _ => value,
        };
        evaluated.push(value);
    }
    Ok(evaluated)
}

fn eval_binary(
    op: BinaryOp,
    left: &Expression,
    right: &Expression,
    ctx: &mut VclContext,
) -> ExprResult {
    // Short-circuit forms first.
    match op {
        BinaryOp::And => {
            let l = eval_expr(left, ctx)?;
            if !l.truthy() {
                return Ok(Value::Bool(false));
            }
            let r = eval_expr(right, ctx)?;
            return Ok(Value::Bool(r.truthy()));
        }
        BinaryOp::Or => {
            let l = eval_expr(left, ctx)?;
            if l.truthy() {
                return Ok(Value::Bool(true));
            }
            let r = eval_expr(right, ctx)?;
            return Ok(Value::Bool(r.truthy()));
        }
        BinaryOp::Match | BinaryOp::NotMatch => {
            let subject = eval_expr(left, ctx)?.to_vcl_string();
            let matched = eval_match(&subject, right, ctx)?;
            return Ok(Value::Bool(if op == BinaryOp::Match {
                matched
            } else {
                !matched
            }));
        }
        _ => {}
    }

    let l = eval_expr(left, ctx)?;
    let r = eval_expr(right, ctx)?;
    let result = match op {
        BinaryOp::Add => l.add(&r)?,
        BinaryOp::Sub => l.sub(&r)?,
        BinaryOp::Mul => l.mul(&r)?,
        BinaryOp::Div => l.div(&r)?,
        BinaryOp::Mod => l.rem(&r)?,
        BinaryOp::Eq => Value::Bool(l.loose_eq(&r)),
        BinaryOp::Ne => Value::Bool(!l.loose_eq(&r)),
        BinaryOp::Lt => Value::Bool(l.compare(&r, "<")?),
        BinaryOp::Le => Value::Bool(l.compare(&r, "<=")?),
        BinaryOp::Gt => Value::Bool(l.compare(&r, ">")?),
        BinaryOp::Ge => Value::Bool(l.compare(&r, ">=")?),
        BinaryOp::And | BinaryOp::Or | BinaryOp::Match | BinaryOp::NotMatch => unreachable!(),
    };
    Ok(result)
}

/// Regex / ACL matching for `~` and `!~`
///
/// An empty subject never matches. An identifier naming an ACL tests
/// membership of the subject address instead of running a regex.
fn eval_match(subject: &str, right: &Expression, ctx: &mut VclContext) -> Result<bool, Interrupt> {
    if subject.is_empty() {
        return Ok(false);
    }
    if let Expression::Ident(name) = right {
        if ctx.acls.contains_key(name.as_str()) {
            return Ok(ctx.acl_matches(name, subject));
        }
    }
    let re = match right {
        Expression::Regex { pattern, flags } => {
            Runtime::global().compile_regex(pattern, flags.contains('i'))?
        }
        other => match eval_expr(other, ctx)? {
            Value::Regex(re) => re,
            value => Runtime::global().compile_regex(&value.to_vcl_string(), false)?,
        },
    };
    Ok(re.is_match(subject))
}

// -- identifier resolution --------------------------------------------------

/// Resolves a dotted identifier against the context
///
/// Header reads of absent headers yield the empty string; unknown paths
/// yield null (silent coercion, mirroring VCL).
pub fn resolve(name: &str, ctx: &VclContext) -> Value {
    if let Some(var) = name.strip_prefix("var.") {
        return ctx.vars.get(&format!("var.{var}")).cloned().unwrap_or(Value::Null);
    }
    if let Some(header) = name.strip_prefix("req.http.") {
        return header_value(ctx.req.http.get(header));
    }
    if let Some(header) = name.strip_prefix("bereq.http.") {
        return header_value(ctx.bereq.http.get(header));
    }
    if let Some(header) = name.strip_prefix("beresp.http.") {
        return header_value(ctx.beresp.http.get(header));
    }
    if let Some(header) = name.strip_prefix("resp.http.") {
        return header_value(ctx.resp.http.get(header));
    }
    if let Some(header) = name.strip_prefix("obj.http.") {
        if !ctx.obj_readable() {
            return Value::Null;
        }
        return header_value(ctx.obj.http.get(header));
    }

    match name {
        "req.url" => Value::Str(ctx.req.url.clone()),
        "req.method" | "req.request" => Value::Str(ctx.req.method.clone()),
        "req.backend" => Value::Str(ctx.req.backend.clone()),
        "bereq.url" => Value::Str(ctx.bereq.url.clone()),
        "bereq.method" => Value::Str(ctx.bereq.method.clone()),
        "beresp.status" => Value::Integer(ctx.beresp.status),
        "beresp.ttl" => Value::Duration(ctx.beresp.ttl),
        "resp.status" => Value::Integer(ctx.resp.status),
        "resp.body" => Value::Str(ctx.resp.body.clone()),
        "client.ip" => Value::Str(ctx.client.ip.clone()),
        "client.identity" => Value::Str(
            ctx.client
                .identity
                .clone()
                .unwrap_or_else(|| ctx.client.ip.clone()),
        ),
        "time.hex" => Value::Str(ctx.time_hex.clone()),
        "fastly.error" => match &ctx.fastly_error {
            Some(message) => Value::Str(message.clone()),
            None => Value::Null,
        },
        "now" => Value::Integer(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0),
        ),
        "obj.status" | "obj.response" | "obj.hits" | "obj.ttl" => {
            if !ctx.obj_readable() {
                return Value::Null;
            }
            match name {
                "obj.status" => Value::Integer(ctx.obj.status),
                "obj.response" => Value::Str(ctx.obj.response.clone()),
                "obj.hits" => Value::Integer(ctx.obj.hits),
                _ => Value::Duration(ctx.obj.ttl),
            }
        }
        _ => {
            trace!(target: "vcl", "unresolved identifier '{name}'");
            Value::Null
        }
    }
}

/// Writes a value to a dotted target; out-of-phase writes are silent no-ops
pub fn assign(target: &str, value: Value, ctx: &mut VclContext) {
    let root = target.split('.').next().unwrap_or("");
    if !ctx.writable(root) {
        debug!(target: "vcl", "ignored write to '{target}' in phase {:?}", ctx.phase);
        return;
    }

    if let Some(var) = target.strip_prefix("var.") {
        ctx.vars.insert(format!("var.{var}"), value);
        return;
    }
    if let Some(header) = target.strip_prefix("req.http.") {
        ctx.req.http.set(header, value.to_vcl_string());
        return;
    }
    if let Some(header) = target.strip_prefix("bereq.http.") {
        ctx.bereq.http.set(header, value.to_vcl_string());
        return;
    }
    if let Some(header) = target.strip_prefix("beresp.http.") {
        ctx.beresp.http.set(header, value.to_vcl_string());
        return;
    }
    if let Some(header) = target.strip_prefix("resp.http.") {
        ctx.resp.http.set(header, value.to_vcl_string());
        return;
    }
    if let Some(header) = target.strip_prefix("obj.http.") {
        ctx.obj.http.set(header, value.to_vcl_string());
        return;
    }

    match target {
        "req.url" => ctx.req.url = value.to_vcl_string(),
        "req.method" | "req.request" => ctx.req.method = value.to_vcl_string(),
        // Switching the active backend; director names resolve to members.
        "req.backend" => {
            let name = value.to_vcl_string();
            ctx.req.backend = ctx.pick_backend(&name);
        }
        "bereq.url" => ctx.bereq.url = value.to_vcl_string(),
        "bereq.method" => ctx.bereq.method = value.to_vcl_string(),
        "beresp.status" => ctx.beresp.status = value.as_number().unwrap_or(0.0) as i64,
        "beresp.ttl" => ctx.beresp.ttl = duration_secs(&value),
        "resp.status" => ctx.resp.status = value.as_number().unwrap_or(0.0) as i64,
        "resp.body" => ctx.resp.body = value.to_vcl_string(),
        "obj.status" => ctx.obj.status = value.as_number().unwrap_or(0.0) as i64,
        "obj.response" => ctx.obj.response = value.to_vcl_string(),
        "obj.ttl" => ctx.obj.ttl = duration_secs(&value),
        "client.identity" => ctx.client.identity = Some(value.to_vcl_string()),
        _ => {
            debug!(target: "vcl", "ignored write to unknown target '{target}'");
        }
    }
}

/// Seconds view of a value destined for a TTL field
fn duration_secs(value: &Value) -> f64 {
    match value {
        Value::Duration(secs) => *secs,
        Value::Str(s) => parse_duration(s)
            .or_else(|| s.trim().parse().ok())
            .unwrap_or(0.0),
        other => other.as_number().unwrap_or(0.0),
    }
}

fn header_value(text: &str) -> Value {
    Value::Str(text.to_string())
}
