//! Abstract syntax tree for VCL programs
//!
//! Nodes are plain data, immutable after parse and shared read-only across
//! requests. Directors reference backends by name only; resolution happens at
//! execution time through the context registries, so the tree holds no cycles.
//!
//! Every node implements `Display` as a minimal pretty-printer. Re-parsing
//! pretty-printed output yields an equivalent tree, which the round-trip
//! tests rely on.

use crate::error::Diagnostic;
use indexmap::IndexMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::fmt;

/// Call argument list; stores up to 4 arguments inline, which covers every
/// built-in without a heap allocation
pub type CallArgs = SmallVec<[Expression; 4]>;

/// A parsed VCL program: declarations plus collected comments and diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Program {
    /// Subroutines in declaration order
    pub subroutines: Vec<Subroutine>,
    /// Comment text collected during lexing (markers included)
    pub comments: Vec<String>,
    /// Named ACL declarations
    pub acls: Vec<Acl>,
    /// Named table declarations
    pub tables: Vec<TableDecl>,
    /// Named backend declarations
    pub backends: Vec<BackendDecl>,
    /// Named director declarations
    pub directors: Vec<DirectorDecl>,
    /// `include "name"` dependency markers
    pub includes: Vec<String>,
    /// `import name` module markers
    pub imports: Vec<String>,
    /// Non-fatal parse diagnostics; the rest of the program is still usable
    pub diagnostics: Vec<Diagnostic>,
}

impl Program {
    /// Looks up a subroutine by name
    pub fn subroutine(&self, name: &str) -> Option<&Subroutine> {
        self.subroutines.iter().find(|s| s.name == name)
    }
}

/// A named block of statements executed at a request phase
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subroutine {
    /// Subroutine name (`vcl_recv`, `vcl_fetch`, ...)
    pub name: String,
    /// Ordered statement list
    pub body: Vec<Statement>,
}

/// Statement forms of a subroutine body
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Statement {
    /// `set <target> = <expr>;`
    Set {
        /// Dotted target such as `req.http.Host`
        target: String,
        /// Right-hand side
        expr: Expression,
    },
    /// `unset <target>;`
    Unset {
        /// Dotted target to remove
        target: String,
    },
    /// `if (...) { ... } elseif/else ...` — elseif chains nest in `alternate`
    If {
        /// Condition
        test: Expression,
        /// Statements of the true arm
        consequent: Vec<Statement>,
        /// Statements of the false arm (a single nested `If` for elseif)
        alternate: Vec<Statement>,
    },
    /// `return(<action>);` — extended actions preserved verbatim
    Return {
        /// Action string handed to the driver
        action: String,
    },
    /// `error <status> ["message"];`
    Error {
        /// HTTP-ish status code
        status: i64,
        /// Optional message expression
        message: Option<Expression>,
    },
    /// `log <expr>;`
    Log {
        /// Message expression
        expr: Expression,
    },
    /// `synthetic <string-or-brace-string>;`
    Synthetic {
        /// Body expression, possibly a concatenation
        expr: Expression,
    },
    /// `hash_data(<expr>);`
    HashData {
        /// Value appended to the running hash key
        expr: Expression,
    },
    /// `goto <label>;`
    Goto {
        /// Target label name
        label: String,
    },
    /// `<name>:` — a jump target
    Label {
        /// Label name
        name: String,
    },
    /// `restart;`
    Restart,
    /// A built-in invoked for its side effects: `waf.allow();`
    Call {
        /// Fully-qualified dotted function name
        name: String,
        /// Argument expressions
        args: CallArgs,
    },
    /// `declare local var.<name> <TYPE>;`
    Declare {
        /// Variable name including the `var.` prefix
        name: String,
        /// Declared type
        ty: VarType,
    },
}

/// Types available to `declare local`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VarType {
    String,
    Integer,
    Float,
    Bool,
    Time,
    Rtime,
    Ip,
    Acl,
    Backend,
}

impl VarType {
    /// Parses a declaration type name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "STRING" => Some(Self::String),
            "INTEGER" => Some(Self::Integer),
            "FLOAT" => Some(Self::Float),
            "BOOL" => Some(Self::Bool),
            "TIME" => Some(Self::Time),
            "RTIME" => Some(Self::Rtime),
            "IP" => Some(Self::Ip),
            "ACL" => Some(Self::Acl),
            "BACKEND" => Some(Self::Backend),
            _ => None,
        }
    }

    /// Returns the declaration spelling
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Bool => "BOOL",
            Self::Time => "TIME",
            Self::Rtime => "RTIME",
            Self::Ip => "IP",
            Self::Acl => "ACL",
            Self::Backend => "BACKEND",
        }
    }
}

/// Binary operators in precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    /// Regex match `~`
    Match,
    /// Negated regex match `!~`
    NotMatch,
}

impl BinaryOp {
    /// Maps an operator lexeme to its variant
    pub fn from_lexeme(op: &str) -> Option<Self> {
        match op {
            "+" => Some(Self::Add),
            "-" => Some(Self::Sub),
            "*" => Some(Self::Mul),
            "/" => Some(Self::Div),
            "%" => Some(Self::Mod),
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "&&" => Some(Self::And),
            "||" => Some(Self::Or),
            "~" => Some(Self::Match),
            "!~" => Some(Self::NotMatch),
            _ => None,
        }
    }

    /// Returns the source spelling
    pub fn lexeme(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Match => "~",
            Self::NotMatch => "!~",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    /// Logical negation `!`
    Not,
    /// Arithmetic negation `-`
    Neg,
}

/// Expression forms
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expression {
    /// Binary operation
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        left: Box<Expression>,
        /// Right operand
        right: Box<Expression>,
    },
    /// `cond ? then : otherwise`
    Ternary {
        /// Condition
        cond: Box<Expression>,
        /// Value when true
        then: Box<Expression>,
        /// Value when false
        otherwise: Box<Expression>,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expression>,
    },
    /// Call of a namespaced built-in: `digest.hash_sha256("x")`
    Call {
        /// Fully-qualified dotted function name
        name: String,
        /// Argument expressions
        args: Box<CallArgs>,
    },
    /// Dotted identifier reference
    Ident(String),
    /// String literal (decoded)
    Str(String),
    /// `true` / `false`
    Bool(bool),
    /// Integer literal
    Integer(i64),
    /// Float literal
    Float(f64),
    /// Regex literal attached to the right side of `~` / `!~`
    Regex {
        /// Pattern text
        pattern: String,
        /// Trailing flags (`i`, ...), empty for the case-sensitive default
        flags: String,
    },
}

/// A single ACL entry: IPv4 address with optional CIDR subnet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AclEntry {
    /// Dotted-quad address text
    pub ip: String,
    /// CIDR prefix length when present
    pub subnet: Option<u8>,
    /// `!` negation prefix; a negated match rejects
    pub negated: bool,
}

/// A named list of IP/CIDR entries used for membership tests
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Acl {
    /// ACL name
    pub name: String,
    /// Entries in declaration order
    pub entries: Vec<AclEntry>,
}

/// Literal value forms allowed in a table entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TableValue {
    Str(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    /// Pattern stored as text; compiled on lookup
    Regex(String),
}

/// A named table of key/value entries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableDecl {
    /// Table name
    pub name: String,
    /// Ordered entries
    pub entries: Vec<(String, TableValue)>,
}

/// A backend property value: scalar or nested block (probes)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BackendValue {
    /// Scalar property
    Literal(Expression),
    /// Nested block such as `.probe = { ... }`
    Block(IndexMap<String, BackendValue>),
}

/// A named origin declaration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendDecl {
    /// Backend name
    pub name: String,
    /// Properties in declaration order
    pub properties: IndexMap<String, BackendValue>,
}

/// Load-balancing policies a director can use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DirectorKind {
    Random,
    Hash,
    Client,
    Fallback,
    Chash,
}

impl DirectorKind {
    /// Parses a director type name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "random" => Some(Self::Random),
            "hash" => Some(Self::Hash),
            "client" => Some(Self::Client),
            "fallback" => Some(Self::Fallback),
            "chash" => Some(Self::Chash),
            _ => None,
        }
    }

    /// Returns the source spelling
    pub fn name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Hash => "hash",
            Self::Client => "client",
            Self::Fallback => "fallback",
            Self::Chash => "chash",
        }
    }
}

/// A weighted backend reference inside a director
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectorBackend {
    /// Referenced backend name, resolved at execution time
    pub name: String,
    /// Selection weight
    pub weight: i64,
}

/// A named load-balancing policy over a set of backends
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectorDecl {
    /// Director name
    pub name: String,
    /// Policy type
    pub kind: DirectorKind,
    /// Member backends with weights
    pub backends: Vec<DirectorBackend>,
    /// `.quorum` percentage when declared
    pub quorum: Option<i64>,
    /// `.retries` count when declared
    pub retries: Option<i64>,
}

// ---------------------------------------------------------------------------
// Pretty-printer

fn write_block(f: &mut fmt::Formatter<'_>, body: &[Statement], indent: usize) -> fmt::Result {
    for stmt in body {
        stmt.fmt_indented(f, indent)?;
    }
    Ok(())
}

impl Statement {
    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "  ".repeat(indent);
        match self {
            Statement::Set { target, expr } => writeln!(f, "{pad}set {target} = {expr};"),
            Statement::Unset { target } => writeln!(f, "{pad}unset {target};"),
            Statement::If {
                test,
                consequent,
                alternate,
            } => {
                writeln!(f, "{pad}if ({test}) {{")?;
                write_block(f, consequent, indent + 1)?;
                if alternate.is_empty() {
                    writeln!(f, "{pad}}}")
                } else {
                    writeln!(f, "{pad}}} else {{")?;
                    write_block(f, alternate, indent + 1)?;
                    writeln!(f, "{pad}}}")
                }
            }
            Statement::Return { action } => {
                if action.is_empty() {
                    writeln!(f, "{pad}return;")
                } else {
                    writeln!(f, "{pad}return({action});")
                }
            }
            Statement::Error { status, message } => match message {
                Some(msg) => writeln!(f, "{pad}error {status} {msg};"),
                None => writeln!(f, "{pad}error {status};"),
            },
            Statement::Log { expr } => writeln!(f, "{pad}log {expr};"),
            Statement::Synthetic { expr } => writeln!(f, "{pad}synthetic {expr};"),
            Statement::HashData { expr } => writeln!(f, "{pad}hash_data({expr});"),
            Statement::Goto { label } => writeln!(f, "{pad}goto {label};"),
            Statement::Label { name } => writeln!(f, "{pad}{name}:"),
            Statement::Restart => writeln!(f, "{pad}restart;"),
            Statement::Call { name, args } => {
                write!(f, "{pad}{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                writeln!(f, ");")
            }
            Statement::Declare { name, ty } => {
                writeln!(f, "{pad}declare local {name} {};", ty.name())
            }
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Binary { op, left, right } => {
                write!(f, "({} {} {})", left, op.lexeme(), right)
            }
            Expression::Ternary {
                cond,
                then,
                otherwise,
            } => write!(f, "({cond} ? {then} : {otherwise})"),
            Expression::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!({operand})"),
                UnaryOp::Neg => write!(f, "-({operand})"),
            },
            Expression::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expression::Ident(name) => write!(f, "{name}"),
            Expression::Str(s) => write!(f, "{}", escape_string(s)),
            Expression::Bool(b) => write!(f, "{b}"),
            Expression::Integer(n) => write!(f, "{n}"),
            Expression::Float(x) => write!(f, "{x}"),
            Expression::Regex { pattern, flags } => {
                if flags.is_empty() {
                    write!(f, "{}", escape_string(pattern))
                } else {
                    write!(f, "{}", escape_string(&format!("/{pattern}/{flags}")))
                }
            }
        }
    }
}

impl fmt::Display for Subroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sub {} {{", self.name)?;
        write_block(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "acl {} {{", self.name)?;
        for entry in &self.entries {
            let neg = if entry.negated { "!" } else { "" };
            match entry.subnet {
                Some(bits) => writeln!(f, "  {neg}\"{}\"/{bits};", entry.ip)?,
                None => writeln!(f, "  {neg}\"{}\";", entry.ip)?,
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for TableDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "table {} {{", self.name)?;
        for (key, value) in &self.entries {
            write!(f, "  {}: ", escape_string(key))?;
            match value {
                TableValue::Str(s) => write!(f, "{}", escape_string(s))?,
                TableValue::Integer(n) => write!(f, "{n}")?,
                TableValue::Float(x) => write!(f, "{x}")?,
                TableValue::Bool(b) => write!(f, "{b}")?,
                TableValue::Regex(p) => write!(f, "{}", escape_string(p))?,
            }
            writeln!(f, ",")?;
        }
        writeln!(f, "}}")
    }
}

fn write_backend_value(
    f: &mut fmt::Formatter<'_>,
    value: &BackendValue,
    indent: usize,
) -> fmt::Result {
    match value {
        BackendValue::Literal(expr) => write!(f, "{expr}"),
        BackendValue::Block(props) => {
            writeln!(f, "{{")?;
            let pad = "  ".repeat(indent + 1);
            for (name, inner) in props {
                write!(f, "{pad}.{name} = ")?;
                write_backend_value(f, inner, indent + 1)?;
                writeln!(f, ";")?;
            }
            write!(f, "{}}}", "  ".repeat(indent))
        }
    }
}

impl fmt::Display for BackendDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "backend {} {{", self.name)?;
        for (name, value) in &self.properties {
            write!(f, "  .{name} = ")?;
            write_backend_value(f, value, 1)?;
            writeln!(f, ";")?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for DirectorDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "director {} {} {{", self.name, self.kind.name())?;
        if let Some(quorum) = self.quorum {
            writeln!(f, "  .quorum = {quorum};")?;
        }
        if let Some(retries) = self.retries {
            writeln!(f, "  .retries = {retries};")?;
        }
        for member in &self.backends {
            writeln!(
                f,
                "  {{ .backend = {}; .weight = {}; }}",
                member.name, member.weight
            )?;
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for name in &self.includes {
            writeln!(f, "include \"{name}\";")?;
        }
        for name in &self.imports {
            writeln!(f, "import {name};")?;
        }
        for acl in &self.acls {
            write!(f, "{acl}")?;
        }
        for table in &self.tables {
            write!(f, "{table}")?;
        }
        for backend in &self.backends {
            write!(f, "{backend}")?;
        }
        for director in &self.directors {
            write!(f, "{director}")?;
        }
        for sub in &self.subroutines {
            write!(f, "{sub}")?;
        }
        Ok(())
    }
}
