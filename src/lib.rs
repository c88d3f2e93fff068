//! # VCL Engine
//!
//! An interpreter for VCL (Varnish Configuration Language), the declarative
//! policy language used to program HTTP cache and edge behavior. Source text
//! is lexed and parsed into a [`Program`], compiled into executable
//! [`Subroutines`], and executed against a mutable request/response
//! [`VclContext`], producing terminal actions (`lookup`, `pass`, `hash`,
//! `fetch`, `deliver`, `restart`, `error`) the host acts on.
//!
//! ## Overview
//!
//! The pipeline, leaves first:
//!
//! 1. **Lexer** ([`lexer`]) — scans source into a flat token stream,
//!    handling VCL's quirks: brace-quoted synthetic blocks `{"…"}`,
//!    time-unit literals (`5m`, `30s`), the regex-match operators `~`/`!~`,
//!    and hyphenated header identifiers.
//! 2. **Parser** ([`parser`]) — recursive descent producing an AST of
//!    subroutines, ACLs, tables, backends, directors, includes and imports,
//!    with diagnostics and resynchronization instead of hard failures.
//! 3. **Context** ([`context`]) — the mutable execution state: `req`,
//!    `bereq`, `beresp`, `resp`, `obj`, `client`, tables and registries.
//! 4. **Evaluator** ([`eval`]) — a statement-pointer tree walker with
//!    explicit control-flow outcomes and `goto` label maps.
//! 5. **Runtime modules** ([`builtins`], [`runtime`]) — table storage,
//!    WAF attack detection and token-bucket rate limiting, rate counters
//!    and penalty boxes, UUID/digest/random/time/accept/querystring
//!    helpers, all behind namespaced function tables.
//! 6. **Driver** ([`engine`]) — runs a named subroutine and returns the
//!    terminal action, handling `vcl_error` transitions and restart bounds.
//!
//! ## Quick Start
//!
//! ```rust
//! use vcl_engine::{execute_vcl, load_vcl_content, VclContext};
//!
//! let subs = load_vcl_content(r#"
//!     sub vcl_recv {
//!         if (req.url ~ "^/api/") {
//!             set req.backend = "api";
//!             return(pass);
//!         }
//!         return(lookup);
//!     }
//! "#);
//!
//! let mut ctx = VclContext::new();
//! ctx.req.url = "/api/users".to_string();
//!
//! let action = execute_vcl(&subs, "vcl_recv", &mut ctx)?;
//! assert_eq!(action, "pass");
//! assert_eq!(ctx.req.backend, "api");
//! # Ok::<(), vcl_engine::VclError>(())
//! ```
//!
//! ## Error pages and the WAF
//!
//! ```rust
//! use vcl_engine::{execute_vcl, load_vcl_content, Runtime, VclContext};
//!
//! Runtime::global().init();
//!
//! let subs = load_vcl_content(r#"
//!     sub vcl_recv {
//!         if (waf.detect_attack(req.url, "sql")) {
//!             error 403 "Forbidden: Suspicious SQL patterns detected";
//!         }
//!         return(lookup);
//!     }
//!     sub vcl_error {
//!         synthetic {"<html><body>Blocked</body></html>"};
//!         return(deliver);
//!     }
//! "#);
//!
//! let mut ctx = VclContext::new();
//! ctx.req.url = "/?q=SELECT%20*%20FROM%20users".to_string();
//!
//! let action = execute_vcl(&subs, "vcl_recv", &mut ctx)?;
//! assert_eq!(action, "deliver");
//! assert_eq!(ctx.obj.status, 403);
//! # Ok::<(), vcl_engine::VclError>(())
//! ```
//!
//! ## Parsing on its own
//!
//! ```rust
//! use vcl_engine::parse_vcl;
//!
//! let program = parse_vcl(r#"
//!     acl trusted { "127.0.0.1"; "192.168.0.0"/16; }
//!     sub vcl_recv { return(lookup); }
//! "#);
//! assert!(program.diagnostics.is_empty());
//! assert_eq!(program.acls[0].entries.len(), 2);
//! ```
//!
//! Malformed input never panics: the lexer skips unknown characters and the
//! parser records [`Diagnostic`]s and resynchronizes, so partially broken
//! sources still yield every declaration that parsed cleanly.
//!
//! ## Concurrency
//!
//! Contexts are per-request and unshared. The process-global state (token
//! buckets, rate counters, penalty boxes, the WAF log, the compiled-regex
//! cache) lives behind [`Runtime`] with one lock per submodule; bucket
//! refill is an atomic read-modify-write and balances never go negative.
//! [`Runtime::init`] resets all of it.

pub mod ast;
pub mod builtins;
pub mod context;
pub mod engine;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod value;

// Re-export the host-facing surface
pub use ast::{Acl, AclEntry, BackendDecl, DirectorDecl, Expression, Program, Statement, Subroutine};
pub use context::{Headers, Phase, VclContext};
pub use engine::{Subroutines, compile, create_vcl_context, execute_vcl, load_vcl_content};
pub use error::{Diagnostic, EvalError, ParseError, Position, VclError};
pub use eval::{Outcome, run_subroutine};
pub use lexer::{LexerConfig, Token, TokenKind, VclLexer};
pub use parser::{ParserConfig, VclParser, parse_vcl};
pub use runtime::Runtime;
pub use value::Value;
