//! Built-in function registry
//!
//! Every runtime function callable from VCL is dispatched here by its
//! fully-qualified dotted name. Arity is validated; argument types follow
//! VCL's coercion rules (stringify / numeric view) rather than failing.
//! Unknown names raise [`EvalError::UnknownFunction`].
//!
//! The `std.` prefix is optional on namespaced modules, so both
//! `std.table.lookup` and `table.lookup` resolve.

use crate::context::VclContext;
use crate::error::EvalError;
use crate::runtime::Runtime;
use crate::value::Value;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use md5::Md5;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::{Regex, RegexBuilder};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Result of a built-in call
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinResult {
    /// Ordinary return value
    Value(Value),
    /// An error transition requested by the callee (`waf.block`)
    Transition {
        /// Status for `obj.status`
        status: i64,
        /// Message for `obj.response` / `fastly.error`
        message: String,
    },
}

impl BuiltinResult {
    fn value(v: Value) -> Result<Self, EvalError> {
        Ok(BuiltinResult::Value(v))
    }

    fn bool(b: bool) -> Result<Self, EvalError> {
        Self::value(Value::Bool(b))
    }

    fn str(s: impl Into<String>) -> Result<Self, EvalError> {
        Self::value(Value::Str(s.into()))
    }

    fn int(n: i64) -> Result<Self, EvalError> {
        Self::value(Value::Integer(n))
    }
}

/// Attack-pattern table, compiled once; all patterns are case-insensitive
static ATTACK_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    let compile = |pattern: &str| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .expect("attack pattern compiles")
    };
    vec![
        (
            "sql",
            compile(
                r"union\s+select|select\s+.+\s+from|insert\s+into|update\s+set|delete\s+from|drop\s+table|exec\s+xp_|'--",
            ),
        ),
        ("xss", compile(r"<script|javascript:|on\w+\s*=|alert\s*\(")),
        (
            "path",
            compile(r"\.\./|\.\.\\|%2e%2e%2f|%2e%2e/|\.\.%2f"),
        ),
        ("command", compile(r"\|\s*\w+|;\s*\w+\s*;|`\s*\w+")),
        (
            "lfi",
            compile(r"/etc/passwd|/etc/shadow|/proc/self|/var/log"),
        ),
        ("rfi", compile(r"https?://|ftp://|php://|data://")),
    ]
});

/// Percent-decodes request data before pattern matching, so encoded probes
/// (`%20`, `+`) are seen the way the origin would see them
fn decode_for_inspection(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let decoded = data
                    .get(i + 1..i + 3)
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match decoded {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// True iff `data` matches the pattern for `kind`; `any` ORs all patterns
pub fn detect_attack(data: &str, kind: &str) -> bool {
    if data.is_empty() {
        return false;
    }
    let decoded = decode_for_inspection(data);
    ATTACK_PATTERNS
        .iter()
        .filter(|(name, _)| kind == "any" || *name == kind)
        .any(|(_, re)| re.is_match(data) || re.is_match(&decoded))
}

// -- argument helpers -------------------------------------------------------

fn want(name: &str, args: &[Value], expected: usize) -> Result<(), EvalError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(EvalError::BadArity {
            name: name.to_string(),
            expected: expected.to_string(),
            got: args.len(),
        })
    }
}

fn want_between(name: &str, args: &[Value], lo: usize, hi: usize) -> Result<(), EvalError> {
    if (lo..=hi).contains(&args.len()) {
        Ok(())
    } else {
        Err(EvalError::BadArity {
            name: name.to_string(),
            expected: format!("{lo}..{hi}"),
            got: args.len(),
        })
    }
}

fn arg_str(args: &[Value], i: usize) -> String {
    args.get(i).map(Value::to_vcl_string).unwrap_or_default()
}

fn arg_num(args: &[Value], i: usize) -> f64 {
    args.get(i).and_then(Value::as_number).unwrap_or(0.0)
}

fn arg_int(args: &[Value], i: usize) -> i64 {
    arg_num(args, i) as i64
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Dispatches a built-in call by fully-qualified dotted name
pub fn dispatch(
    name: &str,
    args: &[Value],
    ctx: &mut VclContext,
) -> Result<BuiltinResult, EvalError> {
    let short = name.strip_prefix("std.").unwrap_or(name);
    match short {
        // -- WAF ------------------------------------------------------------
        "waf.allow" => {
            want(name, args, 0)?;
            BuiltinResult::bool(true)
        }
        "waf.block" => {
            want_between(name, args, 1, 2)?;
            Ok(BuiltinResult::Transition {
                status: arg_int(args, 0),
                message: if args.len() > 1 {
                    arg_str(args, 1)
                } else {
                    "Forbidden".to_string()
                },
            })
        }
        "waf.log" => {
            want(name, args, 1)?;
            let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            Runtime::global().waf_log_append(format!("{stamp} [WAF] {}", arg_str(args, 0)));
            BuiltinResult::bool(true)
        }
        "waf.detect_attack" => {
            want(name, args, 2)?;
            BuiltinResult::bool(detect_attack(&arg_str(args, 0), &arg_str(args, 1)))
        }
        "waf.rate_limit" => {
            want(name, args, 3)?;
            let allowed = Runtime::global().rate_limit(
                &arg_str(args, 0),
                arg_num(args, 1),
                arg_num(args, 2),
            );
            BuiltinResult::bool(allowed)
        }
        "waf.rate_limit_tokens" => {
            want(name, args, 1)?;
            BuiltinResult::int(Runtime::global().rate_limit_tokens(&arg_str(args, 0)))
        }

        // -- table store ----------------------------------------------------
        "table.add" => {
            want(name, args, 1)?;
            let table = arg_str(args, 0);
            ctx.tables.entry(table).or_default();
            BuiltinResult::bool(true)
        }
        "table.add_entry" => {
            want(name, args, 3)?;
            let table = arg_str(args, 0);
            let key = arg_str(args, 1);
            let stored = match &args[2] {
                Value::Bool(b) => crate::ast::TableValue::Bool(*b),
                Value::Integer(n) => crate::ast::TableValue::Integer(*n),
                Value::Float(x) => crate::ast::TableValue::Float(*x),
                Value::Regex(re) => crate::ast::TableValue::Regex(re.as_str().to_string()),
                other => crate::ast::TableValue::Str(other.to_vcl_string()),
            };
            ctx.tables.entry(table).or_default().insert(key, stored);
            BuiltinResult::bool(true)
        }
        "table.lookup" => {
            want_between(name, args, 2, 3)?;
            let fallback = if args.len() > 2 {
                arg_str(args, 2)
            } else {
                String::new()
            };
            let found = table_get(ctx, &arg_str(args, 0), &arg_str(args, 1))
                .map(table_value_to_string)
                .unwrap_or(fallback);
            BuiltinResult::str(found)
        }
        "table.lookup_bool" => {
            want_between(name, args, 2, 3)?;
            let fallback = args.get(2).map(Value::truthy).unwrap_or(false);
            let found = match table_get(ctx, &arg_str(args, 0), &arg_str(args, 1)) {
                Some(crate::ast::TableValue::Bool(b)) => *b,
                Some(crate::ast::TableValue::Str(s)) if s == "true" => true,
                Some(crate::ast::TableValue::Str(s)) if s == "false" => false,
                _ => fallback,
            };
            BuiltinResult::bool(found)
        }
        "table.lookup_integer" => {
            want_between(name, args, 2, 3)?;
            let fallback = args.get(2).and_then(Value::as_number).unwrap_or(0.0) as i64;
            let found = match table_get(ctx, &arg_str(args, 0), &arg_str(args, 1)) {
                Some(crate::ast::TableValue::Integer(n)) => *n,
                Some(crate::ast::TableValue::Float(x)) => *x as i64,
                Some(crate::ast::TableValue::Str(s)) => s.parse().unwrap_or(fallback),
                _ => fallback,
            };
            BuiltinResult::int(found)
        }
        "table.lookup_float" => {
            want_between(name, args, 2, 3)?;
            let fallback = args.get(2).and_then(Value::as_number).unwrap_or(0.0);
            let found = match table_get(ctx, &arg_str(args, 0), &arg_str(args, 1)) {
                Some(crate::ast::TableValue::Float(x)) => *x,
                Some(crate::ast::TableValue::Integer(n)) => *n as f64,
                Some(crate::ast::TableValue::Str(s)) => s.parse().unwrap_or(fallback),
                _ => fallback,
            };
            BuiltinResult::value(Value::Float(found))
        }
        "table.lookup_regex" => {
            want(name, args, 2)?;
            let pattern = match table_get(ctx, &arg_str(args, 0), &arg_str(args, 1)) {
                Some(crate::ast::TableValue::Regex(p)) => p.clone(),
                Some(crate::ast::TableValue::Str(s)) => s.clone(),
                // The empty regex is the zero value.
                _ => "(?:)".to_string(),
            };
            let compiled = Runtime::global()
                .compile_regex(&pattern, false)
                .or_else(|_| Runtime::global().compile_regex("(?:)", false))?;
            BuiltinResult::value(Value::Regex(compiled))
        }
        "table.contains" => {
            want(name, args, 2)?;
            BuiltinResult::bool(table_get(ctx, &arg_str(args, 0), &arg_str(args, 1)).is_some())
        }

        // -- rate-limit counters ---------------------------------------------
        "ratelimit.open_window" => {
            want(name, args, 1)?;
            BuiltinResult::str(Runtime::global().open_window(arg_num(args, 0)))
        }
        "ratelimit.ratecounter_increment" => {
            want_between(name, args, 1, 2)?;
            let delta = if args.len() > 1 { arg_int(args, 1) } else { 1 };
            BuiltinResult::int(Runtime::global().ratecounter_increment(&arg_str(args, 0), delta))
        }
        "ratelimit.check_rate" => {
            want(name, args, 2)?;
            BuiltinResult::bool(Runtime::global().check_rate(&arg_str(args, 0), arg_int(args, 1)))
        }
        "ratelimit.check_rates" => {
            want(name, args, 2)?;
            BuiltinResult::bool(Runtime::global().check_rates(&arg_str(args, 0), &arg_str(args, 1)))
        }
        "ratelimit.penaltybox_add" => {
            want(name, args, 3)?;
            BuiltinResult::bool(Runtime::global().penaltybox_add(
                &arg_str(args, 0),
                &arg_str(args, 1),
                arg_num(args, 2),
            ))
        }
        "ratelimit.penaltybox_has" => {
            want(name, args, 2)?;
            BuiltinResult::bool(
                Runtime::global().penaltybox_has(&arg_str(args, 0), &arg_str(args, 1)),
            )
        }

        // -- uuid -----------------------------------------------------------
        "uuid.version3" => {
            want(name, args, 2)?;
            let ns = Uuid::parse_str(&arg_str(args, 0)).unwrap_or(Uuid::NAMESPACE_DNS);
            BuiltinResult::str(Uuid::new_v3(&ns, arg_str(args, 1).as_bytes()).to_string())
        }
        "uuid.version4" => {
            want(name, args, 0)?;
            BuiltinResult::str(Uuid::new_v4().to_string())
        }
        "uuid.version5" => {
            want(name, args, 2)?;
            let ns = Uuid::parse_str(&arg_str(args, 0)).unwrap_or(Uuid::NAMESPACE_DNS);
            BuiltinResult::str(Uuid::new_v5(&ns, arg_str(args, 1).as_bytes()).to_string())
        }
        "uuid.dns" => {
            want(name, args, 1)?;
            BuiltinResult::str(
                Uuid::new_v5(&Uuid::NAMESPACE_DNS, arg_str(args, 0).as_bytes()).to_string(),
            )
        }
        "uuid.url" => {
            want(name, args, 1)?;
            BuiltinResult::str(
                Uuid::new_v5(&Uuid::NAMESPACE_URL, arg_str(args, 0).as_bytes()).to_string(),
            )
        }
        "uuid.is_valid" => {
            want(name, args, 1)?;
            BuiltinResult::bool(Uuid::parse_str(&arg_str(args, 0)).is_ok())
        }
        "uuid.is_version3" | "uuid.is_version4" | "uuid.is_version5" => {
            want(name, args, 1)?;
            let version: usize = short.chars().last().and_then(|c| c.to_digit(10)).unwrap_or(0)
                as usize;
            let ok = Uuid::parse_str(&arg_str(args, 0))
                .map(|u| u.get_version_num() == version)
                .unwrap_or(false);
            BuiltinResult::bool(ok)
        }
        "uuid.decode" => {
            want(name, args, 1)?;
            match Uuid::parse_str(&arg_str(args, 0)) {
                Ok(u) => BuiltinResult::str(u.simple().to_string()),
                Err(_) => BuiltinResult::str(""),
            }
        }
        "uuid.encode" => {
            want(name, args, 1)?;
            match Uuid::parse_str(&arg_str(args, 0)) {
                Ok(u) => BuiltinResult::str(u.hyphenated().to_string()),
                Err(_) => BuiltinResult::str(""),
            }
        }

        // -- digest -----------------------------------------------------------
        "digest.hash_sha256" => {
            want(name, args, 1)?;
            BuiltinResult::str(hex::encode(Sha256::digest(arg_str(args, 0).as_bytes())))
        }
        "digest.hash_sha512" => {
            want(name, args, 1)?;
            BuiltinResult::str(hex::encode(Sha512::digest(arg_str(args, 0).as_bytes())))
        }
        "digest.hash_sha1" => {
            want(name, args, 1)?;
            BuiltinResult::str(hex::encode(Sha1::digest(arg_str(args, 0).as_bytes())))
        }
        "digest.hash_md5" => {
            want(name, args, 1)?;
            BuiltinResult::str(hex::encode(Md5::digest(arg_str(args, 0).as_bytes())))
        }
        "digest.base64" => {
            want(name, args, 1)?;
            BuiltinResult::str(BASE64.encode(arg_str(args, 0).as_bytes()))
        }
        "digest.base64_decode" => {
            want(name, args, 1)?;
            let decoded = BASE64
                .decode(arg_str(args, 0).as_bytes())
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            BuiltinResult::str(decoded)
        }
        "digest.hmac_sha256" => {
            want(name, args, 2)?;
            let mut mac = Hmac::<Sha256>::new_from_slice(arg_str(args, 0).as_bytes())
                .expect("hmac accepts any key length");
            mac.update(arg_str(args, 1).as_bytes());
            BuiltinResult::str(hex::encode(mac.finalize().into_bytes()))
        }

        // -- random -----------------------------------------------------------
        "random.randombool" | "randombool" => {
            want(name, args, 1)?;
            BuiltinResult::bool(rand::thread_rng().r#gen::<f64>() < arg_num(args, 0))
        }
        "random.randombool_seeded" | "randombool_seeded" => {
            want(name, args, 2)?;
            let mut rng = StdRng::seed_from_u64(arg_num(args, 1) as u64);
            BuiltinResult::bool(rng.r#gen::<f64>() < arg_num(args, 0))
        }
        "random.randomint" | "randomint" => {
            want(name, args, 2)?;
            let (lo, hi) = ordered(arg_int(args, 0), arg_int(args, 1));
            BuiltinResult::int(rand::thread_rng().gen_range(lo..=hi))
        }
        "random.randomint_seeded" | "randomint_seeded" => {
            want(name, args, 3)?;
            let (lo, hi) = ordered(arg_int(args, 0), arg_int(args, 1));
            let mut rng = StdRng::seed_from_u64(arg_num(args, 2) as u64);
            BuiltinResult::int(rng.gen_range(lo..=hi))
        }
        "random.randomstr" | "randomstr" => {
            want_between(name, args, 1, 2)?;
            let len = arg_int(args, 0).max(0) as usize;
            let charset = if args.len() > 1 {
                arg_str(args, 1)
            } else {
                "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789".to_string()
            };
            let chars: Vec<char> = charset.chars().collect();
            if chars.is_empty() {
                return BuiltinResult::str("");
            }
            let mut rng = rand::thread_rng();
            let out: String = (0..len)
                .map(|_| chars[rng.gen_range(0..chars.len())])
                .collect();
            BuiltinResult::str(out)
        }

        // -- time -------------------------------------------------------------
        "time.hex_to_time" => {
            want(name, args, 1)?;
            let hex = arg_str(args, 0);
            // The leading 8 hex chars of the 24-char token carry the epoch
            // seconds; the rest is entropy.
            let seconds = hex
                .get(..8)
                .and_then(|prefix| u32::from_str_radix(prefix, 16).ok())
                .unwrap_or(0);
            BuiltinResult::int(seconds as i64)
        }
        "time.now" => {
            want(name, args, 0)?;
            BuiltinResult::int(epoch_seconds())
        }

        // -- accept header negotiation ---------------------------------------
        "accept.language_lookup" => {
            want(name, args, 3)?;
            BuiltinResult::str(language_lookup(
                &arg_str(args, 0),
                &arg_str(args, 1),
                &arg_str(args, 2),
            ))
        }
        "accept.charset_lookup" => {
            want(name, args, 3)?;
            BuiltinResult::str(charset_lookup(
                &arg_str(args, 0),
                &arg_str(args, 1),
                &arg_str(args, 2),
            ))
        }
        "accept.media_lookup" => {
            want(name, args, 3)?;
            BuiltinResult::str(media_lookup(
                &arg_str(args, 0),
                &arg_str(args, 1),
                &arg_str(args, 2),
            ))
        }

        // -- addresses --------------------------------------------------------
        "addr.is_ipv4" => {
            want(name, args, 1)?;
            BuiltinResult::bool(arg_str(args, 0).parse::<Ipv4Addr>().is_ok())
        }
        "addr.is_ipv6" => {
            want(name, args, 1)?;
            BuiltinResult::bool(arg_str(args, 0).parse::<Ipv6Addr>().is_ok())
        }

        // -- query strings ----------------------------------------------------
        "querystring.get" => {
            want(name, args, 2)?;
            let url = arg_str(args, 0);
            let wanted = arg_str(args, 1);
            let found = query_pairs(&url)
                .into_iter()
                .find(|(k, _)| *k == wanted)
                .map(|(_, v)| v)
                .unwrap_or_default();
            BuiltinResult::str(found)
        }
        "querystring.set" => {
            want(name, args, 3)?;
            let url = arg_str(args, 0);
            let key = arg_str(args, 1);
            let value = arg_str(args, 2);
            let (path, _) = split_query(&url);
            let mut pairs = query_pairs(&url);
            match pairs.iter_mut().find(|(k, _)| *k == key) {
                Some(pair) => pair.1 = value,
                None => pairs.push((key, value)),
            }
            BuiltinResult::str(join_query(path, &pairs))
        }
        "querystring.remove" => {
            want(name, args, 2)?;
            let url = arg_str(args, 0);
            let key = arg_str(args, 1);
            let (path, _) = split_query(&url);
            let mut pairs = query_pairs(&url);
            pairs.retain(|(k, _)| *k != key);
            BuiltinResult::str(join_query(path, &pairs))
        }
        "querystring.sort" => {
            want(name, args, 1)?;
            let url = arg_str(args, 0);
            let (path, _) = split_query(&url);
            let mut pairs = query_pairs(&url);
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            BuiltinResult::str(join_query(path, &pairs))
        }

        // -- http -------------------------------------------------------------
        "http.status_matches" => {
            want(name, args, 2)?;
            let status = arg_int(args, 0);
            let matched = arg_str(args, 1)
                .split(',')
                .filter_map(|part| part.trim().parse::<i64>().ok())
                .any(|code| code == status);
            BuiltinResult::bool(matched)
        }

        // -- std string/number helpers ---------------------------------------
        "tolower" => {
            want(name, args, 1)?;
            BuiltinResult::str(arg_str(args, 0).to_lowercase())
        }
        "toupper" => {
            want(name, args, 1)?;
            BuiltinResult::str(arg_str(args, 0).to_uppercase())
        }
        "strlen" => {
            want(name, args, 1)?;
            BuiltinResult::int(arg_str(args, 0).chars().count() as i64)
        }
        "strstr" => {
            want(name, args, 2)?;
            let haystack = arg_str(args, 0);
            let needle = arg_str(args, 1);
            let found = haystack
                .find(&needle)
                .map(|idx| haystack[idx..].to_string())
                .unwrap_or_default();
            BuiltinResult::str(found)
        }
        "strrep" => {
            want(name, args, 2)?;
            BuiltinResult::str(arg_str(args, 0).repeat(arg_int(args, 1).max(0) as usize))
        }
        "prefixof" => {
            want(name, args, 2)?;
            BuiltinResult::bool(arg_str(args, 0).starts_with(&arg_str(args, 1)))
        }
        "suffixof" => {
            want(name, args, 2)?;
            BuiltinResult::bool(arg_str(args, 0).ends_with(&arg_str(args, 1)))
        }
        "atoi" => {
            want(name, args, 1)?;
            BuiltinResult::int(arg_str(args, 0).trim().parse().unwrap_or(0))
        }
        "atof" => {
            want(name, args, 1)?;
            BuiltinResult::value(Value::Float(arg_str(args, 0).trim().parse().unwrap_or(0.0)))
        }
        "itoa" => {
            want(name, args, 1)?;
            BuiltinResult::str(arg_int(args, 0).to_string())
        }

        _ => Err(EvalError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn ordered(a: i64, b: i64) -> (i64, i64) {
    if a <= b { (a, b) } else { (b, a) }
}

fn table_get<'c>(
    ctx: &'c VclContext,
    table: &str,
    key: &str,
) -> Option<&'c crate::ast::TableValue> {
    ctx.tables.get(table)?.get(key)
}

fn table_value_to_string(value: &crate::ast::TableValue) -> String {
    match value {
        crate::ast::TableValue::Str(s) => s.clone(),
        crate::ast::TableValue::Integer(n) => n.to_string(),
        crate::ast::TableValue::Float(x) => Value::Float(*x).to_vcl_string(),
        crate::ast::TableValue::Bool(b) => b.to_string(),
        crate::ast::TableValue::Regex(p) => p.clone(),
    }
}

// -- accept header negotiation ----------------------------------------------

/// Parses an Accept-style header into `(token, q)` pairs in listed order;
/// q defaults to 1.0 and is clamped to [0, 1]
fn parse_accept(header: &str) -> Vec<(String, f64)> {
    header
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut token = part;
            let mut q = 1.0f64;
            for param in part.split(';').skip(1) {
                if let Some(value) = param.trim().strip_prefix("q=") {
                    q = value.parse().unwrap_or(1.0);
                }
            }
            if let Some((head, _)) = part.split_once(';') {
                token = head.trim();
            }
            (token.to_string(), q.clamp(0.0, 1.0))
        })
        .collect()
}

/// Picks the best entry of `available` (colon-separated) for the header,
/// matching on the primary subtag before `-`; ties break by first
/// appearance in `available`
fn language_lookup(available: &str, default: &str, header: &str) -> String {
    let entries: Vec<&str> = available.split(':').filter(|s| !s.is_empty()).collect();
    let mut best: Option<(f64, usize)> = None;
    for (token, q) in parse_accept(header) {
        let primary = token.split('-').next().unwrap_or("").to_lowercase();
        if primary.is_empty() {
            continue;
        }
        if let Some(idx) = entries
            .iter()
            .position(|entry| entry.split('-').next().unwrap_or("").eq_ignore_ascii_case(&primary))
        {
            let better = match best {
                None => true,
                Some((best_q, best_idx)) => q > best_q || (q == best_q && idx < best_idx),
            };
            if better {
                best = Some((q, idx));
            }
        }
    }
    match best {
        Some((_, idx)) => entries[idx].to_string(),
        None => default.to_string(),
    }
}

/// Exact-token variant used for charset and encoding negotiation
fn charset_lookup(available: &str, default: &str, header: &str) -> String {
    let entries: Vec<&str> = available.split(':').filter(|s| !s.is_empty()).collect();
    let mut best: Option<(f64, usize)> = None;
    for (token, q) in parse_accept(header) {
        if let Some(idx) = entries
            .iter()
            .position(|entry| entry.eq_ignore_ascii_case(&token))
        {
            let better = match best {
                None => true,
                Some((best_q, best_idx)) => q > best_q || (q == best_q && idx < best_idx),
            };
            if better {
                best = Some((q, idx));
            }
        }
    }
    match best {
        Some((_, idx)) => entries[idx].to_string(),
        None => default.to_string(),
    }
}

/// Media-range variant supporting `*/*` and `type/*` wildcards
fn media_lookup(available: &str, default: &str, header: &str) -> String {
    let entries: Vec<&str> = available.split(':').filter(|s| !s.is_empty()).collect();
    let mut ranges = parse_accept(header);
    // Highest q first; original order breaks ties.
    ranges.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    for (range, _) in ranges {
        let matched = entries.iter().find(|entry| {
            if range == "*/*" {
                true
            } else if let Some(kind) = range.strip_suffix("/*") {
                entry
                    .split('/')
                    .next()
                    .is_some_and(|t| t.eq_ignore_ascii_case(kind))
            } else {
                entry.eq_ignore_ascii_case(&range)
            }
        });
        if let Some(entry) = matched {
            return entry.to_string();
        }
    }
    default.to_string()
}

// -- query string helpers ----------------------------------------------------

fn split_query(url: &str) -> (&str, &str) {
    match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url, ""),
    }
}

fn query_pairs(url: &str) -> Vec<(String, String)> {
    let (_, query) = split_query(url);
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

fn join_query(path: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return path.to_string();
    }
    let query: Vec<String> = pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{k}={v}")
            }
        })
        .collect();
    format!("{path}?{}", query.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> BuiltinResult {
        let mut ctx = VclContext::new();
        dispatch(name, args, &mut ctx).unwrap()
    }

    fn s(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    #[test]
    fn test_detect_attack_kinds() {
        assert!(detect_attack("1 UNION SELECT password FROM users", "sql"));
        assert!(detect_attack("name' -- comment", "sql"));
        assert!(detect_attack("/?q=SELECT%20*%20FROM%20users", "sql"));
        assert!(detect_attack("<script>alert(1)</script>", "xss"));
        assert!(detect_attack("onload = doEvil()", "xss"));
        assert!(detect_attack("../../etc/config", "path"));
        assert!(detect_attack("%2e%2e%2fsecret", "path"));
        assert!(detect_attack("x | cat /tmp/f", "command"));
        assert!(detect_attack("/etc/passwd", "lfi"));
        assert!(detect_attack("include=https://evil.example/x", "rfi"));
        assert!(detect_attack("../../etc/passwd", "any"));
        assert!(!detect_attack("/plain/path", "sql"));
        assert!(!detect_attack("", "any"));
        assert!(!detect_attack("/safe", "nonsense"));
    }

    #[test]
    fn test_waf_block_is_transition() {
        let result = call("waf.block", &[Value::Integer(403), s("denied")]);
        assert_eq!(
            result,
            BuiltinResult::Transition {
                status: 403,
                message: "denied".to_string(),
            }
        );
    }

    #[test]
    fn test_waf_log_format() {
        call("waf.log", &[s("suspicious request")]);
        let log = Runtime::global().waf_log();
        let line = log
            .iter()
            .find(|l| l.contains("suspicious request"))
            .unwrap();
        assert!(line.contains(" [WAF] "));
        // ISO-8601 timestamp prefix.
        assert!(line.starts_with("20"));
        assert!(line.contains('T'));
    }

    #[test]
    fn test_unknown_function() {
        let mut ctx = VclContext::new();
        let err = dispatch("no.such_fn", &[], &mut ctx).unwrap_err();
        assert!(matches!(err, EvalError::UnknownFunction { .. }));
    }

    #[test]
    fn test_bad_arity() {
        let mut ctx = VclContext::new();
        let err = dispatch("digest.hash_sha256", &[], &mut ctx).unwrap_err();
        assert!(matches!(err, EvalError::BadArity { .. }));
    }

    #[test]
    fn test_table_add_entry_and_lookups() {
        let mut ctx = VclContext::new();
        dispatch("std.table.add", &[s("t")], &mut ctx).unwrap();
        dispatch("std.table.add_entry", &[s("t"), s("k"), Value::Integer(7)], &mut ctx).unwrap();
        dispatch("std.table.add_entry", &[s("t"), s("b"), Value::Bool(true)], &mut ctx).unwrap();

        let got = dispatch("std.table.lookup", &[s("t"), s("k")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(s("7")));
        let got = dispatch("std.table.lookup_integer", &[s("t"), s("k")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(Value::Integer(7)));
        let got = dispatch("std.table.lookup_bool", &[s("t"), s("b")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(Value::Bool(true)));
        let got = dispatch("std.table.contains", &[s("t"), s("k")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(Value::Bool(true)));

        // Absent key: default argument, then type zero.
        let got = dispatch("std.table.lookup", &[s("t"), s("zz"), s("dft")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(s("dft")));
        let got = dispatch("std.table.lookup", &[s("t"), s("zz")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(s("")));
        let got = dispatch("std.table.lookup_integer", &[s("none"), s("zz")], &mut ctx).unwrap();
        assert_eq!(got, BuiltinResult::Value(Value::Integer(0)));
    }

    #[test]
    fn test_table_lookup_regex_zero_value() {
        let mut ctx = VclContext::new();
        let got = dispatch("std.table.lookup_regex", &[s("t"), s("k")], &mut ctx).unwrap();
        let BuiltinResult::Value(Value::Regex(re)) = got else {
            panic!("expected regex");
        };
        assert_eq!(re.as_str(), "(?:)");
    }

    #[test]
    fn test_uuid_dns_stable_and_v5() {
        let a = call("uuid.dns", &[s("example.com")]);
        let b = call("uuid.dns", &[s("example.com")]);
        assert_eq!(a, b);
        let BuiltinResult::Value(Value::Str(text)) = a else {
            panic!("expected string");
        };
        let shape = Regex::new(
            r"^[0-9a-f]{8}-[0-9a-f]{4}-5[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
        )
        .unwrap();
        assert!(shape.is_match(&text), "{text}");
        assert_eq!(
            call("uuid.is_version5", &[s(&text)]),
            BuiltinResult::Value(Value::Bool(true))
        );
    }

    #[test]
    fn test_uuid_encode_decode_round_trip() {
        let BuiltinResult::Value(Value::Str(u)) = call("uuid.version4", &[]) else {
            panic!("expected string");
        };
        let BuiltinResult::Value(Value::Str(decoded)) = call("uuid.decode", &[s(&u)]) else {
            panic!("expected string");
        };
        assert_eq!(decoded.len(), 32);
        let encoded = call("uuid.encode", &[s(&decoded)]);
        assert_eq!(encoded, BuiltinResult::Value(s(&u)));
        assert_eq!(
            call("uuid.is_version4", &[s(&u)]),
            BuiltinResult::Value(Value::Bool(true))
        );
    }

    #[test]
    fn test_digest_sha256_known_vector() {
        let got = call("digest.hash_sha256", &[s("abc")]);
        assert_eq!(
            got,
            BuiltinResult::Value(s(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            ))
        );
    }

    #[test]
    fn test_digest_base64_round_trip() {
        let got = call("digest.base64", &[s("hello")]);
        assert_eq!(got, BuiltinResult::Value(s("aGVsbG8=")));
        let got = call("digest.base64_decode", &[s("aGVsbG8=")]);
        assert_eq!(got, BuiltinResult::Value(s("hello")));
    }

    #[test]
    fn test_randombool_extremes_and_seeded() {
        assert_eq!(
            call("std.random.randombool", &[Value::Float(0.0)]),
            BuiltinResult::Value(Value::Bool(false))
        );
        assert_eq!(
            call("std.random.randombool", &[Value::Float(1.1)]),
            BuiltinResult::Value(Value::Bool(true))
        );
        let a = call(
            "std.random.randombool_seeded",
            &[Value::Float(0.5), Value::Integer(42)],
        );
        let b = call(
            "std.random.randombool_seeded",
            &[Value::Float(0.5), Value::Integer(42)],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_randomint_bounds() {
        assert_eq!(
            call("std.random.randomint", &[Value::Integer(7), Value::Integer(7)]),
            BuiltinResult::Value(Value::Integer(7))
        );
        for _ in 0..50 {
            let BuiltinResult::Value(Value::Integer(n)) = call(
                "std.random.randomint",
                &[Value::Integer(1), Value::Integer(3)],
            ) else {
                panic!("expected integer");
            };
            assert!((1..=3).contains(&n));
        }
        let a = call(
            "std.random.randomint_seeded",
            &[Value::Integer(0), Value::Integer(100), Value::Integer(9)],
        );
        let b = call(
            "std.random.randomint_seeded",
            &[Value::Integer(0), Value::Integer(100), Value::Integer(9)],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_randomstr_default_charset() {
        let BuiltinResult::Value(Value::Str(text)) = call("std.random.randomstr", &[Value::Integer(16)])
        else {
            panic!("expected string");
        };
        assert_eq!(text.len(), 16);
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_hex_to_time() {
        // 0x65000000 = 1694498816 seconds.
        let got = call("std.time.hex_to_time", &[s("650000000a1b2c3d4e5f6071")]);
        assert_eq!(got, BuiltinResult::Value(Value::Integer(0x65000000)));
        let got = call("std.time.hex_to_time", &[s("zz")]);
        assert_eq!(got, BuiltinResult::Value(Value::Integer(0)));
    }

    #[test]
    fn test_language_lookup() {
        let got = language_lookup("en:fr:de", "en", "fr-CH, fr;q=0.9, en;q=0.8");
        assert_eq!(got, "fr");
        // Ties break by first appearance in the available list.
        let got = language_lookup("en:fr", "en", "fr;q=0.5, en;q=0.5");
        assert_eq!(got, "en");
        assert_eq!(language_lookup("en:fr", "de", ""), "de");
        assert_eq!(language_lookup("en:fr", "en", "zh, ja;q=0.9"), "en");
        // Subtag matches the primary language.
        assert_eq!(language_lookup("pt-BR:en", "en", "pt"), "pt-BR");
    }

    #[test]
    fn test_media_lookup_wildcards() {
        let got = media_lookup(
            "text/html:application/json",
            "text/plain",
            "application/json;q=0.9, text/html;q=0.8",
        );
        assert_eq!(got, "application/json");
        let got = media_lookup("text/html:image/png", "text/plain", "image/*");
        assert_eq!(got, "image/png");
        let got = media_lookup("text/html", "text/plain", "*/*");
        assert_eq!(got, "text/html");
        let got = media_lookup("text/html", "text/plain", "audio/mp3");
        assert_eq!(got, "text/plain");
    }

    #[test]
    fn test_addr_checks() {
        assert_eq!(
            call("addr.is_ipv4", &[s("203.0.113.9")]),
            BuiltinResult::Value(Value::Bool(true))
        );
        assert_eq!(
            call("addr.is_ipv4", &[s("::1")]),
            BuiltinResult::Value(Value::Bool(false))
        );
        assert_eq!(
            call("addr.is_ipv6", &[s("::1")]),
            BuiltinResult::Value(Value::Bool(true))
        );
    }

    #[test]
    fn test_querystring_ops() {
        assert_eq!(
            call("querystring.get", &[s("/p?a=1&b=2"), s("b")]),
            BuiltinResult::Value(s("2"))
        );
        assert_eq!(
            call("querystring.get", &[s("/p"), s("b")]),
            BuiltinResult::Value(s(""))
        );
        assert_eq!(
            call("querystring.set", &[s("/p?a=1"), s("b"), s("2")]),
            BuiltinResult::Value(s("/p?a=1&b=2"))
        );
        assert_eq!(
            call("querystring.remove", &[s("/p?a=1&b=2"), s("a")]),
            BuiltinResult::Value(s("/p?b=2"))
        );
        assert_eq!(
            call("querystring.remove", &[s("/p?a=1"), s("a")]),
            BuiltinResult::Value(s("/p"))
        );
        assert_eq!(
            call("querystring.sort", &[s("/p?b=2&a=1&c=3")]),
            BuiltinResult::Value(s("/p?a=1&b=2&c=3"))
        );
    }

    #[test]
    fn test_http_status_matches() {
        assert_eq!(
            call("http.status_matches", &[Value::Integer(404), s("200, 404")]),
            BuiltinResult::Value(Value::Bool(true))
        );
        assert_eq!(
            call("http.status_matches", &[Value::Integer(500), s("200,404")]),
            BuiltinResult::Value(Value::Bool(false))
        );
    }

    #[test]
    fn test_std_string_helpers() {
        assert_eq!(call("std.tolower", &[s("AbC")]), BuiltinResult::Value(s("abc")));
        assert_eq!(call("std.toupper", &[s("abc")]), BuiltinResult::Value(s("ABC")));
        assert_eq!(
            call("std.strlen", &[s("héllo")]),
            BuiltinResult::Value(Value::Integer(5))
        );
        assert_eq!(
            call("std.strstr", &[s("/a/b/c"), s("/b")]),
            BuiltinResult::Value(s("/b/c"))
        );
        assert_eq!(call("std.strstr", &[s("abc"), s("zz")]), BuiltinResult::Value(s("")));
        assert_eq!(
            call("std.atoi", &[s(" 42 ")]),
            BuiltinResult::Value(Value::Integer(42))
        );
        assert_eq!(
            call("std.atoi", &[s("nope")]),
            BuiltinResult::Value(Value::Integer(0))
        );
        assert_eq!(
            call("std.itoa", &[Value::Integer(9)]),
            BuiltinResult::Value(s("9"))
        );
        assert_eq!(
            call("std.prefixof", &[s("/api/x"), s("/api")]),
            BuiltinResult::Value(Value::Bool(true))
        );
        assert_eq!(
            call("std.suffixof", &[s("a.css"), s(".css")]),
            BuiltinResult::Value(Value::Bool(true))
        );
        assert_eq!(
            call("std.strrep", &[s("ab"), Value::Integer(3)]),
            BuiltinResult::Value(s("ababab"))
        );
    }

    #[test]
    fn test_decode_for_inspection() {
        assert_eq!(decode_for_inspection("a%20b+c"), "a b c");
        assert_eq!(decode_for_inspection("100%"), "100%");
        assert_eq!(decode_for_inspection("%zz"), "%zz");
    }
}
