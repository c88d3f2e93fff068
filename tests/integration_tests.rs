//! Integration tests with real-world VCL edge-policy scenarios
//!
//! These exercise the full pipeline (lex, parse, compile, execute) through
//! the public API the way a host embedding the engine would.

use vcl_engine::{
    Runtime, TokenKind, VclContext, VclLexer, execute_vcl, load_vcl_content, parse_vcl,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_sql_injection_block() {
    init_logging();
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            if (waf.detect_attack(req.url, "sql")) {
                error 403 "Forbidden: Suspicious SQL patterns detected";
            }
            return(lookup);
        }
        "#,
    );

    let mut ctx = VclContext::new();
    ctx.req.url = "/?q=SELECT%20*%20FROM%20users".to_string();
    ctx.client.ip = "203.0.113.1".to_string();

    let action = execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
    assert_eq!(action, "error");
    assert_eq!(ctx.obj.status, 403);
    assert_eq!(
        ctx.fastly_error.as_deref(),
        Some("Forbidden: Suspicious SQL patterns detected")
    );

    // A clean URL passes through.
    let mut ctx = VclContext::new();
    ctx.req.url = "/products?page=2".to_string();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "lookup");
}

#[test]
fn test_backend_routing() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            if (req.url ~ "^/api/") {
                set req.backend = "api";
            } elseif (req.url ~ "\.(jpg|jpeg|png|gif|css|js)$") {
                set req.backend = "static";
            } else {
                set req.backend = "default";
            }
            return(lookup);
        }
        "#,
    );

    for (url, expected) in [
        ("/api/users", "api"),
        ("/styles.css", "static"),
        ("/home", "default"),
    ] {
        let mut ctx = VclContext::new();
        ctx.req.url = url.to_string();
        execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
        assert_eq!(ctx.req.backend, expected, "url {url}");
    }
}

#[test]
fn test_acl_trust() {
    let subs = load_vcl_content(
        r#"
        acl trusted {
            "127.0.0.1";
            "192.168.0.0"/16;
        }
        sub vcl_recv {
            if (client.ip ~ trusted) {
                set req.http.X-Trusted = "yes";
            } else {
                set req.http.X-Trusted = "no";
            }
            return(lookup);
        }
        "#,
    );

    for (ip, expected) in [
        ("127.0.0.1", "yes"),
        ("192.168.5.9", "yes"),
        ("10.0.0.1", "no"),
    ] {
        let mut ctx = VclContext::new();
        ctx.client.ip = ip.to_string();
        execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
        assert_eq!(ctx.req.http.get("X-Trusted"), expected, "ip {ip}");
    }
}

#[test]
fn test_multi_rate_counter() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            set req.http.X-Count = ratelimit.ratecounter_increment("itest_counter_r", 10);
            set req.http.X-Low = ratelimit.check_rate("itest_counter_r", 5);
            set req.http.X-High = ratelimit.check_rate("itest_counter_r", 20);
            set req.http.X-Multi = ratelimit.check_rates("itest_counter_r", "10:1,20:2,30:3");
            return(lookup);
        }
        "#,
    );

    let mut ctx = VclContext::new();
    execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
    assert_eq!(ctx.req.http.get("X-Count"), "10");
    assert_eq!(ctx.req.http.get("X-Low"), "true");
    assert_eq!(ctx.req.http.get("X-High"), "false");
    assert_eq!(ctx.req.http.get("X-Multi"), "true");
}

#[test]
fn test_uuid_v5_dns_shape_and_stability() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            set req.http.X-Id = uuid.dns("example.com");
            return(lookup);
        }
        "#,
    );

    let mut first = VclContext::new();
    execute_vcl(&subs, "vcl_recv", &mut first).unwrap();
    let mut second = VclContext::new();
    execute_vcl(&subs, "vcl_recv", &mut second).unwrap();

    let id = first.req.http.get("X-Id").to_string();
    assert_eq!(id, second.req.http.get("X-Id"));
    let shape =
        regex::Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-5[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
            .unwrap();
    assert!(shape.is_match(&id), "{id}");
}

#[test]
fn test_waf_rate_limit_through_vcl() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            if (waf.rate_limit("itest_vcl_bucket:" + client.ip, 2, 60)) {
                return(lookup);
            }
            error 429 "Too many requests";
        }
        "#,
    );

    let mut actions = Vec::new();
    for _ in 0..3 {
        let mut ctx = VclContext::new();
        ctx.client.ip = "198.51.100.7".to_string();
        actions.push(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap());
    }
    assert_eq!(actions, vec!["lookup", "lookup", "error"]);
}

#[test]
fn test_penalty_box_flow() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            if (ratelimit.penaltybox_has("itest_pbox", client.ip)) {
                error 403 "Banned";
            }
            if (req.url ~ "^/abuse") {
                ratelimit.penaltybox_add("itest_pbox", client.ip, 60);
                error 429 "Slow down";
            }
            return(lookup);
        }
        "#,
    );

    let mut ctx = VclContext::new();
    ctx.client.ip = "198.51.100.99".to_string();
    ctx.req.url = "/fine".to_string();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "lookup");

    ctx.req.url = "/abuse/path".to_string();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "error");
    assert_eq!(ctx.obj.status, 429);

    // Next request from the same address is banned outright.
    let mut ctx = VclContext::new();
    ctx.client.ip = "198.51.100.99".to_string();
    ctx.req.url = "/fine".to_string();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "error");
    assert_eq!(ctx.obj.status, 403);
}

#[test]
fn test_error_page_with_synthetic_and_waf_log() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            if (req.url ~ "^/admin" && client.ip !~ ops) {
                waf.log("admin access denied for " + client.ip);
                error 403 "Forbidden";
            }
            return(lookup);
        }
        sub vcl_error {
            set obj.http.Content-Type = "text/html";
            synthetic {"<html><body><h1>"} + obj.status + {"</h1></body></html>"};
            return(deliver);
        }
        acl ops { "10.1.0.0"/16; }
        "#,
    );

    let mut ctx = VclContext::new();
    ctx.req.url = "/admin/panel".to_string();
    ctx.client.ip = "203.0.113.20".to_string();
    let action = execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
    assert_eq!(action, "deliver");
    assert_eq!(ctx.obj.status, 403);
    assert_eq!(ctx.obj.response, "<html><body><h1>403</h1></body></html>");
    assert_eq!(ctx.obj.http.get("Content-Type"), "text/html");

    let log = Runtime::global().waf_log();
    assert!(
        log.iter()
            .any(|line| line.contains("[WAF] admin access denied for 203.0.113.20"))
    );

    // The operator network goes straight through.
    let mut ctx = VclContext::new();
    ctx.req.url = "/admin/panel".to_string();
    ctx.client.ip = "10.1.2.3".to_string();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "lookup");
}

#[test]
fn test_hash_subroutine_builds_cache_key() {
    let subs = load_vcl_content(
        r#"
        sub vcl_hash {
            hash_data(req.url);
            hash_data(req.http.Host);
            return(hash);
        }
        "#,
    );
    let mut ctx = VclContext::new();
    ctx.req.url = "/page?x=1".to_string();
    ctx.req.http.set("Host", "shop.example.com");
    assert_eq!(execute_vcl(&subs, "vcl_hash", &mut ctx).unwrap(), "hash");
    assert_eq!(ctx.hash_key(), "/page?x=1/shop.example.com");
}

#[test]
fn test_accept_language_negotiation_through_vcl() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            set req.http.X-Lang = accept.language_lookup("en:fr:de", "en", req.http.Accept-Language);
            return(lookup);
        }
        "#,
    );

    let mut ctx = VclContext::new();
    ctx.req.http.set("Accept-Language", "de-CH;q=0.9, fr;q=0.8");
    execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
    assert_eq!(ctx.req.http.get("X-Lang"), "de");

    // Missing header falls back to the default.
    let mut ctx = VclContext::new();
    execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap();
    assert_eq!(ctx.req.http.get("X-Lang"), "en");
}

#[test]
fn test_source_concatenation_composition() {
    let routing = r#"
        sub vcl_recv {
            if (req.url ~ "^/v2/") { set req.backend = "v2"; }
            return(lookup);
        }
    "#;
    let tables = r#"table flags { "beta": true, }"#;
    let subs = load_vcl_content(&format!("{tables}\n{routing}"));

    let mut ctx = VclContext::new();
    ctx.req.url = "/v2/things".to_string();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "lookup");
    assert_eq!(ctx.req.backend, "v2");
    assert!(ctx.tables.contains_key("flags"));
}

#[test]
fn test_parse_recovery_still_executes_good_subroutines() {
    init_logging();
    let subs = load_vcl_content(
        r#"
        sub broken { set = ; }
        sub vcl_recv { return(pass); }
        "#,
    );
    assert!(!subs.declarations().diagnostics.is_empty());
    let mut ctx = VclContext::new();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "pass");
}

#[test]
fn test_pretty_print_round_trip_program() {
    let source = r#"
        include "shared.vcl";
        import std;
        acl office { "203.0.113.0"/24; !"203.0.113.13"; }
        table limits { "api": 100, "web": 50, }
        backend origin {
            .host = "origin.example.com";
            .port = "443";
        }
        sub vcl_recv {
            declare local var.limit INTEGER;
            set var.limit = table.lookup_integer(limits, "api");
            if (client.ip ~ office) {
                return(pass);
            } elseif (req.url ~ "^/health") {
                error 200 "OK";
            } else {
                set req.http.X-Limit = var.limit;
            }
            return(lookup);
        }
    "#;
    let first = parse_vcl(source);
    assert!(first.diagnostics.is_empty(), "{:?}", first.diagnostics);
    let second = parse_vcl(&first.to_string());
    assert!(second.diagnostics.is_empty(), "{:?}", second.diagnostics);
    assert_eq!(first.subroutines, second.subroutines);
    assert_eq!(first.acls, second.acls);
    assert_eq!(first.tables, second.tables);
    assert_eq!(first.backends, second.backends);
}

#[test]
fn test_lexer_reconstruction_of_sources() {
    let sources = [
        "sub vcl_recv { set req.http.A = \"x\"; }",
        "# comment\nsub s { if (a ~ \"p\") { error 403; } }",
        "table t { \"k\": 5m, }\nsub s { synthetic {\"<b>hi</b>\"}; }",
    ];
    for source in sources {
        let tokens = VclLexer::new(source).tokenize();
        for token in &tokens {
            if token.kind == TokenKind::Eof {
                continue;
            }
            assert_eq!(
                &source[token.offset..token.offset + token.lexeme.len()],
                token.lexeme,
                "lexeme slice mismatch in {source:?}"
            );
        }
        // Offsets are strictly non-decreasing (source order).
        let mut last = 0;
        for token in &tokens {
            assert!(token.offset >= last);
            last = token.offset;
        }
    }
}

#[test]
fn test_restart_loop_with_state() {
    let subs = load_vcl_content(
        r#"
        sub vcl_recv {
            if (req.http.X-Tries == "") {
                set req.http.X-Tries = "1";
                restart;
            }
            return(lookup);
        }
        "#,
    );
    let mut ctx = VclContext::new();
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "restart");
    assert_eq!(ctx.restarts, 1);
    // The host re-enters with the same context; state persists.
    assert_eq!(execute_vcl(&subs, "vcl_recv", &mut ctx).unwrap(), "lookup");
}
