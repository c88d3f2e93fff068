//! VCL lexical analyzer
//!
//! Converts VCL source text into a flat token stream. The scanner is
//! deliberately total: unrecognized characters are skipped and resource-limit
//! breaches truncate the stream to `Eof`, so lexing never fails. Malformed
//! input yields a token stream the parser will reject with diagnostics.
//!
//! VCL-specific constructs handled here:
//!
//! - brace-quoted synthetic blocks `{"…"}` scanned by brace counting
//! - time-unit number literals (`5m`, `30s`, `250ms`) preserved as strings
//! - the regex-match operators `~` and `!~` (the pattern itself arrives as a
//!   following string token)
//! - hyphenated header identifiers such as `req.http.User-Agent`

use crate::error::Position;
use std::borrow::Cow;

/// Reserved words of the VCL grammar
pub const KEYWORDS: &[&str] = &[
    "sub",
    "if",
    "else",
    "elseif",
    "return",
    "set",
    "unset",
    "error",
    "synthetic",
    "hash_data",
    "true",
    "false",
    "deliver",
    "fetch",
    "pass",
    "hash",
    "lookup",
    "restart",
    "purge",
    "acl",
    "goto",
    "table",
    "backend",
    "director",
    "include",
    "import",
    "declare",
    "local",
];

/// Characters that can begin or continue an operator run
const OPERATOR_CHARS: &str = "+-*/%=<>!&|^~";

/// Configuration options for the lexer
#[derive(Debug, Clone)]
pub struct LexerConfig {
    /// Emit comment tokens instead of discarding them
    pub save_comments: bool,
    /// Maximum number of tokens before the stream is truncated to Eof
    pub max_tokens: usize,
    /// Maximum scanned string length before the string is cut short
    pub max_string_length: usize,
}

impl Default for LexerConfig {
    fn default() -> Self {
        Self {
            save_comments: true,
            max_tokens: 1_000_000,
            max_string_length: 1024 * 1024,
        }
    }
}

/// VCL token categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TokenKind {
    /// Reserved word (`sub`, `if`, `set`, ...)
    Keyword,
    /// Identifier, possibly dotted and hyphenated (`req.http.User-Agent`)
    Identifier,
    /// String literal of any form; also time-unit numbers (`5m`)
    String,
    /// Plain integer or float literal
    Number,
    /// Operator run (`==`, `!~`, `&&`, `+`, ...)
    Operator,
    /// Single punctuation character
    Punctuation,
    /// `#`, `//` or `/* ... */` comment
    Comment,
    /// End of input, always the final token
    Eof,
}

/// A single token with its raw source slice and decoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    /// Token category
    pub kind: TokenKind,
    /// The raw source substring, quotes and markers included
    pub lexeme: &'a str,
    /// Decoded payload: escape-processed content for strings, otherwise the lexeme
    pub value: Cow<'a, str>,
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
    /// Byte offset into the source (0-based)
    pub offset: usize,
}

impl<'a> Token<'a> {
    /// Returns the position of the token start
    pub fn position(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            offset: self.offset,
        }
    }

    /// Returns true for a keyword token with the given lexeme
    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.lexeme == word
    }

    /// Returns true for a punctuation token with the given lexeme
    pub fn is_punct(&self, ch: &str) -> bool {
        self.kind == TokenKind::Punctuation && self.lexeme == ch
    }

    /// Returns true for an operator token with the given lexeme
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.lexeme == op
    }

    /// Returns a short description of the token for error messages
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "end of file".to_string(),
            _ => self.lexeme.to_string(),
        }
    }
}

/// VCL lexer scanning source text left-to-right
#[derive(Clone)]
pub struct VclLexer<'a> {
    /// Input text being lexed
    input: &'a str,
    /// Current byte position in input
    position: usize,
    /// Current line number (1-based)
    line: usize,
    /// Current column number (1-based)
    column: usize,
    /// Lexer configuration
    config: LexerConfig,
    /// Number of tokens produced so far
    token_count: usize,
    /// Whether the previously produced token was the `synthetic` keyword
    after_synthetic: bool,
}

impl<'a> VclLexer<'a> {
    /// Creates a new lexer with default configuration
    pub fn new(input: &'a str) -> Self {
        Self::with_config(input, LexerConfig::default())
    }

    /// Creates a new lexer with custom configuration
    pub fn with_config(input: &'a str, config: LexerConfig) -> Self {
        Self {
            input,
            position: 0,
            line: 1,
            column: 1,
            config,
            token_count: 0,
            after_synthetic: false,
        }
    }

    /// Returns the underlying source text
    pub fn source(&self) -> &'a str {
        self.input
    }

    /// Returns the current position in the input
    pub fn current_position(&self) -> Position {
        Position {
            line: self.line,
            column: self.column,
            offset: self.position,
        }
    }

    /// Scans the whole input into a token vector terminated by `Eof`
    ///
    /// Comment tokens are included when `save_comments` is set; the parser
    /// filters them out of the statement stream and keeps them on the program.
    pub fn tokenize(mut self) -> Vec<Token<'a>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            if token.kind != TokenKind::Comment || self.config.save_comments {
                tokens.push(token);
            }
            if done {
                break;
            }
        }
        tokens
    }

    /// Produces the next token, skipping whitespace and unknown characters
    pub fn next_token(&mut self) -> Token<'a> {
        if self.token_count >= self.config.max_tokens {
            return self.make_eof();
        }

        loop {
            self.skip_whitespace();
            let Some(ch) = self.peek() else {
                return self.make_eof();
            };

            let start = self.current_position();

            // Comments: '#', '//' and '/* ... */'
            if ch == '#' {
                return self.lex_line_comment(start);
            }
            if ch == '/' {
                match self.peek_at(1) {
                    Some('/') => return self.lex_line_comment(start),
                    Some('*') => return self.lex_block_comment(start),
                    _ => {}
                }
            }

            // Strings, including triple-quoted
            if ch == '"' || ch == '\'' {
                return self.lex_string(start, ch);
            }

            // Brace-quoted synthetic blocks: '{"' anywhere, or any '{' right
            // after the synthetic keyword.
            if ch == '{' && (self.peek_at(1) == Some('"') || self.after_synthetic) {
                return self.lex_brace_string(start);
            }

            if ch.is_ascii_digit() {
                return self.lex_number(start);
            }

            if ch.is_ascii_alphabetic() || ch == '_' || (ch == '.' && self.starts_identifier()) {
                return self.lex_identifier(start);
            }

            if OPERATOR_CHARS.contains(ch) {
                return self.lex_operator(start);
            }

            if "(){}[],;:.?".contains(ch) {
                self.advance();
                return self.emit(TokenKind::Punctuation, start);
            }

            // Unrecognized character: skip it and keep scanning.
            self.advance();
        }
    }

    /// Skips spaces, tabs and newlines
    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// Peeks at the current character without consuming it
    fn peek(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    /// Peeks `n` characters ahead of the current position
    fn peek_at(&self, n: usize) -> Option<char> {
        self.input[self.position..].chars().nth(n)
    }

    /// Consumes one character, updating line/column bookkeeping
    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.position += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    /// True when a leading '.' begins a dotted identifier rather than punctuation
    fn starts_identifier(&self) -> bool {
        matches!(self.peek_at(1), Some(c) if c.is_ascii_alphanumeric() || c == '_')
    }

    /// Builds a token from `start` to the current position
    fn emit(&mut self, kind: TokenKind, start: Position) -> Token<'a> {
        let lexeme = &self.input[start.offset..self.position];
        self.finish(kind, lexeme, Cow::Borrowed(lexeme), start)
    }

    /// Builds a token with an explicitly decoded value
    fn finish(
        &mut self,
        kind: TokenKind,
        lexeme: &'a str,
        value: Cow<'a, str>,
        start: Position,
    ) -> Token<'a> {
        self.token_count += 1;
        self.after_synthetic = kind == TokenKind::Keyword && lexeme == "synthetic";
        Token {
            kind,
            lexeme,
            value,
            line: start.line,
            column: start.column,
            offset: start.offset,
        }
    }

    /// Builds the terminating Eof token
    fn make_eof(&mut self) -> Token<'a> {
        let start = self.current_position();
        Token {
            kind: TokenKind::Eof,
            lexeme: "",
            value: Cow::Borrowed(""),
            line: start.line,
            column: start.column,
            offset: start.offset,
        }
    }

    /// Scans a `#` or `//` comment to end of line
    fn lex_line_comment(&mut self, start: Position) -> Token<'a> {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.advance();
        }
        self.emit(TokenKind::Comment, start)
    }

    /// Scans a `/* ... */` block comment; an unterminated block runs to Eof
    fn lex_block_comment(&mut self, start: Position) -> Token<'a> {
        self.advance();
        self.advance();
        while let Some(ch) = self.advance() {
            if ch == '*' && self.peek() == Some('/') {
                self.advance();
                break;
            }
        }
        self.emit(TokenKind::Comment, start)
    }

    /// Scans `"…"`, `'…'` and triple-quoted strings
    fn lex_string(&mut self, start: Position, quote: char) -> Token<'a> {
        // Triple-quoted form reads until the matching triple quote.
        if quote == '"' && self.peek_at(1) == Some('"') && self.peek_at(2) == Some('"') {
            return self.lex_triple_quoted(start);
        }

        self.advance();
        let mut value = String::new();
        while let Some(ch) = self.advance() {
            if value.len() >= self.config.max_string_length {
                break;
            }
            if ch == '\\' {
                match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('\\') => value.push('\\'),
                    Some(c) if c == quote => value.push(quote),
                    // Anything else keeps its backslash so regex escapes
                    // like \. and \d survive into the pattern.
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                }
            } else if ch == quote {
                break;
            } else {
                value.push(ch);
            }
        }

        let lexeme = &self.input[start.offset..self.position];
        // Borrow straight from the source when no escape was processed.
        let inner = lexeme
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote));
        let value = match inner {
            Some(raw) if raw == value => Cow::Borrowed(raw),
            _ => Cow::Owned(value),
        };
        self.finish(TokenKind::String, lexeme, value, start)
    }

    /// Scans a `"""…"""` triple-quoted string
    fn lex_triple_quoted(&mut self, start: Position) -> Token<'a> {
        for _ in 0..3 {
            self.advance();
        }
        let body_start = self.position;
        let mut body_end = self.position;
        while self.peek().is_some() {
            if self.peek() == Some('"')
                && self.peek_at(1) == Some('"')
                && self.peek_at(2) == Some('"')
            {
                body_end = self.position;
                for _ in 0..3 {
                    self.advance();
                }
                let lexeme = &self.input[start.offset..self.position];
                let value = Cow::Borrowed(&self.input[body_start..body_end]);
                return self.finish(TokenKind::String, lexeme, value, start);
            }
            self.advance();
        }
        // Unterminated: everything to Eof is the body.
        let lexeme = &self.input[start.offset..self.position];
        let value = Cow::Borrowed(&self.input[body_start..self.position]);
        self.finish(TokenKind::String, lexeme, value, start)
    }

    /// Scans a `{"…"}` brace-quoted block with brace counting from depth 1
    fn lex_brace_string(&mut self, start: Position) -> Token<'a> {
        self.advance();
        let mut depth = 1usize;
        while let Some(ch) = self.advance() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }
        // The whole body including braces is the lexeme; the decoded value
        // strips the {" and "} markers when present, else the outer braces.
        let lexeme = &self.input[start.offset..self.position];
        let value = lexeme
            .strip_prefix("{\"")
            .and_then(|s| s.strip_suffix("\"}"))
            .or_else(|| {
                lexeme
                    .strip_prefix('{')
                    .and_then(|s| s.strip_suffix('}'))
            })
            .unwrap_or(lexeme);
        self.finish(TokenKind::String, lexeme, Cow::Borrowed(value), start)
    }

    /// Scans a number, preserving a trailing VCL time unit as a string token
    fn lex_number(&mut self, start: Position) -> Token<'a> {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        if self.peek() == Some('.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }

        // A trailing s/m/h/d/y time unit keeps the whole lexeme together as a
        // string so the unit survives for later interpretation. "ms" is the
        // one two-character unit.
        if let Some(unit) = self.peek() {
            if matches!(unit, 's' | 'm' | 'h' | 'd' | 'y') {
                self.advance();
                if unit == 'm' && self.peek() == Some('s') {
                    self.advance();
                }
                return self.emit(TokenKind::String, start);
            }
        }

        self.emit(TokenKind::Number, start)
    }

    /// Scans a (possibly dotted, possibly hyphenated) identifier or keyword
    fn lex_identifier(&mut self, start: Position) -> Token<'a> {
        self.advance();
        while let Some(ch) = self.peek() {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
                self.advance();
            } else if ch == '-' {
                // Interior hyphen only when directly followed by another
                // identifier character, so binary minus is not absorbed.
                match self.peek_at(1) {
                    Some(next) if next.is_ascii_alphanumeric() || next == '_' => {
                        self.advance();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }
        let lexeme = &self.input[start.offset..self.position];
        let kind = if KEYWORDS.contains(&lexeme) {
            TokenKind::Keyword
        } else {
            TokenKind::Identifier
        };
        let value = Cow::Borrowed(lexeme);
        self.finish(kind, lexeme, value, start)
    }

    /// Scans a maximal operator run
    fn lex_operator(&mut self, start: Position) -> Token<'a> {
        while let Some(ch) = self.peek() {
            if !OPERATOR_CHARS.contains(ch) {
                break;
            }
            // Never absorb the start of a comment into an operator run.
            if ch == '/' && matches!(self.peek_at(1), Some('/') | Some('*')) {
                break;
            }
            self.advance();
        }
        self.emit(TokenKind::Operator, start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        VclLexer::new(source)
            .tokenize()
            .into_iter()
            .map(|t| (t.kind, t.lexeme.to_string()))
            .collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = kinds("sub vcl_recv { return(lookup); }");
        assert_eq!(tokens[0], (TokenKind::Keyword, "sub".to_string()));
        assert_eq!(tokens[1], (TokenKind::Identifier, "vcl_recv".to_string()));
        assert_eq!(tokens[2], (TokenKind::Punctuation, "{".to_string()));
        assert_eq!(tokens[3], (TokenKind::Keyword, "return".to_string()));
        assert_eq!(tokens[5], (TokenKind::Keyword, "lookup".to_string()));
        assert_eq!(tokens.last().unwrap().0, TokenKind::Eof);
    }

    #[test]
    fn test_dotted_hyphenated_identifier() {
        let tokens = kinds("req.http.User-Agent");
        assert_eq!(
            tokens[0],
            (TokenKind::Identifier, "req.http.User-Agent".to_string())
        );
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_hyphen_not_absorbed_as_minus() {
        let tokens = kinds("a - 1");
        assert_eq!(tokens[0], (TokenKind::Identifier, "a".to_string()));
        assert_eq!(tokens[1], (TokenKind::Operator, "-".to_string()));
        assert_eq!(tokens[2], (TokenKind::Number, "1".to_string()));
    }

    #[test]
    fn test_time_unit_number_is_string() {
        let tokens = kinds("set beresp.ttl = 5m;");
        let five = tokens.iter().find(|(_, l)| l == "5m").unwrap();
        assert_eq!(five.0, TokenKind::String);

        let tokens = kinds("250ms 30s 1h 2d 1y 42");
        assert_eq!(tokens[0], (TokenKind::String, "250ms".to_string()));
        assert_eq!(tokens[1], (TokenKind::String, "30s".to_string()));
        assert_eq!(tokens[2], (TokenKind::String, "1h".to_string()));
        assert_eq!(tokens[3], (TokenKind::String, "2d".to_string()));
        assert_eq!(tokens[4], (TokenKind::String, "1y".to_string()));
        assert_eq!(tokens[5], (TokenKind::Number, "42".to_string()));
    }

    #[test]
    fn test_float_number() {
        let tokens = kinds("3.14");
        assert_eq!(tokens[0], (TokenKind::Number, "3.14".to_string()));
    }

    #[test]
    fn test_regex_match_operators() {
        let tokens = kinds(r#"req.url ~ "^/api/""#);
        assert_eq!(tokens[1], (TokenKind::Operator, "~".to_string()));
        assert_eq!(tokens[2].0, TokenKind::String);

        let tokens = kinds(r#"req.url !~ "^/api/""#);
        assert_eq!(tokens[1], (TokenKind::Operator, "!~".to_string()));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = VclLexer::new(r#""a\"b\n""#).tokenize();
        assert_eq!(tokens[0].value, "a\"b\n");
        assert_eq!(tokens[0].lexeme, r#""a\"b\n""#);
    }

    #[test]
    fn test_single_quoted_string() {
        let tokens = VclLexer::new("'hello'").tokenize();
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].value, "hello");
    }

    #[test]
    fn test_triple_quoted_string() {
        let tokens = VclLexer::new(r#""""multi "line" body""""#).tokenize();
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].value, r#"multi "line" body"#);
    }

    #[test]
    fn test_brace_quoted_synthetic_block() {
        let source = r#"synthetic {"<html>{nested}</html>"};"#;
        let tokens = VclLexer::new(source).tokenize();
        assert_eq!(tokens[0].kind, TokenKind::Keyword);
        assert_eq!(tokens[0].lexeme, "synthetic");
        assert_eq!(tokens[1].kind, TokenKind::String);
        assert_eq!(tokens[1].lexeme, r#"{"<html>{nested}</html>"}"#);
        assert_eq!(tokens[1].value, "<html>{nested}</html>");
        assert_eq!(tokens[2].lexeme, ";");
    }

    #[test]
    fn test_comments_are_tokens() {
        let source = "# hash\n// slashes\n/* block */ x";
        let tokens = kinds(source);
        assert_eq!(tokens[0], (TokenKind::Comment, "# hash".to_string()));
        assert_eq!(tokens[1], (TokenKind::Comment, "// slashes".to_string()));
        assert_eq!(tokens[2], (TokenKind::Comment, "/* block */".to_string()));
        assert_eq!(tokens[3], (TokenKind::Identifier, "x".to_string()));
    }

    #[test]
    fn test_comments_discarded_when_configured() {
        let config = LexerConfig {
            save_comments: false,
            ..LexerConfig::default()
        };
        let tokens = VclLexer::with_config("# only a comment", config).tokenize();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
    }

    #[test]
    fn test_unknown_characters_skipped() {
        let tokens = kinds("a @ b");
        assert_eq!(tokens[0], (TokenKind::Identifier, "a".to_string()));
        assert_eq!(tokens[1], (TokenKind::Identifier, "b".to_string()));
    }

    #[test]
    fn test_source_order_and_positions() {
        let source = "set x = 1;\nset y = 2;";
        let tokens = VclLexer::new(source).tokenize();
        let mut last_offset = 0;
        for token in &tokens {
            assert!(token.offset >= last_offset);
            last_offset = token.offset;
        }
        let second_set = tokens.iter().filter(|t| t.lexeme == "set").nth(1).unwrap();
        assert_eq!(second_set.line, 2);
        assert_eq!(second_set.column, 1);
    }

    #[test]
    fn test_lexemes_reconstruct_source() {
        let source = "sub vcl_recv {\n  # comment\n  set req.http.X = \"a\" + 5m;\n}";
        let tokens = VclLexer::new(source).tokenize();
        for token in &tokens {
            if token.kind == TokenKind::Eof {
                continue;
            }
            assert!(!token.lexeme.is_empty());
            assert_eq!(
                &source[token.offset..token.offset + token.lexeme.len()],
                token.lexeme
            );
        }
    }

    #[test]
    fn test_max_tokens_truncates_to_eof() {
        let config = LexerConfig {
            max_tokens: 3,
            ..LexerConfig::default()
        };
        let tokens = VclLexer::with_config("a b c d e f", config).tokenize();
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_backend_property_identifier() {
        let tokens = kinds(".connect_timeout = 1s;");
        assert_eq!(
            tokens[0],
            (TokenKind::Identifier, ".connect_timeout".to_string())
        );
        assert_eq!(tokens[1], (TokenKind::Operator, "=".to_string()));
        assert_eq!(tokens[2], (TokenKind::String, "1s".to_string()));
    }

    #[test]
    fn test_acl_entry_tokens() {
        let tokens = kinds(r#""192.168.0.0"/16;"#);
        assert_eq!(tokens[0].0, TokenKind::String);
        assert_eq!(tokens[1], (TokenKind::Operator, "/".to_string()));
        assert_eq!(tokens[2], (TokenKind::Number, "16".to_string()));
    }
}
