//! VCL parser for converting tokens into a structured program
//!
//! Recursive descent over the flat token stream produced by
//! [`VclLexer`](crate::lexer::VclLexer). Parsing is best-effort: on a grammar
//! violation the parser records a [`Diagnostic`] and resynchronizes at the
//! next `;` or `}`, so one bad statement does not take down the program. A
//! subroutine whose header is unusable is dropped entirely; other
//! declarations still populate the [`Program`].

use crate::ast::{
    Acl, AclEntry, BackendDecl, BackendValue, BinaryOp, CallArgs, DirectorBackend, DirectorDecl,
    DirectorKind, Expression, Program, Statement, Subroutine, TableDecl, TableValue, UnaryOp,
    VarType,
};
use crate::error::{Diagnostic, ParseError, Position};
use crate::lexer::{LexerConfig, Token, TokenKind, VclLexer};
use indexmap::IndexMap;
use log::debug;

/// Configuration options for the parser
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Maximum statement nesting depth before a block is abandoned
    pub max_nesting_depth: usize,
    /// Lexer configuration used for the embedded lexer
    pub lexer: LexerConfig,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: 128,
            lexer: LexerConfig::default(),
        }
    }
}

/// VCL recursive-descent parser
pub struct VclParser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    config: ParserConfig,
    diagnostics: Vec<Diagnostic>,
    comments: Vec<String>,
    depth: usize,
}

impl<'a> VclParser<'a> {
    /// Creates a parser over the given source with default configuration
    pub fn new(source: &'a str) -> Self {
        Self::with_config(source, ParserConfig::default())
    }

    /// Creates a parser with custom configuration
    pub fn with_config(source: &'a str, config: ParserConfig) -> Self {
        let tokens = VclLexer::with_config(source, config.lexer.clone()).tokenize();
        let mut comments = Vec::new();
        let tokens = tokens
            .into_iter()
            .filter(|t| {
                if t.kind == TokenKind::Comment {
                    comments.push(t.lexeme.to_string());
                    false
                } else {
                    true
                }
            })
            .collect();
        Self {
            tokens,
            pos: 0,
            config,
            diagnostics: Vec::new(),
            comments,
            depth: 0,
        }
    }

    /// Parses the whole input into a program
    pub fn parse_program(mut self) -> Program {
        let mut program = Program {
            comments: std::mem::take(&mut self.comments),
            ..Program::default()
        };

        while !self.at_eof() {
            let checkpoint = self.pos;
            let result = self.parse_declaration(&mut program);
            if let Err(err) = result {
                debug!("parse recovery: {err}");
                self.diagnostics.push(err.into_diagnostic());
                self.resync_top_level(checkpoint);
            }
        }

        program.diagnostics = self.diagnostics;
        program
    }

    // -- token plumbing -----------------------------------------------------

    fn peek(&self) -> &Token<'a> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, n: usize) -> &Token<'a> {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn at_eof(&self) -> bool {
        self.peek().kind == TokenKind::Eof
    }

    fn advance(&mut self) -> Token<'a> {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn position(&self) -> Position {
        self.peek().position()
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        if token.kind == TokenKind::Eof {
            ParseError::UnexpectedEof {
                position: token.position(),
                expected: expected.to_string(),
            }
        } else {
            ParseError::UnexpectedToken {
                token: token.describe(),
                position: token.position(),
                expected: expected.to_string(),
            }
        }
    }

    fn expect_punct(&mut self, ch: &str) -> Result<Token<'a>, ParseError> {
        if self.peek().is_punct(ch) {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&format!("'{ch}'")))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek().kind {
            TokenKind::Identifier | TokenKind::Keyword => Ok(self.advance().lexeme.to_string()),
            _ => Err(self.unexpected(what)),
        }
    }

    fn eat_punct(&mut self, ch: &str) -> bool {
        if self.peek().is_punct(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_operator(&mut self, op: &str) -> bool {
        if self.peek().is_operator(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skips to the next `;` (consumed) or `}` (left in place) after an error
    fn resync_statement(&mut self) {
        while !self.at_eof() {
            if self.peek().is_punct(";") {
                self.advance();
                return;
            }
            if self.peek().is_punct("}") {
                return;
            }
            self.advance();
        }
    }

    /// Skips to the next plausible top-level declaration after an error
    fn resync_top_level(&mut self, checkpoint: usize) {
        if self.pos == checkpoint {
            self.advance();
        }
        while !self.at_eof() {
            let token = self.peek();
            if token.kind == TokenKind::Keyword
                && matches!(
                    token.lexeme,
                    "sub" | "acl" | "table" | "backend" | "director" | "include" | "import"
                )
            {
                return;
            }
            self.advance();
        }
    }

    // -- declarations -------------------------------------------------------

    fn parse_declaration(&mut self, program: &mut Program) -> Result<(), ParseError> {
        let token = self.peek();
        match (token.kind, token.lexeme) {
            (TokenKind::Keyword, "sub") => {
                if let Some(sub) = self.parse_subroutine()? {
                    program.subroutines.push(sub);
                }
                Ok(())
            }
            (TokenKind::Keyword, "acl") => {
                program.acls.push(self.parse_acl()?);
                Ok(())
            }
            (TokenKind::Keyword, "table") => {
                program.tables.push(self.parse_table()?);
                Ok(())
            }
            (TokenKind::Keyword, "backend") => {
                program.backends.push(self.parse_backend()?);
                Ok(())
            }
            (TokenKind::Keyword, "director") => {
                program.directors.push(self.parse_director()?);
                Ok(())
            }
            (TokenKind::Keyword, "include") => {
                self.advance();
                let name = match self.peek().kind {
                    TokenKind::String => self.advance().value.to_string(),
                    _ => return Err(self.unexpected("quoted include name")),
                };
                self.eat_punct(";");
                program.includes.push(name);
                Ok(())
            }
            (TokenKind::Keyword, "import") => {
                self.advance();
                let name = self.expect_identifier("module name")?;
                self.eat_punct(";");
                program.imports.push(name);
                Ok(())
            }
            _ => Err(self.unexpected("declaration (sub, acl, table, backend, director, include, import)")),
        }
    }

    /// Parses `sub <name> { ... }`, dropping the subroutine on header failure
    fn parse_subroutine(&mut self) -> Result<Option<Subroutine>, ParseError> {
        self.advance();
        let name = self.expect_identifier("subroutine name")?;
        self.expect_punct("{")?;
        let body = self.parse_block_body();
        Ok(Some(Subroutine { name, body }))
    }

    /// Parses statements until the closing `}` of the current block
    fn parse_block_body(&mut self) -> Vec<Statement> {
        let mut body = Vec::new();
        loop {
            if self.at_eof() {
                self.diagnostics
                    .push(Diagnostic::new("unclosed block", self.position()));
                break;
            }
            if self.eat_punct("}") {
                break;
            }
            match self.parse_statement() {
                Ok(stmt) => body.push(stmt),
                Err(err) => {
                    self.diagnostics.push(err.into_diagnostic());
                    self.resync_statement();
                }
            }
        }
        body
    }

    // -- statements ---------------------------------------------------------

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        if self.depth >= self.config.max_nesting_depth {
            return Err(self.unexpected("shallower nesting"));
        }

        let token = self.peek().clone();
        match (token.kind, token.lexeme) {
            (TokenKind::Keyword, "set") => self.parse_set(),
            (TokenKind::Keyword, "unset") => {
                self.advance();
                let target = self.expect_identifier("assignment target")?;
                self.expect_punct(";")?;
                Ok(Statement::Unset { target })
            }
            (TokenKind::Keyword, "if") => self.parse_if(),
            (TokenKind::Keyword, "return") => self.parse_return(),
            (TokenKind::Keyword, "error") => self.parse_error_statement(),
            (TokenKind::Keyword, "synthetic") => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_punct(";")?;
                Ok(Statement::Synthetic { expr })
            }
            (TokenKind::Keyword, "hash_data") => {
                self.advance();
                let parenthesized = self.eat_punct("(");
                let expr = self.parse_expression()?;
                if parenthesized {
                    self.expect_punct(")")?;
                }
                self.expect_punct(";")?;
                Ok(Statement::HashData { expr })
            }
            (TokenKind::Keyword, "restart") => {
                self.advance();
                self.expect_punct(";")?;
                Ok(Statement::Restart)
            }
            (TokenKind::Keyword, "goto") => {
                self.advance();
                let label = self.expect_identifier("label name")?;
                self.expect_punct(";")?;
                Ok(Statement::Goto { label })
            }
            (TokenKind::Keyword, "declare") => self.parse_declare(),
            (TokenKind::Identifier, "log") => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_punct(";")?;
                Ok(Statement::Log { expr })
            }
            (TokenKind::Identifier, _) => {
                // Label (`name:`), or a bare builtin call for side effects.
                if self.peek_at(1).is_punct(":") {
                    let name = self.advance().lexeme.to_string();
                    self.advance();
                    return Ok(Statement::Label { name });
                }
                if self.peek_at(1).is_punct("(") {
                    let name = self.advance().lexeme.to_string();
                    self.advance();
                    let args = self.parse_call_args()?;
                    self.expect_punct(";")?;
                    return Ok(Statement::Call { name, args });
                }
                Err(self.unexpected("statement"))
            }
            _ => Err(self.unexpected("statement")),
        }
    }

    fn parse_set(&mut self) -> Result<Statement, ParseError> {
        self.advance();
        let target = self.expect_identifier("assignment target")?;
        if !self.eat_operator("=") {
            return Err(self.unexpected("'='"));
        }
        let expr = self.parse_expression()?;
        self.expect_punct(";")?;
        Ok(Statement::Set { target, expr })
    }

    fn parse_if(&mut self) -> Result<Statement, ParseError> {
        self.advance();
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        self.depth += 1;
        let consequent = self.parse_block_body();
        self.depth -= 1;

        let mut alternate = Vec::new();
        let token = self.peek().clone();
        let is_elseif = token.is_keyword("elseif")
            || (token.kind == TokenKind::Identifier && token.lexeme == "elsif");
        if is_elseif {
            // Rewrite `elseif (...)` as an `if` chained into the alternate.
            alternate.push(self.parse_if_from_elseif()?);
        } else if token.is_keyword("else") {
            self.advance();
            if self.peek().is_keyword("if") {
                alternate.push(self.parse_if()?);
            } else {
                self.expect_punct("{")?;
                self.depth += 1;
                alternate = self.parse_block_body();
                self.depth -= 1;
            }
        }

        Ok(Statement::If {
            test,
            consequent,
            alternate,
        })
    }

    fn parse_if_from_elseif(&mut self) -> Result<Statement, ParseError> {
        // The current token is `elseif`/`elsif`; the rest reads like `if`.
        self.tokens[self.pos] = Token {
            lexeme: "if",
            ..self.tokens[self.pos].clone()
        };
        self.parse_if()
    }

    fn parse_return(&mut self) -> Result<Statement, ParseError> {
        self.advance();
        if self.eat_punct("(") {
            let action = match self.peek().kind {
                TokenKind::Keyword | TokenKind::Identifier => self.advance().lexeme.to_string(),
                _ => return Err(self.unexpected("return action")),
            };
            self.expect_punct(")")?;
            self.eat_punct(";");
            return Ok(Statement::Return { action });
        }
        if self.eat_punct(";") {
            return Ok(Statement::Return {
                action: String::new(),
            });
        }
        let action = match self.peek().kind {
            TokenKind::Keyword | TokenKind::Identifier => self.advance().lexeme.to_string(),
            _ => return Err(self.unexpected("return action")),
        };
        self.expect_punct(";")?;
        Ok(Statement::Return { action })
    }

    fn parse_error_statement(&mut self) -> Result<Statement, ParseError> {
        self.advance();
        let status = match self.peek().kind {
            TokenKind::Number => {
                let token = self.advance();
                token.lexeme.parse::<i64>().unwrap_or(500)
            }
            // `error;` alone re-raises with a generic status.
            TokenKind::Punctuation if self.peek().is_punct(";") => {
                self.advance();
                return Ok(Statement::Error {
                    status: 500,
                    message: None,
                });
            }
            _ => return Err(self.unexpected("status code")),
        };
        let message = if self.peek().is_punct(";") {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect_punct(";")?;
        Ok(Statement::Error { status, message })
    }

    fn parse_declare(&mut self) -> Result<Statement, ParseError> {
        self.advance();
        if !self.peek().is_keyword("local") {
            return Err(self.unexpected("'local'"));
        }
        self.advance();
        let name = self.expect_identifier("variable name")?;
        if !name.starts_with("var.") {
            return Err(ParseError::InvalidDeclaration {
                declaration: "declare".to_string(),
                position: self.position(),
                message: format!("variable '{name}' must be prefixed with 'var.'"),
            });
        }
        let ty_name = self.expect_identifier("variable type")?;
        let ty = VarType::from_name(&ty_name).ok_or_else(|| ParseError::InvalidDeclaration {
            declaration: "declare".to_string(),
            position: self.position(),
            message: format!("unknown type '{ty_name}'"),
        })?;
        self.expect_punct(";")?;
        Ok(Statement::Declare { name, ty })
    }

    // -- expressions --------------------------------------------------------

    /// Parses a full expression (ternary is the lowest precedence)
    pub fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        let cond = self.parse_or()?;
        if self.eat_punct("?") {
            let then = self.parse_expression()?;
            self.expect_punct(":")?;
            let otherwise = self.parse_expression()?;
            return Ok(Expression::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_and()?;
        while self.eat_operator("||") {
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_equality()?;
        while self.eat_operator("&&") {
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_relational()?;
        loop {
            let op = if self.eat_operator("==") {
                BinaryOp::Eq
            } else if self.eat_operator("!=") {
                BinaryOp::Ne
            } else {
                break;
            };
            let right = self.parse_relational()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_match()?;
        loop {
            let op = if self.eat_operator("<=") {
                BinaryOp::Le
            } else if self.eat_operator(">=") {
                BinaryOp::Ge
            } else if self.eat_operator("<") {
                BinaryOp::Lt
            } else if self.eat_operator(">") {
                BinaryOp::Gt
            } else {
                break;
            };
            let right = self.parse_match()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_match(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = if self.eat_operator("~") {
                BinaryOp::Match
            } else if self.eat_operator("!~") {
                BinaryOp::NotMatch
            } else {
                break;
            };
            let right = self.parse_regex_operand()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    /// The right operand of `~`/`!~`: a string literal holding the pattern,
    /// or an identifier naming an ACL (or a call producing a regex)
    fn parse_regex_operand(&mut self) -> Result<Expression, ParseError> {
        if self.peek().kind == TokenKind::String {
            let token = self.advance();
            let text = token.value.to_string();
            return Ok(regex_from_literal(&text));
        }
        if self.peek().kind == TokenKind::Identifier {
            return self.parse_primary();
        }
        Err(self.unexpected("regex pattern string or acl name"))
    }

    fn parse_additive(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            if self.eat_operator("+") {
                let right = self.parse_multiplicative()?;
                left = binary(BinaryOp::Add, left, right);
            } else if self.eat_operator("-") {
                let right = self.parse_multiplicative()?;
                left = binary(BinaryOp::Sub, left, right);
            } else if self.peek().kind == TokenKind::String {
                // Adjacent string literals concatenate.
                let token = self.advance();
                left = binary(BinaryOp::Add, left, Expression::Str(token.value.to_string()));
            } else {
                break;
            }
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = if self.eat_operator("*") {
                BinaryOp::Mul
            } else if self.eat_operator("/") {
                BinaryOp::Div
            } else if self.eat_operator("%") {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        if self.eat_operator("!") {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        if self.eat_operator("-") {
            let operand = self.parse_unary()?;
            return Ok(Expression::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Punctuation if token.lexeme == "(" => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::String => {
                self.advance();
                Ok(Expression::Str(token.value.to_string()))
            }
            TokenKind::Number => {
                self.advance();
                if token.lexeme.contains('.') {
                    Ok(Expression::Float(token.lexeme.parse().unwrap_or(0.0)))
                } else {
                    Ok(Expression::Integer(token.lexeme.parse().unwrap_or(0)))
                }
            }
            TokenKind::Keyword if token.lexeme == "true" => {
                self.advance();
                Ok(Expression::Bool(true))
            }
            TokenKind::Keyword if token.lexeme == "false" => {
                self.advance();
                Ok(Expression::Bool(false))
            }
            TokenKind::Identifier => {
                self.advance();
                if self.eat_punct("(") {
                    let args = self.parse_call_args()?;
                    Ok(Expression::Call {
                        name: token.lexeme.to_string(),
                        args: Box::new(args),
                    })
                } else {
                    Ok(Expression::Ident(token.lexeme.to_string()))
                }
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    /// Parses call arguments after the opening `(` has been consumed
    fn parse_call_args(&mut self) -> Result<CallArgs, ParseError> {
        let mut args = CallArgs::new();
        if self.eat_punct(")") {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expression()?);
            if self.eat_punct(",") {
                continue;
            }
            self.expect_punct(")")?;
            break;
        }
        Ok(args)
    }

    // -- acl / table / backend / director -----------------------------------

    fn parse_acl(&mut self) -> Result<Acl, ParseError> {
        self.advance();
        let name = self.expect_identifier("acl name")?;
        self.expect_punct("{")?;
        let mut entries = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            let negated = self.eat_operator("!");
            if self.peek().kind != TokenKind::String {
                let err = self.unexpected("quoted IP address");
                self.diagnostics.push(err.into_diagnostic());
                self.resync_statement();
                continue;
            }
            let text = self.advance().value.to_string();
            // The subnet may sit inside the quotes ("10.0.0.0/8") or follow
            // them ("10.0.0.0"/8).
            let (ip, mut subnet) = match text.split_once('/') {
                Some((ip, bits)) => (ip.to_string(), bits.parse::<u8>().ok()),
                None => (text, None),
            };
            if self.eat_operator("/") {
                if self.peek().kind == TokenKind::Number {
                    subnet = self.advance().lexeme.parse::<u8>().ok();
                } else {
                    return Err(self.unexpected("subnet bits"));
                }
            }
            self.expect_punct(";")?;
            entries.push(AclEntry {
                ip,
                subnet,
                negated,
            });
        }
        Ok(Acl { name, entries })
    }

    fn parse_table(&mut self) -> Result<TableDecl, ParseError> {
        self.advance();
        let name = self.expect_identifier("table name")?;
        self.expect_punct("{")?;
        let mut entries = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            if self.peek().kind != TokenKind::String {
                let err = self.unexpected("quoted table key");
                self.diagnostics.push(err.into_diagnostic());
                self.resync_statement();
                continue;
            }
            let key = self.advance().value.to_string();
            self.expect_punct(":")?;
            let value = self.parse_table_value()?;
            entries.push((key, value));
            // Trailing comma is optional.
            self.eat_punct(",");
        }
        Ok(TableDecl { name, entries })
    }

    fn parse_table_value(&mut self) -> Result<TableValue, ParseError> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::String => {
                self.advance();
                Ok(TableValue::Str(token.value.to_string()))
            }
            TokenKind::Number => {
                self.advance();
                if token.lexeme.contains('.') {
                    Ok(TableValue::Float(token.lexeme.parse().unwrap_or(0.0)))
                } else {
                    Ok(TableValue::Integer(token.lexeme.parse().unwrap_or(0)))
                }
            }
            TokenKind::Keyword if token.lexeme == "true" => {
                self.advance();
                Ok(TableValue::Bool(true))
            }
            TokenKind::Keyword if token.lexeme == "false" => {
                self.advance();
                Ok(TableValue::Bool(false))
            }
            TokenKind::Operator if token.lexeme == "-" => {
                self.advance();
                let number = self.peek().clone();
                if number.kind != TokenKind::Number {
                    return Err(self.unexpected("number"));
                }
                self.advance();
                if number.lexeme.contains('.') {
                    Ok(TableValue::Float(-number.lexeme.parse().unwrap_or(0.0)))
                } else {
                    Ok(TableValue::Integer(-number.lexeme.parse().unwrap_or(0)))
                }
            }
            _ => Err(self.unexpected("table value")),
        }
    }

    fn parse_backend(&mut self) -> Result<BackendDecl, ParseError> {
        self.advance();
        let name = self.expect_identifier("backend name")?;
        self.expect_punct("{")?;
        let properties = self.parse_property_block()?;
        Ok(BackendDecl { name, properties })
    }

    /// Parses `.name = value;` pairs until the closing `}` (consumed)
    fn parse_property_block(&mut self) -> Result<IndexMap<String, BackendValue>, ParseError> {
        let mut properties = IndexMap::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            let raw = self.expect_identifier("property name")?;
            let prop = raw.strip_prefix('.').unwrap_or(&raw).to_string();
            if !self.eat_operator("=") {
                return Err(self.unexpected("'='"));
            }
            let value = if self.eat_punct("{") {
                BackendValue::Block(self.parse_property_block()?)
            } else {
                BackendValue::Literal(self.parse_expression()?)
            };
            self.eat_punct(";");
            properties.insert(prop, value);
        }
        Ok(properties)
    }

    fn parse_director(&mut self) -> Result<DirectorDecl, ParseError> {
        self.advance();
        let name = self.expect_identifier("director name")?;
        let kind_name = self.expect_identifier("director type")?;
        let kind =
            DirectorKind::from_name(&kind_name).ok_or_else(|| ParseError::InvalidDeclaration {
                declaration: "director".to_string(),
                position: self.position(),
                message: format!("unknown director type '{kind_name}'"),
            })?;
        self.expect_punct("{")?;

        let mut backends = Vec::new();
        let mut quorum = None;
        let mut retries = None;
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected("'}'"));
            }
            if self.eat_punct("{") {
                // Member block: { .backend = name; .weight = n; }
                let props = self.parse_property_block()?;
                let backend_name = match props.get("backend") {
                    Some(BackendValue::Literal(Expression::Ident(name))) => name.clone(),
                    Some(BackendValue::Literal(Expression::Str(name))) => name.clone(),
                    _ => {
                        return Err(ParseError::InvalidDeclaration {
                            declaration: "director".to_string(),
                            position: self.position(),
                            message: "member block missing .backend".to_string(),
                        });
                    }
                };
                let weight = match props.get("weight") {
                    Some(BackendValue::Literal(Expression::Integer(n))) => *n,
                    _ => 1,
                };
                backends.push(DirectorBackend {
                    name: backend_name,
                    weight,
                });
                continue;
            }

            let raw = self.expect_identifier("director property")?;
            let prop = raw.strip_prefix('.').unwrap_or(&raw).to_string();
            if !self.eat_operator("=") {
                return Err(self.unexpected("'='"));
            }
            let number = match self.peek().kind {
                TokenKind::Number => self.advance().lexeme.parse::<i64>().unwrap_or(0),
                _ => return Err(self.unexpected("number")),
            };
            // Quorum is conventionally written as a percentage.
            self.eat_operator("%");
            self.eat_punct(";");
            match prop.as_str() {
                "quorum" => quorum = Some(number),
                "retries" => retries = Some(number),
                _ => {}
            }
        }

        Ok(DirectorDecl {
            name,
            kind,
            backends,
            quorum,
            retries,
        })
    }
}

fn binary(op: BinaryOp, left: Expression, right: Expression) -> Expression {
    Expression::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Splits a `/pattern/flags` literal into a regex expression
fn regex_from_literal(text: &str) -> Expression {
    if let Some(rest) = text.strip_prefix('/') {
        if let Some(idx) = rest.rfind('/') {
            let (pattern, flags) = rest.split_at(idx);
            let flags = &flags[1..];
            if !flags.is_empty() && flags.chars().all(|c| c.is_ascii_alphabetic()) {
                return Expression::Regex {
                    pattern: pattern.to_string(),
                    flags: flags.to_string(),
                };
            }
        }
    }
    Expression::Regex {
        pattern: text.to_string(),
        flags: String::new(),
    }
}

/// Parses VCL source into a [`Program`], collecting diagnostics on it
pub fn parse_vcl(source: &str) -> Program {
    VclParser::new(source).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_subroutine() {
        let program = parse_vcl("sub vcl_recv { return(lookup); }");
        assert_eq!(program.subroutines.len(), 1);
        assert_eq!(program.subroutines[0].name, "vcl_recv");
        assert_eq!(
            program.subroutines[0].body,
            vec![Statement::Return {
                action: "lookup".to_string()
            }]
        );
        assert!(program.diagnostics.is_empty());
    }

    #[test]
    fn test_parse_set_and_unset() {
        let program = parse_vcl(
            r#"sub vcl_recv {
                set req.http.X-Forwarded-Proto = "https";
                unset req.http.Cookie;
            }"#,
        );
        let body = &program.subroutines[0].body;
        assert_eq!(
            body[0],
            Statement::Set {
                target: "req.http.X-Forwarded-Proto".to_string(),
                expr: Expression::Str("https".to_string()),
            }
        );
        assert_eq!(
            body[1],
            Statement::Unset {
                target: "req.http.Cookie".to_string()
            }
        );
    }

    #[test]
    fn test_parse_if_elseif_else() {
        let program = parse_vcl(
            r#"sub vcl_recv {
                if (req.url ~ "^/api/") {
                    set req.backend = "api";
                } elseif (req.url ~ "^/img/") {
                    set req.backend = "img";
                } else {
                    set req.backend = "default";
                }
            }"#,
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let Statement::If { alternate, .. } = &program.subroutines[0].body[0] else {
            panic!("expected if");
        };
        assert_eq!(alternate.len(), 1);
        let Statement::If {
            alternate: else_arm,
            ..
        } = &alternate[0]
        else {
            panic!("expected chained elseif");
        };
        assert_eq!(else_arm.len(), 1);
    }

    #[test]
    fn test_parse_regex_match_with_flags() {
        let program = parse_vcl(r#"sub t { if (req.url ~ "^/admin") { return(pass); } }"#);
        let Statement::If { test, .. } = &program.subroutines[0].body[0] else {
            panic!("expected if");
        };
        let Expression::Binary { op, right, .. } = test else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinaryOp::Match);
        // No /.../flags form, so the whole text is the pattern.
        assert_eq!(
            **right,
            Expression::Regex {
                pattern: "^/admin".to_string(),
                flags: String::new(),
            }
        );

        let program = parse_vcl(r#"sub t { if (req.url ~ "/^admin/i") { return(pass); } }"#);
        let Statement::If { test, .. } = &program.subroutines[0].body[0] else {
            panic!("expected if");
        };
        let Expression::Binary { right, .. } = test else {
            panic!("expected binary");
        };
        assert_eq!(
            **right,
            Expression::Regex {
                pattern: "^admin".to_string(),
                flags: "i".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_error_statement() {
        let program = parse_vcl(r#"sub s { error 403 "Forbidden"; error 404; }"#);
        let body = &program.subroutines[0].body;
        assert_eq!(
            body[0],
            Statement::Error {
                status: 403,
                message: Some(Expression::Str("Forbidden".to_string())),
            }
        );
        assert_eq!(
            body[1],
            Statement::Error {
                status: 404,
                message: None,
            }
        );
    }

    #[test]
    fn test_parse_synthetic_brace_block() {
        let program = parse_vcl(
            "sub vcl_error {\n  synthetic {\"<html><body>down</body></html>\"};\n  return(deliver);\n}",
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let Statement::Synthetic { expr } = &program.subroutines[0].body[0] else {
            panic!("expected synthetic");
        };
        assert_eq!(
            *expr,
            Expression::Str("<html><body>down</body></html>".to_string())
        );
    }

    #[test]
    fn test_parse_declare_and_goto() {
        let program = parse_vcl(
            r#"sub s {
                declare local var.count INTEGER;
                set var.count = 0;
                again:
                set var.count = var.count + 1;
                if (var.count < 3) { goto again; }
            }"#,
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let body = &program.subroutines[0].body;
        assert_eq!(
            body[0],
            Statement::Declare {
                name: "var.count".to_string(),
                ty: VarType::Integer,
            }
        );
        assert_eq!(
            body[2],
            Statement::Label {
                name: "again".to_string()
            }
        );
    }

    #[test]
    fn test_parse_acl_with_subnets() {
        let program = parse_vcl(
            r#"acl trusted {
                "127.0.0.1";
                "192.168.0.0"/16;
                "10.0.0.0/8";
                !"192.168.44.0"/24;
            }"#,
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let acl = &program.acls[0];
        assert_eq!(acl.name, "trusted");
        assert_eq!(acl.entries[0].subnet, None);
        assert_eq!(acl.entries[1].subnet, Some(16));
        assert_eq!(acl.entries[2].subnet, Some(8));
        assert!(acl.entries[3].negated);
    }

    #[test]
    fn test_parse_table() {
        let program = parse_vcl(
            r#"table redirects {
                "/old": "/new",
                "limit": 5,
                "ratio": 0.5,
                "enabled": true
            }"#,
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let table = &program.tables[0];
        assert_eq!(table.entries.len(), 4);
        assert_eq!(
            table.entries[0],
            ("/old".to_string(), TableValue::Str("/new".to_string()))
        );
        assert_eq!(
            table.entries[1],
            ("limit".to_string(), TableValue::Integer(5))
        );
        assert_eq!(table.entries[3], ("enabled".to_string(), TableValue::Bool(true)));
    }

    #[test]
    fn test_parse_backend_with_probe() {
        let program = parse_vcl(
            r#"backend origin {
                .host = "origin.example.com";
                .port = "443";
                .connect_timeout = 1s;
                .probe = {
                    .url = "/health";
                    .interval = 5s;
                }
            }"#,
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let backend = &program.backends[0];
        assert_eq!(backend.name, "origin");
        assert!(matches!(
            backend.properties.get("probe"),
            Some(BackendValue::Block(_))
        ));
    }

    #[test]
    fn test_parse_director() {
        let program = parse_vcl(
            r#"director balanced random {
                .quorum = 50%;
                .retries = 3;
                { .backend = origin_a; .weight = 2; }
                { .backend = origin_b; .weight = 1; }
            }"#,
        );
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let director = &program.directors[0];
        assert_eq!(director.kind, DirectorKind::Random);
        assert_eq!(director.quorum, Some(50));
        assert_eq!(director.retries, Some(3));
        assert_eq!(director.backends.len(), 2);
        assert_eq!(director.backends[0].weight, 2);
    }

    #[test]
    fn test_parse_include_and_import() {
        let program = parse_vcl("include \"common.vcl\";\nimport std;\nsub s { return(pass); }");
        assert_eq!(program.includes, vec!["common.vcl".to_string()]);
        assert_eq!(program.imports, vec!["std".to_string()]);
    }

    #[test]
    fn test_ternary_expression() {
        let program = parse_vcl(r#"sub s { set req.http.X = req.http.A ? "yes" : "no"; }"#);
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        let Statement::Set { expr, .. } = &program.subroutines[0].body[0] else {
            panic!("expected set");
        };
        assert!(matches!(expr, Expression::Ternary { .. }));
    }

    #[test]
    fn test_adjacent_string_concatenation() {
        let program = parse_vcl(r#"sub s { set req.http.X = "a" "b"; }"#);
        let Statement::Set { expr, .. } = &program.subroutines[0].body[0] else {
            panic!("expected set");
        };
        assert_eq!(
            *expr,
            Expression::Binary {
                op: BinaryOp::Add,
                left: Box::new(Expression::Str("a".to_string())),
                right: Box::new(Expression::Str("b".to_string())),
            }
        );
    }

    #[test]
    fn test_recovery_keeps_later_statements() {
        let program = parse_vcl(
            r#"sub s {
                set req.http.X = ;
                set req.http.Y = "ok";
            }"#,
        );
        assert!(!program.diagnostics.is_empty());
        let body = &program.subroutines[0].body;
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0], Statement::Set { target, .. } if target == "req.http.Y"));
    }

    #[test]
    fn test_recovery_keeps_other_declarations() {
        let program = parse_vcl(
            r#"sub broken { if ( { }
               acl trusted { "127.0.0.1"; }
               sub ok { return(pass); }"#,
        );
        assert!(!program.diagnostics.is_empty());
        assert_eq!(program.acls.len(), 1);
        assert!(program.subroutine("ok").is_some());
    }

    #[test]
    fn test_call_statement() {
        let program = parse_vcl(r#"sub s { waf.allow(); }"#);
        assert!(program.diagnostics.is_empty(), "{:?}", program.diagnostics);
        assert_eq!(
            program.subroutines[0].body[0],
            Statement::Call {
                name: "waf.allow".to_string(),
                args: CallArgs::new(),
            }
        );
    }

    #[test]
    fn test_comments_collected() {
        let program = parse_vcl("# top\nsub s { /* inner */ return(pass); }");
        assert_eq!(program.comments.len(), 2);
        assert!(program.diagnostics.is_empty());
    }

    #[test]
    fn test_pretty_print_round_trip() {
        let source = r#"
            include "base.vcl";
            import std;
            acl trusted { "127.0.0.1"; "192.168.0.0"/16; }
            table t { "k": "v", "n": 3, }
            sub vcl_recv {
                if (req.url ~ "^/api/") {
                    set req.backend = "api";
                } else {
                    set req.backend = "default";
                }
                error 403 "no";
            }
        "#;
        let first = parse_vcl(source);
        assert!(first.diagnostics.is_empty(), "{:?}", first.diagnostics);
        let printed = first.to_string();
        let second = parse_vcl(&printed);
        assert!(second.diagnostics.is_empty(), "{:?}", second.diagnostics);
        assert_eq!(first.subroutines, second.subroutines);
        assert_eq!(first.acls, second.acls);
        assert_eq!(first.tables, second.tables);
        assert_eq!(first.includes, second.includes);
        assert_eq!(first.imports, second.imports);
    }
}
