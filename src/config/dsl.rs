/**
 * Copyright (c) 2024-2025 Glaive, Inc.
 *
 * This file is part of Glaive Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Lexer and recursive-descent parser for the whitespace-indented,
//! Caddy-style DSL (`.ly` files). Hand-written, since no off-the-shelf
//! crate covers this grammar; the structured `appsettings`-shape format is
//! parsed by `serde_yaml` directly into `config::model::RawConfig`.
//!
//! The parser produces a generic [`Node`] tree: duplicated keys at the same
//! level become an ordered list, `var`/`import`/`if` are resolved at parse
//! time. `config::normalize` walks the tree into the typed `RawConfig`.

use std::collections::{HashMap, HashSet};
use std::fmt;

use once_cell::sync::Lazy;

use crate::errors::{GatewayError, GatewayResult};

/// Reserved statement keywords handled by the parser itself rather than
/// collected as plain config keys.
static DSL_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| ["var", "import", "if"].into_iter().collect());

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Bool(bool),
    Var(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Eq,
    EqEq,
    NotEq,
    Newline,
    Eof,
}

pub struct Lexer<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    pub line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            chars: src.char_indices().peekable(),
            line: 1,
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.chars.next().map(|(_, c)| c);
        if next == Some('\n') {
            self.line += 1;
        }
        next
    }

    fn skip_inline_space(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == ' ' || c == '\t' || c == '\r' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek_char() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    pub fn next_token(&mut self) -> GatewayResult<Token> {
        loop {
            self.skip_inline_space();
            match self.peek_char() {
                None => return Ok(Token::Eof),
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                Some('\n') => {
                    self.bump();
                    return Ok(Token::Newline);
                }
                Some('{') => {
                    self.bump();
                    return Ok(Token::LBrace);
                }
                Some('}') => {
                    self.bump();
                    return Ok(Token::RBrace);
                }
                Some('[') => {
                    self.bump();
                    return Ok(Token::LBracket);
                }
                Some(']') => {
                    self.bump();
                    return Ok(Token::RBracket);
                }
                Some(':') => {
                    self.bump();
                    return Ok(Token::Colon);
                }
                Some(',') => {
                    self.bump();
                    return Ok(Token::Comma);
                }
                Some('=') => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        return Ok(Token::EqEq);
                    }
                    return Ok(Token::Eq);
                }
                Some('!') => {
                    self.bump();
                    if self.peek_char() == Some('=') {
                        self.bump();
                        return Ok(Token::NotEq);
                    }
                    return Err(GatewayError::ConfigSyntax {
                        file: String::new(),
                        line: self.line,
                        message: "unexpected '!'".to_string(),
                    });
                }
                Some('"') | Some('\'') => return self.lex_string(),
                Some('$') => return self.lex_var(),
                Some(c) if c.is_ascii_digit() || c == '-' => return self.lex_number(),
                Some(_) => return self.lex_ident_or_bool(),
            }
        }
    }

    fn lex_string(&mut self) -> GatewayResult<Token> {
        let quote = self.bump().unwrap();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(GatewayError::ConfigSyntax {
                        file: String::new(),
                        line: self.line,
                        message: "unterminated string".to_string(),
                    })
                }
                Some(c) if c == quote => break,
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('\\') => out.push('\\'),
                    Some(q) if q == quote => out.push(q),
                    Some(other) => out.push(other),
                    None => {
                        return Err(GatewayError::ConfigSyntax {
                            file: String::new(),
                            line: self.line,
                            message: "unterminated escape".to_string(),
                        })
                    }
                },
                Some(c) => out.push(c),
            }
        }
        Ok(Token::Str(out))
    }

    fn lex_var(&mut self) -> GatewayResult<Token> {
        self.bump(); // consume '$'
        if self.peek_char() == Some('{') {
            self.bump();
            let mut name = String::new();
            while let Some(c) = self.peek_char() {
                if c == '}' {
                    self.bump();
                    break;
                }
                name.push(c);
                self.bump();
            }
            Ok(Token::Var(name))
        } else {
            let mut name = String::new();
            while let Some(c) = self.peek_char() {
                if c.is_alphanumeric() || c == '_' {
                    name.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            Ok(Token::Var(name))
        }
    }

    fn lex_number(&mut self) -> GatewayResult<Token> {
        let mut text = String::new();
        if self.peek_char() == Some('-') {
            text.push('-');
            self.bump();
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() || c == '.' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| GatewayError::ConfigSyntax {
                file: String::new(),
                line: self.line,
                message: format!("invalid number literal '{text}'"),
            })
    }

    fn lex_ident_or_bool(&mut self) -> GatewayResult<Token> {
        let mut text = String::new();
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() || "{}[]:,=!#".contains(c) {
                break;
            }
            text.push(c);
            self.bump();
        }
        if text.is_empty() {
            return Err(GatewayError::ConfigSyntax {
                file: String::new(),
                line: self.line,
                message: "unexpected character".to_string(),
            });
        }
        match text.as_str() {
            "true" => Ok(Token::Bool(true)),
            "false" => Ok(Token::Bool(false)),
            _ => Ok(Token::Ident(text)),
        }
    }
}

/// A DSL value: either a scalar, a nested block, or a repeated-key list.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Number(f64),
    Bool(bool),
    Block(Node),
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{s}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Block(_) => write!(f, "<block>"),
            Value::List(_) => write!(f, "<list>"),
        }
    }
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Number(n) => *n != 0.0,
            Value::Block(_) | Value::List(_) => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Ordered mapping; a statement is `key args... { block }` or `key = value`.
/// Duplicate keys at the same level are merged into a `Value::List`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub entries: Vec<(String, Value)>,
}

impl Node {
    pub fn push(&mut self, key: String, value: Value) {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            match existing {
                Value::List(items) => items.push(value),
                other => {
                    let prev = other.clone();
                    *existing = Value::List(vec![prev, value]);
                }
            }
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// All values for `key`, flattening a `Value::List` into its items.
    pub fn get_all(&self, key: &str) -> Vec<&Value> {
        match self.get(key) {
            Some(Value::List(items)) => items.iter().collect(),
            Some(other) => vec![other],
            None => vec![],
        }
    }
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Token,
    vars: HashMap<String, Value>,
    file: String,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a str, file: &str) -> GatewayResult<Self> {
        let mut lexer = Lexer::new(src);
        let lookahead = lexer.next_token()?;
        Ok(Parser {
            lexer,
            lookahead,
            vars: HashMap::new(),
            file: file.to_string(),
        })
    }

    fn err(&self, message: impl Into<String>) -> GatewayError {
        GatewayError::ConfigSyntax {
            file: self.file.clone(),
            line: self.lexer.line,
            message: message.into(),
        }
    }

    fn advance(&mut self) -> GatewayResult<Token> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.lookahead, next))
    }

    fn skip_newlines(&mut self) -> GatewayResult<()> {
        while self.lookahead == Token::Newline {
            self.advance()?;
        }
        Ok(())
    }

    /// Parses the whole file as a top-level block (no enclosing braces).
    pub fn parse_document(&mut self) -> GatewayResult<Node> {
        let node = self.parse_block_body(false)?;
        Ok(node)
    }

    fn parse_block_body(&mut self, nested: bool) -> GatewayResult<Node> {
        let mut node = Node::default();
        loop {
            self.skip_newlines()?;
            if self.lookahead == Token::Eof {
                break;
            }
            if nested && self.lookahead == Token::RBrace {
                break;
            }
            self.parse_statement(&mut node)?;
        }
        Ok(node)
    }

    fn parse_statement(&mut self, node: &mut Node) -> GatewayResult<()> {
        let key = match self.advance()? {
            Token::Ident(k) => k,
            other => return Err(self.err(format!("expected identifier, found {other:?}"))),
        };

        if DSL_KEYWORDS.contains(key.as_str()) {
            match key.as_str() {
                "var" => return self.parse_var_decl(),
                "import" => return self.parse_import(node),
                "if" => return self.parse_if(node),
                _ => unreachable!("DSL_KEYWORDS out of sync with dispatch arms"),
            }
        }

        // `key = value` scalar assignment
        if self.lookahead == Token::Eq {
            self.advance()?;
            let value = self.parse_scalar()?;
            node.push(key, value);
            self.expect_statement_end()?;
            return Ok(());
        }

        // collect bare arguments until `{`, newline, or eof
        let mut args = Vec::new();
        loop {
            match &self.lookahead {
                Token::LBrace | Token::Newline | Token::Eof => break,
                _ => args.push(self.parse_scalar()?),
            }
        }

        if self.lookahead == Token::LBrace {
            self.advance()?;
            let inner = self.parse_block_body(true)?;
            if self.lookahead != Token::RBrace {
                return Err(self.err("expected '}'"));
            }
            self.advance()?;
            let mut block = inner;
            if !args.is_empty() {
                block.push("_args".to_string(), Value::List(args));
            }
            node.push(key, Value::Block(block));
        } else if args.len() == 1 {
            node.push(key, args.into_iter().next().unwrap());
        } else if !args.is_empty() {
            node.push(key, Value::List(args));
        } else {
            node.push(key, Value::Bool(true));
        }
        self.expect_statement_end()?;
        Ok(())
    }

    fn expect_statement_end(&mut self) -> GatewayResult<()> {
        match self.lookahead {
            Token::Newline | Token::Eof | Token::RBrace => Ok(()),
            _ => Err(self.err(format!("unexpected trailing token {:?}", self.lookahead))),
        }
    }

    fn parse_scalar(&mut self) -> GatewayResult<Value> {
        let token = self.advance()?;
        match token {
            Token::Str(s) => Ok(Value::Str(self.substitute_in_string(&s))),
            Token::Number(n) => Ok(Value::Number(n)),
            Token::Bool(b) => Ok(Value::Bool(b)),
            Token::Var(name) => Ok(self.vars.get(&name).cloned().unwrap_or(Value::Str(String::new()))),
            Token::Ident(s) => Ok(Value::Str(s)),
            other => Err(self.err(format!("expected value, found {other:?}"))),
        }
    }

    fn substitute_in_string(&self, raw: &str) -> String {
        // variables inside string literals are not re-lexed; only bare
        // `$name`/`${name}` tokens outside strings get substituted at parse
        // time per the DSL definition. Strings pass through untouched.
        raw.to_string()
    }

    fn parse_var_decl(&mut self) -> GatewayResult<()> {
        let name = match self.advance()? {
            Token::Ident(n) => n,
            other => return Err(self.err(format!("expected variable name, found {other:?}"))),
        };
        if self.advance()? != Token::Eq {
            return Err(self.err("expected '=' in var declaration"));
        }
        let value = self.parse_scalar()?;
        self.vars.insert(name, value);
        self.expect_statement_end()
    }

    fn parse_import(&mut self, node: &mut Node) -> GatewayResult<()> {
        let path = match self.parse_scalar()? {
            Value::Str(s) => s,
            other => return Err(self.err(format!("import expects a string path, found {other}"))),
        };
        node.push("_import".to_string(), Value::Str(path));
        self.expect_statement_end()
    }

    fn parse_if(&mut self, node: &mut Node) -> GatewayResult<()> {
        let lhs = self.parse_scalar()?;
        let (cond, truthy) = match &self.lookahead {
            Token::EqEq => {
                self.advance()?;
                let rhs = self.parse_scalar()?;
                (true, values_equal(&lhs, &rhs))
            }
            Token::NotEq => {
                self.advance()?;
                let rhs = self.parse_scalar()?;
                (true, !values_equal(&lhs, &rhs))
            }
            Token::Ident(op) if op == "eq" || op == "ne" => {
                let is_eq = op == "eq";
                self.advance()?;
                let rhs = self.parse_scalar()?;
                (true, if is_eq { values_equal(&lhs, &rhs) } else { !values_equal(&lhs, &rhs) })
            }
            _ => (false, lhs.truthy()),
        };
        let _ = cond;

        if self.advance()? != Token::LBrace {
            return Err(self.err("expected '{' after if condition"));
        }
        let then_branch = self.parse_block_body(true)?;
        if self.advance()? != Token::RBrace {
            return Err(self.err("expected '}' to close if-block"));
        }

        let mut else_branch = None;
        self.skip_newlines()?;
        if self.lookahead == Token::Ident("else".to_string()) {
            self.advance()?;
            if self.advance()? != Token::LBrace {
                return Err(self.err("expected '{' after else"));
            }
            let body = self.parse_block_body(true)?;
            if self.advance()? != Token::RBrace {
                return Err(self.err("expected '}' to close else-block"));
            }
            else_branch = Some(body);
        }

        let chosen = if truthy {
            then_branch
        } else {
            else_branch.unwrap_or_default()
        };
        for (k, v) in chosen.entries {
            node.push(k, v);
        }
        Ok(())
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => a.to_string() == b.to_string(),
    }
}

/// Parses one DSL file. `import` directives are returned as `_import` entries
/// for the caller to resolve relative to the importing file's directory
/// (kept out of this module to avoid doing file IO inside the lexer/parser).
pub fn parse_str(src: &str, file_name: &str) -> GatewayResult<Node> {
    let mut parser = Parser::new(src, file_name)?;
    parser.parse_document()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_scalars() {
        let doc = parse_str("host = \"example.com\"\nport = 8080\n", "t").unwrap();
        assert_eq!(doc.get("host"), Some(&Value::Str("example.com".to_string())));
        assert_eq!(doc.get("port"), Some(&Value::Number(8080.0)));
    }

    #[test]
    fn duplicate_keys_become_list() {
        let doc = parse_str("listen 80\nlisten 443\n", "t").unwrap();
        match doc.get("listen") {
            Some(Value::List(items)) => assert_eq!(items.len(), 2),
            other => panic!("expected list, got {other:?}"),
        }
    }

    #[test]
    fn parses_nested_block_with_bare_args() {
        let src = "route api {\n  path = \"/api/*\"\n  cluster_id = \"backend\"\n}\n";
        let doc = parse_str(src, "t").unwrap();
        match doc.get("route") {
            Some(Value::Block(inner)) => {
                assert_eq!(inner.get("_args"), Some(&Value::List(vec![Value::Str("api".to_string())])));
                assert_eq!(inner.get("path"), Some(&Value::Str("/api/*".to_string())));
            }
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let doc = parse_str("# a comment\n\nfoo = \"bar\"\n# trailing\n", "t").unwrap();
        assert_eq!(doc.get("foo"), Some(&Value::Str("bar".to_string())));
    }

    #[test]
    fn var_decl_is_substituted_in_later_scalars() {
        let doc = parse_str("var backend = \"10.0.0.1\"\ntarget = $backend\n", "t").unwrap();
        assert_eq!(doc.get("target"), Some(&Value::Str("10.0.0.1".to_string())));
    }

    #[test]
    fn if_true_branch_is_kept() {
        let doc = parse_str("if true {\n  enabled = true\n}\n", "t").unwrap();
        assert_eq!(doc.get("enabled"), Some(&Value::Bool(true)));
    }

    #[test]
    fn if_false_takes_else_branch() {
        let doc = parse_str("if false {\n  mode = \"a\"\n} else {\n  mode = \"b\"\n}\n", "t").unwrap();
        assert_eq!(doc.get("mode"), Some(&Value::Str("b".to_string())));
    }

    #[test]
    fn eq_comparison_condition() {
        let doc = parse_str("var env = \"prod\"\nif $env == \"prod\" {\n  strict = true\n}\n", "t").unwrap();
        assert_eq!(doc.get("strict"), Some(&Value::Bool(true)));
    }

    #[test]
    fn import_directive_recorded_for_caller() {
        let doc = parse_str("import \"./routes.ly\"\n", "t").unwrap();
        assert_eq!(doc.get("_import"), Some(&Value::Str("./routes.ly".to_string())));
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let err = parse_str("host = \"unterminated\n", "t").unwrap_err();
        assert!(matches!(err, GatewayError::ConfigSyntax { .. }));
    }
}
