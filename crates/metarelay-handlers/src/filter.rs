//! The filter expression language: `path op literal`.
//!
//! Grammar, deliberately tiny (equality only):
//!
//! ```text
//! expr    := path op literal
//! op      := '==' | '!='
//! path    := IDENT ('.' IDENT)*
//! literal := single-or-double-quoted string
//! ```
//!
//! Expressions are parsed once at handler load; malformed input is a load
//! error, never a match-time error. Comparison is string equality on the
//! stringified value at the path, with missing paths reading as "".

use metarelay_core::{resolve_event_path, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    path: String,
    op: FilterOp,
    literal: String,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, String> {
        Parser::new(input).parse()
    }

    pub fn matches(&self, event: &Event) -> bool {
        let actual = resolve_event_path(event, &self.path);
        match self.op {
            FilterOp::Eq => actual == self.literal,
            FilterOp::Ne => actual != self.literal,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

struct Parser<'a> {
    rest: &'a str,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            rest: source.trim(),
            source,
        }
    }

    fn parse(mut self) -> Result<Filter, String> {
        let path = self.path()?;
        self.skip_whitespace();
        let op = self.op()?;
        self.skip_whitespace();
        let literal = self.literal()?;
        self.skip_whitespace();
        if !self.rest.is_empty() {
            return Err(self.fail("trailing input after literal"));
        }
        Ok(Filter { path, op, literal })
    }

    fn path(&mut self) -> Result<String, String> {
        let mut path = self.ident()?;
        while let Some(rest) = self.rest.strip_prefix('.') {
            self.rest = rest;
            path.push('.');
            path.push_str(&self.ident()?);
        }
        Ok(path)
    }

    fn ident(&mut self) -> Result<String, String> {
        let end = self
            .rest
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return Err(self.fail("expected identifier"));
        }
        let (ident, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(ident.to_string())
    }

    fn op(&mut self) -> Result<FilterOp, String> {
        if let Some(rest) = self.rest.strip_prefix("==") {
            self.rest = rest;
            Ok(FilterOp::Eq)
        } else if let Some(rest) = self.rest.strip_prefix("!=") {
            self.rest = rest;
            Ok(FilterOp::Ne)
        } else {
            Err(self.fail("expected '==' or '!='"))
        }
    }

    fn literal(&mut self) -> Result<String, String> {
        let quote = match self.rest.chars().next() {
            Some(ch @ ('\'' | '"')) => ch,
            _ => return Err(self.fail("expected quoted string literal")),
        };
        let body = &self.rest[quote.len_utf8()..];
        let Some(end) = body.find(quote) else {
            return Err(self.fail("unterminated string literal"));
        };
        let literal = body[..end].to_string();
        self.rest = &body[end + quote.len_utf8()..];
        Ok(literal)
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn fail(&self, message: &str) -> String {
        format!("invalid filter expression '{}': {message}", self.source)
    }
}
