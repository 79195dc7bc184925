//! Path expressions over a resource's JSON form
//!
//! The accepted grammar is the kubectl JSONPath subset that addresses a single
//! value:
//!
//! ```text
//! {.status.endpoint}
//! {.spec.ports[0].targetPort}
//! {.data['tls.crt']}
//! ```
//!
//! The braces and the leading dot are optional. Filters, wildcards, slices
//! and recursive descent are rejected.

use std::fmt;

use serde_json::Value;

use crate::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
}

/// A parsed path expression
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathExpression {
    raw: String,
    segments: Vec<Segment>,
}

impl fmt::Display for PathExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PathExpression {
    /// Parse an expression
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let invalid = |msg: &str| Error::configuration(format!("invalid path {}: {}", raw, msg));

        let trimmed = raw.trim();
        let body = match (trimmed.strip_prefix('{'), trimmed.ends_with('}')) {
            (Some(rest), true) => &rest[..rest.len() - 1],
            (None, false) => trimmed,
            _ => return Err(invalid("unbalanced braces")),
        };
        if body.contains("..") || body.contains('*') || body.contains('?') {
            return Err(invalid("only single-value paths are supported"));
        }
        let body = body.strip_prefix('.').unwrap_or(body);

        let mut segments = Vec::new();
        let mut chars = body.chars().peekable();
        let mut field = String::new();
        let mut after_bracket = false;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if field.is_empty() && !after_bracket {
                        return Err(invalid("empty field name"));
                    }
                    after_bracket = false;
                    if !field.is_empty() {
                        segments.push(Segment::Field(std::mem::take(&mut field)));
                    }
                    if chars.peek().is_none() {
                        return Err(invalid("trailing dot"));
                    }
                }
                '[' => {
                    if !field.is_empty() {
                        segments.push(Segment::Field(std::mem::take(&mut field)));
                    }
                    let mut inner = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(ch) => inner.push(ch),
                            None => return Err(invalid("unclosed '['")),
                        }
                    }
                    segments.push(parse_bracket(&inner).ok_or_else(|| {
                        invalid("brackets must hold an index or a quoted key")
                    })?);
                    after_bracket = true;
                }
                ']' => return Err(invalid("unexpected ']'")),
                c => {
                    after_bracket = false;
                    field.push(c);
                }
            }
        }
        if !field.is_empty() {
            segments.push(Segment::Field(field));
        }
        if segments.is_empty() {
            return Err(invalid("empty path"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// Walk the expression through `root`
    pub fn evaluate<'a>(&self, root: &'a Value) -> Result<&'a Value, Error> {
        let mut current = root;
        for segment in &self.segments {
            let next = match (segment, current) {
                (Segment::Field(name), Value::Object(map)) => map.get(name),
                (Segment::Index(i), Value::Array(items)) => items.get(*i),
                _ => None,
            };
            current = match next {
                Some(Value::Null) | None => {
                    return Err(Error::configuration(format!(
                        "path {} does not resolve to a value",
                        self.raw
                    )))
                }
                Some(v) => v,
            };
        }
        Ok(current)
    }

    /// Evaluate and render the value as text
    ///
    /// Strings are returned verbatim, scalars in their JSON spelling, objects
    /// and arrays as compact JSON.
    pub fn resolve(&self, root: &Value) -> Result<String, Error> {
        Ok(match self.evaluate(root)? {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Secret key derived from the expression text
    ///
    /// Braces, brackets and quotes are dropped and dots kept, then anything
    /// outside `[-._a-zA-Z0-9]` is removed:
    /// `{.spec.ports[0].targetPort}` gives `.spec.ports0.targetPort`.
    pub fn secret_key(&self) -> Result<String, Error> {
        let key: String = self
            .raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '{' | '}' | '[' | ']' | '\'' | '"'))
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
            .collect();
        if key.trim_matches('.').is_empty() {
            return Err(Error::configuration(format!(
                "path {} does not yield a usable key name",
                self.raw
            )));
        }
        Ok(key)
    }
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    let inner = inner.trim();
    if let Ok(i) = inner.parse::<usize>() {
        return Some(Segment::Index(i));
    }
    let quoted = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))?;
    (!quoted.is_empty()).then(|| Segment::Field(quoted.to_string()))
}
