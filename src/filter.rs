//! Stack-trace filter specifications.
//!
//! A filter file is a disjunction of conjunctions over stack frames: each
//! clause is a list of `SYM <regex>` / `EXEC <regex>` / `ANY <regex>`
//! predicates, clauses are separated by a literal `OR` line, and `#` starts
//! a comment. The filtering itself runs inside the probe's processing
//! script; this module parses, validates, and ships the specification.

use std::fmt;
use std::path::PathBuf;

use regex::Regex;
use serde_json::{json, Value};

use crate::errors::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    Sym,
    Exec,
    Any,
}

impl PredicateKind {
    fn as_str(&self) -> &'static str {
        match self {
            PredicateKind::Sym => "SYM",
            PredicateKind::Exec => "EXEC",
            PredicateKind::Any => "ANY",
        }
    }
}

/// One frame predicate, regex kept verbatim for round-tripping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub kind: PredicateKind,
    pub regex: String,
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.regex)
    }
}

/// Disjunction of conjunctions, clause and predicate order preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPattern {
    pub clauses: Vec<Vec<Predicate>>,
}

impl FilterPattern {
    /// Parse the filter file format. Any non-empty, non-comment line that is
    /// neither `OR` nor a valid predicate is fatal, as is a regex that does
    /// not compile.
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let mut clauses = Vec::new();
        let mut current = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "OR" {
                clauses.push(std::mem::take(&mut current));
                continue;
            }

            let (kind, rest) = match line.split_once(' ') {
                Some(("SYM", rest)) => (PredicateKind::Sym, rest),
                Some(("EXEC", rest)) => (PredicateKind::Exec, rest),
                Some(("ANY", rest)) => (PredicateKind::Any, rest),
                _ => {
                    return Err(SessionError::User(format!(
                        "line {} of the filter list is non-empty and invalid",
                        idx + 1
                    )))
                }
            };
            if rest.is_empty() {
                return Err(SessionError::User(format!(
                    "line {} of the filter list is non-empty and invalid",
                    idx + 1
                )));
            }
            Regex::new(rest).map_err(|err| {
                SessionError::User(format!(
                    "line {} of the filter list has a bad regex: {}",
                    idx + 1,
                    err
                ))
            })?;
            current.push(Predicate {
                kind,
                regex: rest.to_string(),
            });
        }

        if !current.is_empty() {
            clauses.push(current);
        }

        Ok(FilterPattern { clauses })
    }

    /// Inverse of [`FilterPattern::parse`] modulo comments and blank lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                out.push_str("OR\n");
            }
            for pred in clause {
                out.push_str(&pred.to_string());
                out.push('\n');
            }
        }
        out
    }

    /// Predicate clauses as raw strings, the shape the processing script
    /// matches against.
    fn conditions(&self) -> Value {
        Value::Array(
            self.clauses
                .iter()
                .map(|clause| {
                    Value::Array(clause.iter().map(|p| Value::String(p.to_string())).collect())
                })
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default)]
pub enum FilterMode {
    #[default]
    None,
    Allow(FilterPattern),
    Deny(FilterPattern),
    Script(PathBuf),
}

/// A validated `-i`/`-k` combination.
#[derive(Debug, Clone, Default)]
pub struct StackFilter {
    pub mode: FilterMode,
    pub mark: bool,
}

impl StackFilter {
    /// The `filter_settings` frame pushed to the probe child, or `None` when
    /// filtering is disabled.
    pub fn settings_frame(&self) -> Option<Value> {
        let data = match &self.mode {
            FilterMode::None => return None,
            FilterMode::Allow(pattern) => json!({
                "type": "allow",
                "conditions": pattern.conditions(),
                "mark": self.mark,
            }),
            FilterMode::Deny(pattern) => json!({
                "type": "deny",
                "conditions": pattern.conditions(),
                "mark": self.mark,
            }),
            FilterMode::Script(path) => json!({
                "type": "python",
                "script": path.to_string_lossy(),
                "mark": self.mark,
            }),
        };
        Some(json!({ "type": "filter_settings", "data": data }))
    }
}
