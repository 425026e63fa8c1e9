//! Selector construction and evaluation.
//!
//! A selector is a conjunction of string equality clauses
//! (`key = 'value' AND key2 = 'value2'`) used to filter messages during
//! receive and browse. [`build_selector`] turns a property map into such an
//! expression; [`Selector`] parses one back for evaluation by the in-memory
//! broker.

use std::collections::{BTreeMap, HashMap};

use crate::error::{ClientError, Result};

/// Builds a selector expression from a key/value map.
///
/// Entries with an empty key or empty value are skipped. Keys are emitted in
/// sorted order so the output is deterministic. Returns `None` when no clause
/// survives (receive/browse everything).
pub fn build_selector(map: &HashMap<String, String>) -> Option<String> {
    let sorted: BTreeMap<&String, &String> = map.iter().collect();
    let mut expr = String::new();
    for (key, value) in sorted {
        if key.is_empty() || value.is_empty() {
            continue;
        }
        if !expr.is_empty() {
            expr.push_str(" AND ");
        }
        expr.push_str(key);
        expr.push_str(" = '");
        expr.push_str(value);
        expr.push('\'');
    }
    if expr.is_empty() {
        None
    } else {
        Some(expr)
    }
}

/// A parsed selector: a conjunction of `key = 'value'` clauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    clauses: Vec<(String, String)>,
}

impl Selector {
    /// Parses a selector expression.
    ///
    /// Only conjunctions of quoted string equality clauses are supported,
    /// which is exactly what [`build_selector`] produces.
    pub fn parse(expr: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        for clause in expr.split(" AND ") {
            let (key, value) = clause.split_once('=').ok_or_else(|| {
                ClientError::transport(format!("invalid selector clause [{clause}]"))
            })?;
            let key = key.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(|| {
                    ClientError::transport(format!("unquoted selector value in [{clause}]"))
                })?;
            if key.is_empty() {
                return Err(ClientError::transport(format!(
                    "empty selector key in [{clause}]"
                )));
            }
            clauses.push((key.to_string(), value.to_string()));
        }
        Ok(Self { clauses })
    }

    /// Returns `true` if every clause matches the given properties.
    pub fn matches(&self, properties: &HashMap<String, String>) -> bool {
        self.clauses
            .iter()
            .all(|(key, value)| properties.get(key).is_some_and(|v| v == value))
    }
}
