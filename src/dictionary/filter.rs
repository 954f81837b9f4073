//! Derives dictionary query predicates from handler filters.
//!
//! The dictionary can only narrow the set of heights when every handler in the
//! project expresses a content predicate. A single handler that could match any
//! block (no filter body, a block handler, or an empty call/event filter)
//! disables acceleration for the whole project, which is signalled by an empty
//! predicate list.

use super::hashing::{event_to_topic, function_to_selector};
use crate::project::{CallFilter, Datasource, HandlerKind, LogFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const TRANSACTIONS_ENTITY: &str = "transactions";
pub const LOGS_ENTITY: &str = "logs";
const MAX_TOPICS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryCondition {
    pub field: String,
    pub value: String,
}

impl QueryCondition {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Filter over one dictionary entity; all conditions must hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPredicate {
    pub entity: String,
    pub conditions: Vec<QueryCondition>,
}

impl QueryPredicate {
    /// Identity used for deduplication: entity plus conditions ordered by field.
    pub fn canonical_key(&self) -> (String, Vec<QueryCondition>) {
        let mut conditions = self.conditions.clone();
        conditions.sort_by(|lhs, rhs| lhs.field.cmp(&rhs.field));
        (self.entity.clone(), conditions)
    }
}

/// Compiles the predicates for every handler of every datasource.
///
/// Returns an empty list as soon as one handler cannot be expressed as a predicate.
pub fn compile_predicates<'a, I>(datasources: I) -> Vec<QueryPredicate>
where
    I: IntoIterator<Item = &'a Datasource>,
{
    let mut predicates = Vec::new();

    for datasource in datasources {
        for handler in &datasource.handlers {
            let predicate = match &handler.kind {
                HandlerKind::Block { .. } => None,
                HandlerKind::Call { filter } => filter.as_ref().and_then(call_predicate),
                HandlerKind::Event { filter } => filter.as_ref().and_then(log_predicate),
            };

            match predicate {
                Some(predicate) => predicates.push(predicate),
                None => {
                    tracing::debug!(
                        handler = %handler.handler,
                        datasource = datasource.name.as_deref().unwrap_or("<unnamed>"),
                        "handler has no dictionary-compatible filter; dictionary disabled"
                    );
                    return Vec::new();
                }
            }
        }
    }

    dedup_predicates(predicates)
}

/// Keeps the first occurrence of each canonical predicate.
pub fn dedup_predicates(predicates: Vec<QueryPredicate>) -> Vec<QueryPredicate> {
    let mut seen = HashSet::new();
    predicates
        .into_iter()
        .filter(|predicate| seen.insert(predicate.canonical_key()))
        .collect()
}

fn call_predicate(filter: &CallFilter) -> Option<QueryPredicate> {
    let mut conditions = Vec::new();
    if let Some(from) = populated(&filter.from) {
        conditions.push(QueryCondition::new("from", from.to_ascii_lowercase()));
    }
    if let Some(to) = populated(&filter.to) {
        conditions.push(QueryCondition::new("to", to.to_ascii_lowercase()));
    }
    if let Some(function) = populated(&filter.function) {
        conditions.push(QueryCondition::new("func", function_to_selector(function)));
    }

    if conditions.is_empty() {
        return None;
    }
    Some(QueryPredicate {
        entity: TRANSACTIONS_ENTITY.to_owned(),
        conditions,
    })
}

fn log_predicate(filter: &LogFilter) -> Option<QueryPredicate> {
    let mut conditions = Vec::new();
    if let Some(address) = populated(&filter.address) {
        conditions.push(QueryCondition::new("address", address.to_ascii_lowercase()));
    }
    for (idx, topic) in filter.topics.iter().take(MAX_TOPICS).enumerate() {
        if let Some(topic) = populated(topic) {
            conditions.push(QueryCondition::new(
                format!("topics{idx}"),
                event_to_topic(topic),
            ));
        }
    }

    if conditions.is_empty() {
        return None;
    }
    Some(QueryPredicate {
        entity: LOGS_ENTITY.to_owned(),
        conditions,
    })
}

fn populated(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Modulos declared by block handlers across the given datasources.
pub fn collect_modulos<'a, I>(datasources: I) -> Vec<u64>
where
    I: IntoIterator<Item = &'a Datasource>,
{
    let mut modulos: Vec<u64> = datasources
        .into_iter()
        .flat_map(|ds| ds.handlers.iter())
        .filter_map(|handler| handler.modulo())
        .collect();
    modulos.sort_unstable();
    modulos.dedup();
    modulos
}

/// Heights in `[start, end)` matched by at least one modulo.
pub fn modulo_heights(modulos: &[u64], start: u64, end: u64) -> Vec<u64> {
    if modulos.is_empty() || start >= end {
        return Vec::new();
    }
    (start..end)
        .filter(|height| modulos.iter().any(|m| height % m == 0))
        .collect()
}
