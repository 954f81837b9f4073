//! Dictionary (acceleration index) client: the capability trait consumed by the
//! planner and a GraphQL implementation for SubQuery-style dictionaries.

use super::filter::QueryPredicate;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryMetadata {
    pub genesis_hash: String,
    pub last_indexed_height: u64,
}

/// Heights the dictionary reports as matching, sorted ascending and unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryResult {
    pub candidate_heights: Vec<u64>,
    pub metadata: DictionaryMetadata,
}

pub trait Dictionary: Send + Sync {
    /// Queries matching heights in `[start_height, end_height)`.
    ///
    /// `Ok(None)` means the dictionary answered without a usable result; errors are transport
    /// or decoding failures. Both are transient from the caller's point of view.
    fn query<'a>(
        &'a self,
        start_height: u64,
        end_height: u64,
        batch_size: usize,
        predicates: &'a [QueryPredicate],
    ) -> BoxFuture<'a, Result<Option<DictionaryResult>>>;
}

#[derive(Debug, Clone)]
pub struct GraphqlDictionary {
    endpoint: String,
    client: reqwest::Client,
}

impl GraphqlDictionary {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build dictionary HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn execute(
        &self,
        start_height: u64,
        end_height: u64,
        batch_size: usize,
        predicates: &[QueryPredicate],
    ) -> Result<Option<DictionaryResult>> {
        if predicates.is_empty() {
            return Ok(None);
        }

        let query = build_query(start_height, end_height, batch_size, predicates);
        let body: Value = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query }))
            .send()
            .await
            .context("dictionary request failed")?
            .error_for_status()
            .context("dictionary returned an error status")?
            .json()
            .await
            .context("failed to decode dictionary response")?;

        let entities = group_by_entity(predicates);
        let entity_names: Vec<&str> = entities.keys().copied().collect();
        parse_response(body, &entity_names, batch_size)
    }
}

impl Dictionary for GraphqlDictionary {
    fn query<'a>(
        &'a self,
        start_height: u64,
        end_height: u64,
        batch_size: usize,
        predicates: &'a [QueryPredicate],
    ) -> BoxFuture<'a, Result<Option<DictionaryResult>>> {
        Box::pin(self.execute(start_height, end_height, batch_size, predicates))
    }
}

fn group_by_entity(predicates: &[QueryPredicate]) -> BTreeMap<&str, Vec<&QueryPredicate>> {
    let mut grouped: BTreeMap<&str, Vec<&QueryPredicate>> = BTreeMap::new();
    for predicate in predicates {
        grouped
            .entry(predicate.entity.as_str())
            .or_default()
            .push(predicate);
    }
    grouped
}

/// Builds one GraphQL document selecting the metadata and the first `batch_size` distinct
/// heights per entity that satisfy any of its predicates.
pub fn build_query(
    start_height: u64,
    end_height: u64,
    batch_size: usize,
    predicates: &[QueryPredicate],
) -> String {
    let mut selections = vec!["_metadata { lastProcessedHeight genesisHash }".to_owned()];

    for (entity, entity_predicates) in group_by_entity(predicates) {
        let alternatives: Vec<String> = entity_predicates
            .iter()
            .map(|predicate| {
                let conditions: Vec<String> = predicate
                    .conditions
                    .iter()
                    .map(|condition| {
                        format!(
                            "{{{}: {{equalTo: {}}}}}",
                            condition.field,
                            graphql_string(&condition.value)
                        )
                    })
                    .collect();
                format!("{{and: [{}]}}", conditions.join(", "))
            })
            .collect();

        selections.push(format!(
            "{entity}(filter: {{blockHeight: {{greaterThanOrEqualTo: \"{start_height}\", lessThan: \"{end_height}\"}}, or: [{}]}}, distinct: [BLOCK_HEIGHT], orderBy: BLOCK_HEIGHT_ASC, first: {batch_size}) {{ nodes {{ blockHeight }} }}",
            alternatives.join(", ")
        ));
    }

    format!("query {{ {} }}", selections.join(" "))
}

fn graphql_string(value: &str) -> String {
    Value::String(value.to_owned()).to_string()
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Option<Map<String, Value>>,
    #[serde(default)]
    errors: Vec<Value>,
}

/// Decodes a dictionary response into sorted, unique candidate heights.
///
/// When an entity returned a full page (`batch_size` rows), heights beyond its last row are
/// unknown for that entity, so the merged set is cut at the smallest such last height.
pub fn parse_response(
    body: Value,
    entities: &[&str],
    batch_size: usize,
) -> Result<Option<DictionaryResult>> {
    let response: GraphqlResponse =
        serde_json::from_value(body).context("unexpected dictionary response shape")?;

    if !response.errors.is_empty() {
        let errors = Value::Array(response.errors);
        tracing::warn!(
            errors = %errors,
            "dictionary query returned errors"
        );
        return Ok(None);
    }

    let Some(data) = response.data else {
        return Ok(None);
    };
    let Some(metadata) = data.get("_metadata").and_then(parse_metadata) else {
        return Ok(None);
    };

    let mut heights = BTreeSet::new();
    let mut cutoff: Option<u64> = None;
    for entity in entities {
        let nodes = data
            .get(*entity)
            .and_then(|selection| selection.get("nodes"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let entity_heights: Vec<u64> = nodes
            .iter()
            .filter_map(|node| node.get("blockHeight").and_then(as_height))
            .collect();

        if batch_size > 0 && entity_heights.len() >= batch_size {
            if let Some(last) = entity_heights.iter().max().copied() {
                cutoff = Some(cutoff.map_or(last, |current| current.min(last)));
            }
        }
        heights.extend(entity_heights);
    }

    let candidate_heights = heights
        .into_iter()
        .filter(|height| cutoff.map_or(true, |limit| *height <= limit))
        .collect();

    Ok(Some(DictionaryResult {
        candidate_heights,
        metadata,
    }))
}

fn parse_metadata(value: &Value) -> Option<DictionaryMetadata> {
    let last_indexed_height = value.get("lastProcessedHeight").and_then(as_height)?;
    let genesis_hash = value.get("genesisHash")?.as_str()?.to_owned();
    Some(DictionaryMetadata {
        genesis_hash,
        last_indexed_height,
    })
}

fn as_height(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
