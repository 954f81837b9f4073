//! Chooses the next heights to enqueue, either a dense contiguous range or the
//! sparse set of heights reported by the dictionary.

use super::client::{Dictionary, DictionaryMetadata, DictionaryResult};
use super::filter::{collect_modulos, compile_predicates, modulo_heights, QueryPredicate};
use crate::project::Datasource;
use crate::runtime::events::{EventBus, IndexerEvent};
use crate::runtime::telemetry::Telemetry;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Width of the height window sent to the dictionary in one query.
pub const DICTIONARY_MAX_QUERY_SIZE: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Enqueue every height in `[start, end]`.
    Range { start: u64, end: u64 },
    /// Enqueue exactly these heights, sorted ascending.
    Heights(Vec<u64>),
    /// No height up to and including this one needs fetching.
    SkipTo(u64),
    /// The watermark moved while the dictionary was being queried.
    Stale,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanRequest<'a> {
    pub start: u64,
    pub batch_size: usize,
    pub free_size: usize,
    pub finalized_height: u64,
    pub chain_genesis: &'a str,
}

#[derive(Debug, Default)]
struct PlannerState {
    predicates: Arc<Vec<QueryPredicate>>,
    modulos: Arc<Vec<u64>>,
    genesis_mismatch: bool,
}

pub struct DictionaryPlanner {
    dictionary: Option<Arc<dyn Dictionary>>,
    events: EventBus,
    telemetry: Arc<Telemetry>,
    state: Mutex<PlannerState>,
}

impl DictionaryPlanner {
    pub fn new(
        dictionary: Option<Arc<dyn Dictionary>>,
        events: EventBus,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            dictionary,
            events,
            telemetry,
            state: Mutex::new(PlannerState::default()),
        }
    }

    /// Recompiles predicates and modulos for the current datasource set and returns whether the
    /// dictionary will be used. A latched genesis mismatch survives this call.
    pub fn update_datasources(&self, datasources: &[Datasource]) -> bool {
        let predicates = compile_predicates(datasources);
        let modulos = collect_modulos(datasources);
        let mut state = self.lock();
        tracing::debug!(
            predicates = predicates.len(),
            modulos = modulos.len(),
            "recompiled dictionary predicates"
        );
        state.predicates = Arc::new(predicates);
        state.modulos = Arc::new(modulos);
        self.enabled(&state)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled(&self.lock())
    }

    /// Clears a latched genesis mismatch so the dictionary is tried again.
    pub fn resync(&self) -> bool {
        let mut state = self.lock();
        state.genesis_mismatch = false;
        self.enabled(&state)
    }

    pub fn predicates(&self) -> Vec<QueryPredicate> {
        self.lock().predicates.as_ref().clone()
    }

    /// `[start, min(start + batch_size - 1, finalized_height)]`.
    pub fn dense_range(start: u64, batch_size: usize, finalized_height: u64) -> Plan {
        let span = (batch_size.max(1) as u64) - 1;
        Plan::Range {
            start,
            end: start.saturating_add(span).min(finalized_height),
        }
    }

    /// Plans the cycle starting at `request.start`.
    ///
    /// `current_start` is re-read after the dictionary round-trip; when it no longer equals the
    /// requested start the response is discarded and [`Plan::Stale`] is returned.
    pub async fn plan<F>(&self, request: PlanRequest<'_>, current_start: F) -> Plan
    where
        F: Fn() -> u64,
    {
        let dense = Self::dense_range(
            request.start,
            request.batch_size,
            request.finalized_height,
        );

        let (dictionary, predicates, modulos) = {
            let state = self.lock();
            match &self.dictionary {
                Some(dictionary) if self.enabled(&state) => (
                    dictionary.clone(),
                    state.predicates.clone(),
                    state.modulos.clone(),
                ),
                _ => return dense,
            }
        };

        let window_end = request.start.saturating_add(DICTIONARY_MAX_QUERY_SIZE);
        self.telemetry.record_dictionary_query();
        let response = dictionary
            .query(request.start, window_end, request.batch_size, &predicates)
            .await;

        if current_start() != request.start {
            tracing::debug!(
                start_height = request.start,
                "queue was reset while querying the dictionary; discarding result"
            );
            return Plan::Stale;
        }

        match response {
            Err(err) => {
                tracing::debug!(
                    start_height = request.start,
                    error = %err,
                    "dictionary query failed; falling back to dense range"
                );
                self.skip_dictionary();
                dense
            }
            Ok(None) => dense,
            Ok(Some(result)) => {
                if !self.validate(&result.metadata, request.start, request.chain_genesis) {
                    return dense;
                }
                Self::sparse_plan(result, &modulos, request.start, window_end, request.free_size)
            }
        }
    }

    fn sparse_plan(
        result: DictionaryResult,
        modulos: &[u64],
        start: u64,
        window_end: u64,
        free_size: usize,
    ) -> Plan {
        let last_indexed = result.metadata.last_indexed_height;
        let modulo_end = window_end.min(last_indexed.saturating_add(1));

        let mut merged: BTreeSet<u64> = result
            .candidate_heights
            .into_iter()
            .filter(|height| (start..window_end).contains(height))
            .collect();
        merged.extend(modulo_heights(modulos, start, modulo_end));

        if merged.is_empty() {
            return Plan::SkipTo(window_end.saturating_sub(1).min(last_indexed));
        }

        Plan::Heights(merged.into_iter().take(free_size).collect())
    }

    fn validate(&self, metadata: &DictionaryMetadata, start: u64, chain_genesis: &str) -> bool {
        if !metadata.genesis_hash.eq_ignore_ascii_case(chain_genesis) {
            self.lock().genesis_mismatch = true;
            tracing::warn!(
                dictionary_genesis = %metadata.genesis_hash,
                chain_genesis,
                "dictionary genesis hash does not match the chain; dictionary disabled until resync"
            );
            self.events.publish(IndexerEvent::UsingDictionary(false));
            self.skip_dictionary();
            return false;
        }

        if metadata.last_indexed_height < start {
            tracing::warn!(
                last_indexed_height = metadata.last_indexed_height,
                start_height = start,
                "dictionary is behind the current indexing height"
            );
            self.skip_dictionary();
            return false;
        }

        true
    }

    fn skip_dictionary(&self) {
        self.telemetry.record_dictionary_skip();
        self.events.publish(IndexerEvent::SkipDictionary);
    }

    fn enabled(&self, state: &PlannerState) -> bool {
        self.dictionary.is_some() && !state.predicates.is_empty() && !state.genesis_mismatch
    }

    fn lock(&self) -> MutexGuard<'_, PlannerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
