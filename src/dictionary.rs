//! Dictionary acceleration: predicate compilation, signature hashing, the
//! dictionary client, and the planner that decides which heights to fetch.

pub mod client;
pub mod filter;
pub mod hashing;
pub mod planner;

pub use client::{Dictionary, DictionaryMetadata, DictionaryResult, GraphqlDictionary};
pub use filter::{compile_predicates, QueryCondition, QueryPredicate};
pub use planner::{DictionaryPlanner, Plan, PlanRequest, DICTIONARY_MAX_QUERY_SIZE};
