//! Datasource and handler model consumed by the filter compiler and the
//! dispatcher. Manifests are parsed elsewhere; these types only describe what a
//! handler wants to see so the fetch pipeline can decide which heights matter.

use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};

/// Matches every Nth block regardless of content.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modulo: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Function signature (`transfer(address,uint256)`) or a raw `0x` selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Positional topics; `None` leaves a position unconstrained.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerKind {
    Block {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<BlockFilter>,
    },
    Call {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<CallFilter>,
    },
    Event {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<LogFilter>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handler {
    /// Name of the mapping function, used to attribute processing failures.
    pub handler: String,
    #[serde(flatten)]
    pub kind: HandlerKind,
}

impl Handler {
    pub fn block(handler: impl Into<String>, filter: Option<BlockFilter>) -> Self {
        Self {
            handler: handler.into(),
            kind: HandlerKind::Block { filter },
        }
    }

    pub fn call(handler: impl Into<String>, filter: Option<CallFilter>) -> Self {
        Self {
            handler: handler.into(),
            kind: HandlerKind::Call { filter },
        }
    }

    pub fn event(handler: impl Into<String>, filter: Option<LogFilter>) -> Self {
        Self {
            handler: handler.into(),
            kind: HandlerKind::Event { filter },
        }
    }

    /// Modulo of a block handler, if it declares one.
    pub fn modulo(&self) -> Option<u64> {
        match &self.kind {
            HandlerKind::Block {
                filter: Some(BlockFilter { modulo }),
            } => (*modulo).filter(|m| *m > 0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datasource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// No handler of this datasource wants blocks below this height.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_block: Option<u64>,
    pub handlers: Vec<Handler>,
}

impl Datasource {
    pub fn new(handlers: Vec<Handler>) -> Self {
        Self {
            name: None,
            start_block: None,
            handlers,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn starting_at(mut self, start_block: u64) -> Self {
        self.start_block = Some(start_block);
        self
    }
}

/// Static datasources from the project plus those registered while indexing.
#[derive(Debug, Default)]
pub struct DatasourceRegistry {
    static_sources: Vec<Datasource>,
    dynamic_sources: RwLock<Vec<Datasource>>,
}

impl DatasourceRegistry {
    pub fn new(static_sources: Vec<Datasource>) -> Self {
        Self {
            static_sources,
            dynamic_sources: RwLock::new(Vec::new()),
        }
    }

    pub fn static_sources(&self) -> &[Datasource] {
        &self.static_sources
    }

    /// Lowest `start_block` among the static datasources. `None` when there are none or one
    /// of them wants every height.
    pub fn earliest_start_block(&self) -> Option<u64> {
        self.static_sources
            .iter()
            .map(|ds| ds.start_block)
            .min()
            .flatten()
    }

    pub fn register_dynamic(&self, sources: impl IntoIterator<Item = Datasource>) -> usize {
        let mut dynamic = self
            .dynamic_sources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = dynamic.len();
        dynamic.extend(sources);
        dynamic.len() - before
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamic_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of every datasource, static ones first.
    pub fn all(&self) -> Vec<Datasource> {
        let dynamic = self
            .dynamic_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        self.static_sources
            .iter()
            .chain(dynamic.iter())
            .cloned()
            .collect()
    }
}
