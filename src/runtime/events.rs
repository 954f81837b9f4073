//! In-process event bus. Components publish fire-and-forget notifications and
//! any number of observers (benchmark reporter, tests, embedding node) subscribe.

use tokio::sync::broadcast;

const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerEvent {
    /// Number of planned heights waiting to be fetched.
    BlockQueueSize(usize),
    BlockBest(u64),
    /// Finalized height the fetch loop is working towards.
    BlockTarget(u64),
    UsingDictionary(bool),
    /// The dictionary could not be used for the current planning cycle.
    SkipDictionary,
    /// A block was handed to the handler; `timestamp` is milliseconds since the Unix epoch.
    BlockProcessing { height: u64, timestamp: u64 },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IndexerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to current subscribers. Having none is not an error.
    pub fn publish(&self, event: IndexerEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event published without subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
