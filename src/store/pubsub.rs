use std::sync::Arc;

use parking_lot::RwLock;

use super::{Chunk, ChunkConsumer};

/// Fans out chunks to subscribed consumers, e.g. the swarm's buffer and the seed scheduler
#[derive(Default)]
pub struct PubSub {
    subscribers: RwLock<Vec<Arc<dyn ChunkConsumer>>>,
}

impl PubSub {
    pub fn new() -> PubSub {
        PubSub::default()
    }

    pub fn subscribe(&self, consumer: Arc<dyn ChunkConsumer>) {
        self.subscribers.write().push(consumer);
    }

    pub fn unsubscribe(&self, consumer: &Arc<dyn ChunkConsumer>) {
        self.subscribers.write()
            .retain(|s| !Arc::ptr_eq(s, consumer));
    }

    pub fn publish(&self, chunk: &Chunk) {
        for s in self.subscribers.read().iter() {
            s.consume(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }
}
