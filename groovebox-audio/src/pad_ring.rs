use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use groovebox_types::{EngineError, PadEvent};

pub const PAD_RING_CAPACITY: usize = 256;

/// Lock-free ring carrying pad gestures from the network side to the tick.
///
/// One producer (the server context) and one consumer (the engine). A full
/// ring rejects new events instead of blocking the producer.
#[derive(Debug, Clone)]
pub struct PadEventRing {
    queue: Arc<ArrayQueue<PadEvent>>,
}

impl Default for PadEventRing {
    fn default() -> Self {
        Self::new(PAD_RING_CAPACITY)
    }
}

impl PadEventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn push(&self, event: PadEvent) -> Result<(), EngineError> {
        self.queue.push(event).map_err(|_| EngineError::QueueFull)
    }

    pub fn pop(&self) -> Option<PadEvent> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
