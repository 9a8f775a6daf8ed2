//! Single-slot stdout consumer.
//!
//! Every stdout line of the managed process goes to exactly one consumer.
//! By default that is the log forwarder; a caller can temporarily swap in its
//! own consumer (e.g. to scrape a command reply) and hand the slot back later.

use std::sync::{Arc, Mutex, MutexGuard};

/// What a consumer wants after seeing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Stay attached.
    Continue,
    /// Done; put the default consumer back.
    Release,
}

pub type StdoutConsumer = Arc<dyn Fn(&str) -> Flow + Send + Sync>;

/// Identifies an attached consumer. `0` is always the default consumer.
pub type ConsumerId = u64;

const DEFAULT_ID: ConsumerId = 0;

struct Slot {
    id: ConsumerId,
    next_id: ConsumerId,
    consumer: StdoutConsumer,
}

pub struct StdoutRouter {
    default: StdoutConsumer,
    slot: Mutex<Slot>,
}

impl StdoutRouter {
    pub fn new(default: StdoutConsumer) -> Self {
        Self {
            slot: Mutex::new(Slot {
                id: DEFAULT_ID,
                next_id: DEFAULT_ID + 1,
                consumer: default.clone(),
            }),
            default,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // 슬롯 상태는 단순 값 교체뿐이라 poison 이후에도 그대로 사용해도 안전하다
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces whatever consumer is attached. Never stacks.
    pub fn set_consumer(&self, consumer: StdoutConsumer) -> ConsumerId {
        let mut slot = self.lock();
        let id = slot.next_id;
        slot.next_id += 1;
        slot.id = id;
        slot.consumer = consumer;
        tracing::debug!("Stdout consumer {} attached", id);
        id
    }

    pub fn reset_to_default(&self) {
        let mut slot = self.lock();
        slot.id = DEFAULT_ID;
        slot.consumer = self.default.clone();
    }

    /// Resets to the default consumer only if `id` is still the attached one.
    /// Returns whether the reset happened.
    pub fn release(&self, id: ConsumerId) -> bool {
        let mut slot = self.lock();
        if slot.id != id || id == DEFAULT_ID {
            return false;
        }
        slot.id = DEFAULT_ID;
        slot.consumer = self.default.clone();
        tracing::debug!("Stdout consumer {} released", id);
        true
    }

    pub fn is_default(&self) -> bool {
        self.lock().id == DEFAULT_ID
    }

    pub fn active_id(&self) -> ConsumerId {
        self.lock().id
    }

    pub fn default_consumer(&self) -> StdoutConsumer {
        self.default.clone()
    }

    /// Delivers one chunk to the attached consumer. The lock is not held
    /// while the consumer runs, so a consumer may swap the slot itself.
    pub fn dispatch(&self, chunk: &str) {
        let (id, consumer) = {
            let slot = self.lock();
            (slot.id, slot.consumer.clone())
        };
        if consumer(chunk) == Flow::Release {
            self.release(id);
        }
    }
}
