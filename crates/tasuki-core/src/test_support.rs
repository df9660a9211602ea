//! Shared test fixtures: slot-backed managers that record every lifecycle
//! event, so tests can assert on activation and close order.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::manager::{ActiveContext, ContextManager};
use crate::slot::{ContextSlot, SlotGuard, SlotStack};

/// Append-only, thread-safe event log shared by recording managers.
#[derive(Clone, Default)]
pub(crate) struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }
}

thread_local! {
    static ALPHA_STACK: RefCell<SlotStack<String>> = RefCell::new(SlotStack::new());
    static BETA_STACK: RefCell<SlotStack<String>> = RefCell::new(SlotStack::new());
}

/// A slot for one string value per thread. Distinct from [`beta_slot`] so a
/// test can register two independent managers.
pub(crate) fn alpha_slot() -> ContextSlot<String> {
    ContextSlot::new(&ALPHA_STACK)
}

pub(crate) fn beta_slot() -> ContextSlot<String> {
    ContextSlot::new(&BETA_STACK)
}

/// Manager over a [`ContextSlot`] that logs `activate:<name>:<value>`,
/// `close:<name>`, and `clear:<name>` events.
pub(crate) struct RecordingManager {
    name: &'static str,
    slot: ContextSlot<String>,
    log: EventLog,
}

impl RecordingManager {
    pub fn new(name: &'static str, slot: ContextSlot<String>, log: EventLog) -> Self {
        Self { name, slot, log }
    }
}

impl ContextManager for RecordingManager {
    type Value = String;

    fn name(&self) -> &'static str {
        self.name
    }

    fn active_value(&self) -> Option<String> {
        self.slot.current()
    }

    fn activate(&self, value: String) -> Box<dyn ActiveContext> {
        self.log.push(format!("activate:{}:{}", self.name, value));
        Box::new(RecordingGuard {
            name: self.name,
            inner: self.slot.activate(value),
            log: self.log.clone(),
            closed: false,
        })
    }

    fn clear_active(&self) {
        self.log.push(format!("clear:{}", self.name));
        self.slot.clear();
    }
}

struct RecordingGuard {
    name: &'static str,
    inner: SlotGuard<String>,
    log: EventLog,
    closed: bool,
}

impl ActiveContext for RecordingGuard {
    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.log.push(format!("close:{}", self.name));
        self.inner.close();
    }
}
