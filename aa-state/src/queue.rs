//! FIFO queue of unconfirmed triggers.

use std::collections::VecDeque;
use tracing::debug;

use crate::types::PendingTrigger;

/// Triggers in broadcast order, unique by unit.
#[derive(Debug, Clone, Default)]
pub struct PendingQueue {
    triggers: VecDeque<PendingTrigger>,
}

impl PendingQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a trigger with this unit is queued.
    pub fn contains(&self, unit_id: &str) -> bool {
        self.triggers.iter().any(|t| t.unit_id == unit_id)
    }

    /// Append a trigger. Returns `false` if its unit is already queued.
    pub fn push(&mut self, trigger: PendingTrigger) -> bool {
        if self.contains(&trigger.unit_id) {
            return false;
        }
        self.triggers.push_back(trigger);
        true
    }

    /// Drop every trigger up to and including `initial_unit`.
    ///
    /// Nothing is removed when the unit is not queued. Returns the removed
    /// triggers in queue order.
    pub fn trim_through(&mut self, initial_unit: &str) -> Vec<PendingTrigger> {
        let Some(index) = self.triggers.iter().position(|t| t.unit_id == initial_unit) else {
            debug!(initial_unit = %initial_unit, "Initial unit not queued, nothing to trim");
            return Vec::new();
        };
        debug!(initial_unit = %initial_unit, count = index + 1, "Removing executed pending triggers");
        self.triggers.drain(..=index).collect()
    }

    /// Triggers in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingTrigger> {
        self.triggers.iter()
    }

    /// Units of the queued triggers in order.
    pub fn unit_ids(&self) -> Vec<String> {
        self.triggers.iter().map(|t| t.unit_id.clone()).collect()
    }

    /// Number of queued triggers.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}
