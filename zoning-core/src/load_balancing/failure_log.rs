//! Rate limiting for migration failure reports

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::types::EntityId;
use crate::world::MigrationBlocker;

/// Remembers which `(entity, blocker)` pairs were reported in the current window
#[derive(Debug)]
pub struct MigrationFailureLog {
    logged: HashSet<(EntityId, MigrationBlocker)>,
    window: Duration,
    window_started: Option<Instant>,
}

impl MigrationFailureLog {
    /// Create a log whose store is cleared every `window`
    pub fn new(window: Duration) -> Self {
        Self {
            logged: HashSet::new(),
            window,
            window_started: None,
        }
    }

    /// Returns true the first time a pair is seen in the current window
    pub fn should_log(&mut self, entity_id: EntityId, blocker: MigrationBlocker, now: Instant) -> bool {
        match self.window_started {
            Some(started) if now.saturating_duration_since(started) < self.window => {}
            _ => {
                self.logged.clear();
                self.window_started = Some(now);
            }
        }
        self.logged.insert((entity_id, blocker))
    }

    /// Pairs recorded in the current window
    pub fn len(&self) -> usize {
        self.logged.len()
    }

    /// True if nothing was recorded in the current window
    pub fn is_empty(&self) -> bool {
        self.logged.is_empty()
    }
}
