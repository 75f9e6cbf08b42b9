// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TracePhase {
    Main,
    Success,
    Rollback,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub key: String,

    pub phase: TracePhase,

    /// 1-based count of invocations of this phase for this key
    pub invocation: usize,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct TraceLog {
    pub events: Vec<TraceEvent>,
}

impl TraceLog {
    pub fn count(&self, key: &str, phase: TracePhase) -> usize {
        self.events
            .iter()
            .filter(|e| e.key == key && e.phase == phase)
            .count()
    }
}

/// Records worker invocations from any thread.
#[derive(Debug, Default, Clone)]
pub struct Probe {
    log: Arc<Mutex<TraceLog>>,
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str, phase: TracePhase) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let invocation = log.count(key, phase) + 1;
        log.events.push(TraceEvent {
            key: key.to_string(),
            phase,
            invocation,
        });
    }

    pub fn count(&self, key: &str, phase: TracePhase) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count(key, phase)
    }

    pub fn snapshot(&self) -> TraceLog {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
