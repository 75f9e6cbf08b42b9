// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::time::Duration;

use anyhow::anyhow;
use async_channel::{Receiver, Sender};
use async_io::Timer;
use jobcoord::{failed_op, op, AsyncOp};
use serde_json::json;

/// Operation that succeeds with `label` after `delay`.
pub fn succeed_after(delay: Duration, label: &str) -> AsyncOp {
    let label = label.to_string();
    op(async move {
        Timer::after(delay).await;
        Ok(json!(label))
    })
}

pub fn fail_with(msg: &str) -> AsyncOp {
    failed_op(anyhow!("{msg}"))
}

/// Holds operations back until the test opens it.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    /// Operation that succeeds once the gate opens.
    pub fn op(&self) -> AsyncOp {
        let rx = self.rx.clone();
        op(async move {
            // a closed channel means the gate is open for good
            let _ = rx.recv().await;
            Ok(json!("gate opened"))
        })
    }

    pub fn open(&self) {
        self.tx.close();
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}
