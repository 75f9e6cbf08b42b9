// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};

use crate::job_engine::worker_pool::WorkerPool;

/// Payload of a successful operation. The engine never looks inside it.
pub type OpOutput = serde_json::Value;

/// Caller-defined asynchronous work, e.g. a remote call.
pub type AsyncOp = BoxFuture<'static, anyhow::Result<OpOutput>>;

/// Settled outcome of an operation as seen by the engine.
pub type OpResult = Result<OpOutput, OpFailure>;

/// Wraps any future into an [`AsyncOp`].
pub fn op<F>(fut: F) -> AsyncOp
where
    F: Future<Output = anyhow::Result<OpOutput>> + Send + 'static,
{
    fut.boxed()
}

/// An operation that has already succeeded with `value`.
pub fn ready_op(value: OpOutput) -> AsyncOp {
    future::ready(Ok(value)).boxed()
}

/// An operation that has already failed with `err`.
pub fn failed_op(err: anyhow::Error) -> AsyncOp {
    future::ready(Err(err)).boxed()
}

/// Failure of a single operation. Clones share the underlying error.
#[derive(Clone)]
pub struct OpFailure(Arc<anyhow::Error>);

impl OpFailure {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }
}

impl fmt::Debug for OpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OpFailure").field(&*self.0).finish()
    }
}

impl fmt::Display for OpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for OpFailure {}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Turns an op into a future that cannot unwind and reports errors as [`OpFailure`].
pub(crate) fn guard(op: AsyncOp) -> impl Future<Output = OpResult> + Send + 'static {
    AssertUnwindSafe(op).catch_unwind().map(|caught| match caught {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(OpFailure::new(err)),
        Err(payload) => Err(OpFailure::new(anyhow!(
            "operation panicked: {}",
            panic_message(&*payload)
        ))),
    })
}

/// Handle to an operation launched on behalf of a job attempt.
///
/// The operation itself runs on the worker pool; this handle only observes it.
/// Handles are cheap to clone and every clone resolves to the same outcome, so a
/// rollback worker can inspect the failed attempt or await its stragglers.
#[derive(Clone)]
pub struct PendingOp {
    index: usize,
    outcome: Shared<BoxFuture<'static, OpResult>>,
}

impl PendingOp {
    fn from_receiver(index: usize, rx: oneshot::Receiver<OpResult>) -> Self {
        let settled = rx.map(|received| {
            received.unwrap_or_else(|_| {
                Err(OpFailure::new(anyhow!(
                    "operation abandoned before it completed"
                )))
            })
        });
        Self {
            index,
            outcome: settled.boxed().shared(),
        }
    }

    /// Position of the operation in the list the worker returned.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Outcome of the operation if it has settled, without blocking.
    pub fn outcome(&self) -> Option<OpResult> {
        match self.outcome.peek() {
            Some(settled) => Some(settled.clone()),
            None => self.outcome.clone().now_or_never(),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.outcome(), Some(Err(_)))
    }
}

impl Future for PendingOp {
    type Output = OpResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome.poll_unpin(cx)
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOp")
            .field("index", &self.index)
            .field("outcome", &self.outcome.peek())
            .finish()
    }
}

/// Spawns every op on the pool as its own task. The tasks are detached: they run
/// to completion even when every handle to them is dropped.
/// Returns `None` if the pool has been shut down.
pub(crate) fn launch(pool: &WorkerPool, ops: Vec<AsyncOp>) -> Option<Vec<PendingOp>> {
    ops.into_iter()
        .enumerate()
        .map(|(index, op)| {
            let (tx, rx) = oneshot::channel();
            let task = guard(op).map(move |outcome| {
                let _ = tx.send(outcome);
            });
            pool.spawn(task)
                .then(|| PendingOp::from_receiver(index, rx))
        })
        .collect()
}

/// All-succeed combinator: resolves to every output in order, or to the first
/// failure as soon as any operation fails.
pub(crate) async fn all_succeed(pending: Vec<PendingOp>) -> Result<Vec<OpOutput>, OpFailure> {
    future::try_join_all(pending).await
}
