// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-invocation `Runtime`/`Context` (C6): the handle a reply handler
//! uses to finish a call (`ok`/`error`) and to recurse into another reply
//! (`call`). Grounded on `internal/core/runtime.go`'s `Runtime{id, thread}`
//! + `lock`/`unlock` epoch pattern — a `Runtime` captured outside its
//! invocation (stashed in a spawned task, for example) must fail loudly
//! rather than silently touch a worker thread that has moved on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::codec::Value;
use crate::error::RpcError;

/// The sentinel a reply handler must produce by calling `rt.ok(..)` or
/// `rt.error(..)`. Its only purpose is to make "forgot to finish the call"
/// a compile error: handler signatures return `Return`, and the only way to
/// construct one is through `Runtime`.
#[derive(Debug)]
pub struct Return(());

/// Implemented by the worker pool (C5) so `Runtime::call` can recurse into
/// another reply on the *same* worker thread without the codec/runtime
/// modules depending on the dispatcher module directly.
pub trait CallHost: Send + Sync {
    fn invoke_nested(&self, path: &str, args: &[Value], depth: u16) -> Result<Value, RpcError>;
}

/// Tracks whether the worker thread that owns a `Runtime` is still inside
/// the call that created it. Bumped once per dispatched stream.
#[derive(Default)]
pub(crate) struct ThreadEpoch {
    current: AtomicU64,
}

impl ThreadEpoch {
    /// Enters a new call frame, returning the epoch value that identifies
    /// it. Must be paired with [`ThreadEpoch::pop`] once the frame
    /// finishes, restoring the enclosing frame's `Runtime` to validity.
    pub(crate) fn push(&self) -> u64 {
        self.current.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn pop(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current.load(Ordering::Acquire) == epoch
    }
}

pub(crate) enum Outcome {
    Ok(Value),
    Err(RpcError),
}

pub struct Runtime {
    epoch: u64,
    thread: Arc<ThreadEpoch>,
    depth: u16,
    max_call_depth: u16,
    host: Option<Arc<dyn CallHost>>,
    outcome: Mutex<Option<Outcome>>,
}

impl Runtime {
    pub(crate) fn new(
        epoch: u64,
        thread: Arc<ThreadEpoch>,
        depth: u16,
        max_call_depth: u16,
        host: Option<Arc<dyn CallHost>>,
    ) -> Self {
        Self { epoch, thread, depth, max_call_depth, host, outcome: Mutex::new(None) }
    }

    fn check_thread(&self) {
        assert!(
            self.thread.is_current(self.epoch),
            "Runtime used outside its invocation (illegal in current goroutine/thread)"
        );
    }

    /// Finishes the call successfully.
    pub fn ok(&self, value: impl Into<Value>) -> Return {
        self.check_thread();
        #[allow(clippy::unwrap_used)]
        let mut slot = self.outcome.lock().unwrap();
        *slot = Some(Outcome::Ok(value.into()));
        Return(())
    }

    /// Finishes the call with an error.
    pub fn error(&self, err: RpcError) -> Return {
        self.check_thread();
        #[allow(clippy::unwrap_used)]
        let mut slot = self.outcome.lock().unwrap();
        *slot = Some(Outcome::Err(err));
        Return(())
    }

    /// Recursively invokes another registered reply on the current worker
    /// thread. Reentrant: the nested call shares the thread but gets its
    /// own `Runtime` at `depth + 1`.
    pub fn call(&self, path: &str, args: &[Value]) -> Result<Value, RpcError> {
        self.check_thread();
        if self.depth + 1 > self.max_call_depth {
            return Err(RpcError::call_depth_exceeded());
        }
        match &self.host {
            Some(host) => host.invoke_nested(path, args, self.depth + 1),
            None => Err(RpcError::runtime(
                3,
                crate::error::ErrorLevel::Error,
                "call() unavailable: runtime has no dispatch host",
            )),
        }
    }

    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub(crate) fn take_outcome(self) -> Outcome {
        #[allow(clippy::unwrap_used)]
        self.outcome.lock().unwrap().take().unwrap_or_else(|| {
            Outcome::Err(RpcError::reply_panic("handler returned without calling ok()/error()"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_then_take_outcome_roundtrips() {
        let thread = Arc::new(ThreadEpoch::default());
        let epoch = thread.push();
        let rt = Runtime::new(epoch, thread, 0, 16, None);
        let _ = rt.ok(7i64);
        match rt.take_outcome() {
            Outcome::Ok(Value::Int64(7)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    impl std::fmt::Debug for Outcome {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Outcome::Ok(v) => write!(f, "Ok({v:?})"),
                Outcome::Err(e) => write!(f, "Err({e})"),
            }
        }
    }

    #[test]
    #[should_panic(expected = "illegal in current goroutine")]
    fn used_after_epoch_advance_panics() {
        let thread = Arc::new(ThreadEpoch::default());
        let epoch = thread.push();
        let rt = Runtime::new(epoch, Arc::clone(&thread), 0, 16, None);
        thread.push();
        let _ = rt.ok(1i64);
    }

    #[test]
    fn call_without_host_errors() {
        let thread = Arc::new(ThreadEpoch::default());
        let epoch = thread.push();
        let rt = Runtime::new(epoch, thread, 0, 16, None);
        assert!(rt.call("#.x:Y", &[]).is_err());
    }

    #[test]
    fn call_depth_exceeded() {
        let thread = Arc::new(ThreadEpoch::default());
        let epoch = thread.push();
        let rt = Runtime::new(epoch, thread, 16, 16, None);
        let err = rt.call("#.x:Y", &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Runtime);
    }
}
