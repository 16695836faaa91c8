// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The worker pool dispatcher (C5): a fixed set of OS threads pulling jobs
//! from a bounded MPMC queue, decoding arguments per the registered reply
//! signature, and invoking handlers through a [`Runtime`]. Panics inside a
//! handler are contained and surfaced as a `Reply Fatal` error rather than
//! taking the worker thread down — mirrors the teacher's read-loop
//! philosophy of never letting one bad PDU kill the connection.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::codec::{Stream, Value};
use crate::error::{ErrorLevel, RpcError};
use crate::registry::{ReplyMeta, Registry};
use crate::runtime::{CallHost, Outcome, Return, Runtime, ThreadEpoch};

thread_local! {
    static CURRENT_THREAD_EPOCH: std::cell::RefCell<Option<Arc<ThreadEpoch>>> =
        const { std::cell::RefCell::new(None) };
    static CURRENT_DISPATCHER: std::cell::RefCell<Option<Arc<Dispatcher>>> =
        const { std::cell::RefCell::new(None) };
}

/// Arguments for a dispatched call: either already-decoded generic values
/// (the reflective path) or a raw stream handed to the reply's fast path.
pub enum JobArgs {
    Decoded(Vec<Value>),
    Raw(Stream),
}

pub struct Job {
    pub meta: Arc<ReplyMeta>,
    pub args: JobArgs,
    pub on_complete: Box<dyn FnOnce(Result<Value, RpcError>) + Send>,
}

/// Lightweight atomic counters tracking processed-stream rate, the way the
/// original's `speed_counter.go` tracked RPC throughput.
#[derive(Default)]
pub struct Throughput {
    total: AtomicU64,
    errors: AtomicU64,
}

impl Throughput {
    pub fn record_ok(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_err(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.total.load(Ordering::Relaxed), self.errors.load(Ordering::Relaxed))
    }
}

pub struct Dispatcher {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    registry: Arc<Registry>,
    max_call_depth: u16,
    throughput: Arc<Throughput>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl Dispatcher {
    pub fn start(
        num_threads: usize,
        queue_capacity: usize,
        registry: Arc<Registry>,
        max_call_depth: u16,
    ) -> Arc<Self> {
        let (tx, rx) = bounded(queue_capacity);
        let dispatcher = Arc::new(Self {
            tx,
            rx,
            registry,
            max_call_depth,
            throughput: Arc::new(Throughput::default()),
            workers: std::sync::Mutex::new(Vec::new()),
            shutdown: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        });
        #[allow(clippy::unwrap_used)]
        let mut workers = dispatcher.workers.lock().unwrap();
        for idx in 0..num_threads {
            let this = Arc::clone(&dispatcher);
            let handle = std::thread::Builder::new()
                .name(format!("duplex-worker-{idx}"))
                .spawn(move || this.worker_loop())
                .expect("spawning a worker thread should not fail");
            workers.push(handle);
        }
        drop(workers);
        dispatcher
    }

    pub fn throughput(&self) -> Arc<Throughput> {
        Arc::clone(&self.throughput)
    }

    /// Enqueues a job. Non-blocking: a full queue is reported as
    /// backpressure rather than stalling the caller (the session's read
    /// loop must stay responsive to pings/heartbeats).
    pub fn submit(&self, job: Job) -> Result<(), RpcError> {
        self.tx.try_send(job).map_err(|_| RpcError::backpressure())
    }

    /// Signals workers to stop accepting new work and waits up to `grace`
    /// for in-flight jobs to drain before the threads are joined.
    pub fn shutdown(self: &Arc<Self>, grace: Duration) {
        self.shutdown.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline && !self.rx.is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        let handles = {
            #[allow(clippy::unwrap_used)]
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn worker_loop(self: Arc<Self>) {
        let thread_epoch = Arc::new(ThreadEpoch::default());
        CURRENT_THREAD_EPOCH.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&thread_epoch)));
        CURRENT_DISPATCHER.with(|cell| *cell.borrow_mut() = Some(Arc::clone(&self)));
        loop {
            if self.shutdown.load(Ordering::Acquire) && self.rx.is_empty() {
                return;
            }
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(job) => self.run_job(job, &thread_epoch),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn run_job(self: &Arc<Self>, job: Job, thread_epoch: &Arc<ThreadEpoch>) {
        let Job { meta, args, on_complete } = job;
        let epoch = thread_epoch.push();
        let host: Arc<dyn CallHost> = Arc::clone(self);
        let max_call_depth = self.max_call_depth;
        let outcome_result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let runtime = Runtime::new(epoch, Arc::clone(thread_epoch), 0, max_call_depth, Some(host));
            invoke(&meta, args, &runtime);
            runtime.take_outcome()
        }));
        thread_epoch.pop();

        let outcome = match outcome_result {
            Ok(outcome) => outcome,
            Err(panic) => {
                let msg = panic_message(&panic);
                Outcome::Err(RpcError::reply_panic(msg))
            }
        };
        match &outcome {
            Outcome::Ok(_) => self.throughput.record_ok(),
            Outcome::Err(_) => self.throughput.record_err(),
        }
        let result = match outcome {
            Outcome::Ok(v) => Ok(v),
            Outcome::Err(e) => Err(e),
        };
        on_complete(result);
    }
}

impl CallHost for Dispatcher {
    fn invoke_nested(&self, path: &str, args: &[Value], depth: u16) -> Result<Value, RpcError> {
        let meta = self.registry.lookup(path).ok_or_else(|| RpcError::reply_not_found(path))?;
        let thread_epoch = CURRENT_THREAD_EPOCH
            .with(|cell| cell.borrow().clone())
            .expect("invoke_nested called outside a worker thread");
        let dispatcher_handle: Arc<dyn CallHost> = CURRENT_DISPATCHER
            .with(|cell| cell.borrow().clone())
            .expect("invoke_nested called outside a worker thread");
        let epoch = thread_epoch.push();
        let runtime = Runtime::new(
            epoch,
            Arc::clone(&thread_epoch),
            depth,
            self.max_call_depth,
            Some(dispatcher_handle),
        );
        invoke(&meta, JobArgs::Decoded(args.to_vec()), &runtime);
        let outcome = runtime.take_outcome();
        thread_epoch.pop();
        match outcome {
            Outcome::Ok(v) => Ok(v),
            Outcome::Err(e) => Err(e),
        }
    }
}

fn invoke(meta: &ReplyMeta, args: JobArgs, runtime: &Runtime) -> Option<Return> {
    match (args, &meta.fast_path) {
        (JobArgs::Raw(mut stream), Some(fast)) => Some(fast(runtime, &mut stream)),
        (JobArgs::Raw(mut stream), None) => {
            let mut decoded = Vec::with_capacity(meta.arg_count());
            for _ in 0..meta.arg_count() {
                match stream.read_value() {
                    Ok(v) => decoded.push(v),
                    Err(e) => return Some(runtime.error(e)),
                }
            }
            Some((meta.handler)(runtime, &decoded))
        }
        (JobArgs::Decoded(values), _) => Some((meta.handler)(runtime, &values)),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::registry::{RegistryBuilder, ServiceBuilder};

    fn build_registry() -> Arc<Registry> {
        let registry = RegistryBuilder::new()
            .mount(ServiceBuilder::new("svc").reply(
                "Echo",
                "I",
                Arc::new(|rt: &Runtime, args: &[Value]| rt.ok(args[0].clone())),
            ))
            .mount(ServiceBuilder::new("bad").reply(
                "Boom",
                "",
                Arc::new(|_rt: &Runtime, _args: &[Value]| panic!("intentional test panic")),
            ))
            .build()
            .expect("build registry");
        Arc::new(registry)
    }

    #[test]
    fn dispatches_and_decodes_args() {
        let registry = build_registry();
        let dispatcher = Dispatcher::start(2, 16, Arc::clone(&registry), 16);
        let meta = registry.lookup("#.svc:Echo").expect("meta");
        let (tx, rx) = mpsc::channel();
        dispatcher
            .submit(Job {
                meta,
                args: JobArgs::Decoded(vec![Value::Int64(5)]),
                on_complete: Box::new(move |res| {
                    let _ = tx.send(res);
                }),
            })
            .expect("submit");
        let result = rx.recv_timeout(Duration::from_secs(2)).expect("result");
        assert_eq!(result.expect("ok"), Value::Int64(5));
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn handler_panic_is_contained() {
        let registry = build_registry();
        let dispatcher = Dispatcher::start(1, 16, Arc::clone(&registry), 16);
        let meta = registry.lookup("#.bad:Boom").expect("meta");
        let (tx, rx) = mpsc::channel();
        dispatcher
            .submit(Job {
                meta,
                args: JobArgs::Decoded(vec![]),
                on_complete: Box::new(move |res| {
                    let _ = tx.send(res);
                }),
            })
            .expect("submit");
        let result = rx.recv_timeout(Duration::from_secs(2)).expect("result");
        let err = result.expect_err("should be an error");
        assert_eq!(err.kind(), crate::error::ErrorKind::Reply);
        dispatcher.shutdown(Duration::from_secs(1));
    }
}
