// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session and channel-record state (C7): a per-connection session that
//! survives reconnects via a `"<session_id>-<32-char-secret>"` resumption
//! token, a `callback_id`-keyed map of channel records (`call_map`), and
//! heartbeat-driven expiry. Grounded on `examples/original_source/server_core.go`'s
//! `serverSession{dataSequence, ctrlSequence, callMap}` and its
//! `OnControlStream` sweep/alloc protocol, re-expressed with `DashMap` +
//! atomics instead of a Go mutex-guarded map.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;

use crate::codec::Stream;
use crate::error::{ErrorLevel, RpcError};

const SECRET_LEN: usize = 32;
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

pub fn generate_secret() -> String {
    let mut rng = rand::rng();
    (0..SECRET_LEN).map(|_| SECRET_ALPHABET[rng.random_range(0..SECRET_ALPHABET.len())] as char).collect()
}

fn now_millis() -> i64 {
    #[allow(clippy::unwrap_used)]
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// One entry of the session's `call_map`: identified by the exact
/// `callback_id` it serves (never a modulo slot), with a running flag CAS'd
/// on dispatch and a cached response set at most once per record, the way
/// `serverSessionRecord.SetRunning`/`SetReturn` use compare-and-swap in the
/// original.
pub struct ChannelRecord {
    callback_id: u64,
    running: AtomicBool,
    mark: AtomicBool,
    cached: std::sync::Mutex<Option<Stream>>,
}

impl ChannelRecord {
    fn new(callback_id: u64) -> Self {
        Self {
            callback_id,
            running: AtomicBool::new(false),
            mark: AtomicBool::new(false),
            cached: std::sync::Mutex::new(None),
        }
    }

    pub fn callback_id(&self) -> u64 {
        self.callback_id
    }

    /// Idle-to-running CAS. `true` only the first time this is called for a
    /// fresh record.
    pub fn set_running(&self) -> bool {
        self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Sets the cached response if none is set yet. Returns `true` if this
    /// call won the race and actually stored `stream`.
    pub fn set_return(&self, stream: Stream) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut slot = self.cached.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(stream);
        true
    }

    pub fn cached_response(&self) -> Option<Stream> {
        #[allow(clippy::unwrap_used)]
        self.cached.lock().unwrap().clone()
    }
}

/// A resumable logical session: a `callback_id`-keyed map of channel
/// records plus a heartbeat-tracked liveness window. `ctrl_sequence` and
/// `data_sequence` mirror the original's per-session counters: the former
/// rejects stale/replayed control streams, the latter is both "highest
/// callback id ever allocated" and the source of fresh ids during sweep.
pub struct Session {
    id: u64,
    secret: String,
    concurrency: usize,
    call_map: DashMap<u64, Arc<ChannelRecord>>,
    ctrl_sequence: AtomicU64,
    data_sequence: AtomicU64,
    alloc_lock: std::sync::Mutex<()>,
    last_heartbeat_millis: AtomicI64,
    created_at_millis: i64,
    // The writer half of whichever connection most recently completed the
    // handshake for this session. A handler that outlives a client
    // reconnect (spec §4.9) must deliver its eventual response over the
    // *current* connection, not the one that was live when the call was
    // dispatched, so responses are sent through this rather than a
    // per-connection channel captured at dispatch time.
    active_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Stream>>>,
}

impl Session {
    pub fn new(id: u64, concurrency: usize) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            secret: generate_secret(),
            concurrency,
            call_map: DashMap::new(),
            ctrl_sequence: AtomicU64::new(0),
            data_sequence: AtomicU64::new(0),
            alloc_lock: std::sync::Mutex::new(()),
            last_heartbeat_millis: AtomicI64::new(now_millis()),
            created_at_millis: now_millis(),
            active_tx: std::sync::Mutex::new(None),
        });
        // The handshake itself provisions the first full window of channel
        // records so a client can start making calls without an initial
        // RequestIds round trip.
        session.sweep_and_allocate(0, &[]);
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> String {
        format!("{}-{}", self.id, self.secret)
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Parses a `"<id>-<secret>"` resumption token. `None` if malformed.
    pub fn parse_token(token: &str) -> Option<(u64, &str)> {
        let (id_part, secret) = token.split_once('-')?;
        if secret.len() != SECRET_LEN {
            return None;
        }
        let id: u64 = id_part.parse().ok()?;
        Some((id, secret))
    }

    pub fn verify_secret(&self, secret: &str) -> bool {
        self.secret == secret
    }

    /// Exact lookup by callback id; spec §4.7's data path requires a
    /// protocol error when no record exists rather than falling back to any
    /// slot (the bug a modulo-indexed array had).
    pub fn channel(&self, callback_id: u64) -> Option<Arc<ChannelRecord>> {
        self.call_map.get(&callback_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Accepts a control-stream sequence number if it is strictly newer
    /// than the last one accepted, mirroring `OnControlStream`'s
    /// `seq <= p.ctrlSequence` stale check. Returns `false` for a
    /// stale/replayed stream, which callers must silently ignore rather
    /// than error on (spec §4.7 Ordering).
    pub fn accept_ctrl_sequence(&self, seq: u64) -> bool {
        loop {
            let current = self.ctrl_sequence.load(Ordering::Acquire);
            if seq <= current {
                return false;
            }
            if self
                .ctrl_sequence
                .compare_exchange(current, seq, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// The RequestIds sweep/alloc protocol (§4.7 "Channel-id allocation"):
    /// records with `callback_id <= ceiling` that weren't marked are
    /// released; survivors are unmarked for the next round; fresh records
    /// are allocated until the map holds `concurrency` entries again.
    /// Returns the highest allocated callback id, the value written back in
    /// `RequestIdsBack`.
    pub fn sweep_and_allocate(&self, ceiling: u64, marks: &[u64]) -> u64 {
        #[allow(clippy::unwrap_used)]
        let _guard = self.alloc_lock.lock().unwrap();
        let marked: HashSet<u64> = marks.iter().copied().collect();
        for entry in self.call_map.iter() {
            if marked.contains(entry.key()) {
                entry.value().mark.store(true, Ordering::Release);
            }
        }
        let mut count: usize = 0;
        let stale: Vec<u64> = self
            .call_map
            .iter()
            .filter_map(|entry| {
                let record = entry.value();
                let should_release =
                    record.callback_id <= ceiling && !record.mark.load(Ordering::Acquire);
                if should_release {
                    Some(*entry.key())
                } else {
                    record.mark.store(false, Ordering::Release);
                    count += 1;
                    None
                }
            })
            .collect();
        for id in stale {
            self.call_map.remove(&id);
        }
        while count < self.concurrency {
            let next_id = self.data_sequence.fetch_add(1, Ordering::AcqRel) + 1;
            self.call_map.insert(next_id, Arc::new(ChannelRecord::new(next_id)));
            count += 1;
        }
        self.data_sequence.load(Ordering::Acquire)
    }

    /// Points this session's responses at a newly handshaken connection's
    /// writer. Called once per successful `Init`/`InitBack` exchange,
    /// including resumption after a reconnect.
    pub fn set_active_tx(&self, tx: mpsc::UnboundedSender<Stream>) {
        #[allow(clippy::unwrap_used)]
        {
            *self.active_tx.lock().unwrap() = Some(tx);
        }
    }

    /// Sends `stream` over whichever connection is currently active for
    /// this session. Fails if no connection has handshaken yet or the
    /// current one's writer has already gone away.
    pub fn send(&self, stream: Stream) -> Result<(), RpcError> {
        #[allow(clippy::unwrap_used)]
        let tx = self.active_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(stream).map_err(|_| RpcError::broken_stream()),
            None => Err(RpcError::broken_stream()),
        }
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_millis.store(now_millis(), Ordering::Release);
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        let last = self.last_heartbeat_millis.load(Ordering::Acquire);
        now_millis() - last > timeout.as_millis() as i64
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis((now_millis() - self.created_at_millis).max(0) as u64)
    }
}

/// The server-side session table: an id-keyed concurrent map plus the
/// monotonic id generator that mints fresh sessions on `Init`.
pub struct SessionTable {
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
    concurrency: usize,
}

impl SessionTable {
    pub fn new(concurrency: usize) -> Self {
        Self { sessions: DashMap::new(), next_id: AtomicU64::new(1), concurrency }
    }

    pub fn create(&self) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, self.concurrency);
        self.sessions.insert(id, Arc::clone(&session));
        session
    }

    pub fn resume(&self, token: &str) -> Option<Arc<Session>> {
        let (id, secret) = Session::parse_token(token)?;
        let entry = self.sessions.get(&id)?;
        if entry.verify_secret(secret) {
            Some(Arc::clone(&entry))
        } else {
            None
        }
    }

    pub fn remove(&self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drops every session whose last heartbeat is older than `timeout`.
    /// Intended to run periodically from the server's sweep task.
    pub fn sweep_expired(&self, timeout: Duration) -> usize {
        let expired: Vec<u64> =
            self.sessions.iter().filter(|e| e.value().is_expired(timeout)).map(|e| *e.key()).collect();
        for id in &expired {
            self.sessions.remove(id);
        }
        expired.len()
    }
}
