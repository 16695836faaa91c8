// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The client core (C9): connect, handshake, a fixed-size channel-slot
//! array sized by the server's reported concurrency, and a read loop that
//! completes pending calls by `callback_id`. Grounded on `client/client.rs`'s
//! split read/write halves and its periodic unsolicited-keepalive handling
//! for the heartbeat tick, and on
//! `examples/original_source/internal/client/client.go`'s `channels []Channel`
//! array (slot index = callback_id mod concurrency, each slot's `.sequence`
//! the callback id it currently owns) and its reconnect-time "resend channel
//! message" retransmission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::adapter::{read_frame, write_frame};
use crate::cfg::config::ClientConfig;
use crate::codec::{Stream, StreamKind, Value};
use crate::error::{ErrorLevel, RpcError};

/// One in-flight call: the exact request stream sent (kept so a reconnect
/// can resend it byte-identically) and the channel its caller is waiting
/// on. `reply_tx` is taken (leaving `None`) the moment a response arrives,
/// so a slot can still be inspected for retransmission without losing its
/// request even after the waiter has been woken.
struct PendingCall {
    request: Stream,
    reply_tx: Option<oneshot::Sender<Result<Value, RpcError>>>,
}

/// The client-side counterpart of a server channel record: this slot's
/// currently assigned callback id plus whether it has ever been used. A
/// slot whose id has already completed one call must be renewed via
/// `RequestIds` before reuse — the server's record for the old id may
/// still hold a cached response from the previous call.
struct Slot {
    callback_id: AtomicU64,
    used_once: std::sync::atomic::AtomicBool,
    state: Mutex<Option<PendingCall>>,
}

pub struct Client {
    config: ClientConfig,
    tx: Mutex<mpsc::UnboundedSender<Stream>>,
    cancel: Mutex<CancellationToken>,
    slots: Vec<Slot>,
    pending_by_id: DashMap<u64, usize>,
    ctrl_seq: AtomicU64,
    renew_lock: Mutex<()>,
    request_ids_waiter: Mutex<Option<oneshot::Sender<u64>>>,
    session_token: Mutex<Option<String>>,
    session_id: AtomicU64,
}

/// Result of the `Init`/`InitBack` exchange: enough to stand up or replace
/// a connection's read/write halves.
struct Handshaken {
    tx: mpsc::UnboundedSender<Stream>,
    reader: tokio::io::ReadHalf<TcpStream>,
    session_id: u64,
    token: String,
    concurrency: usize,
}

impl Client {
    /// Connects, performs the `Init`/`InitBack` handshake, and starts the
    /// background read loop and heartbeat tick. `resume_token` lets a
    /// caller reattach to a previous session after a process restart (as
    /// opposed to [`Client::reconnect`], which reattaches the very same
    /// live `Client` after a dropped connection).
    pub async fn connect(config: ClientConfig, resume_token: Option<String>) -> Result<Arc<Self>, RpcError> {
        let handshaken = Self::open_connection(&config, resume_token.as_deref(), 1).await?;
        let concurrency = handshaken.concurrency.max(1);
        let slots: Vec<Slot> = (0..concurrency)
            .map(|i| Slot {
                callback_id: AtomicU64::new(i as u64 + 1),
                used_once: std::sync::atomic::AtomicBool::new(false),
                state: Mutex::new(None),
            })
            .collect();

        let cancel = CancellationToken::new();
        let client = Arc::new(Self {
            config,
            tx: Mutex::new(handshaken.tx),
            cancel: Mutex::new(cancel.clone()),
            slots,
            pending_by_id: DashMap::new(),
            ctrl_seq: AtomicU64::new(1),
            renew_lock: Mutex::new(()),
            request_ids_waiter: Mutex::new(None),
            session_token: Mutex::new(Some(handshaken.token)),
            session_id: AtomicU64::new(handshaken.session_id),
        });

        Arc::clone(&client).spawn_read_loop(handshaken.reader, cancel.clone());
        Arc::clone(&client).spawn_heartbeat(cancel);
        Ok(client)
    }

    /// Drops the current connection and re-handshakes with the server
    /// using this client's existing resumption token, then retransmits
    /// every occupied slot's request stream over the new connection —
    /// spec §4.9's "Retransmission on reconnect". A handler still running
    /// server-side answers via the cached-response path on the session's
    /// channel record (§4.7 Data path); one that hadn't started yet simply
    /// runs now that the stream has arrived again.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), RpcError> {
        {
            let old_cancel = self.cancel.lock().await.clone();
            old_cancel.cancel();
        }
        let resume_token = self.session_token.lock().await.clone();
        let sequence = self.ctrl_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let handshaken = Self::open_connection(&self.config, resume_token.as_deref(), sequence).await?;

        *self.tx.lock().await = handshaken.tx;
        *self.session_token.lock().await = Some(handshaken.token);
        self.session_id.store(handshaken.session_id, Ordering::Release);

        let new_cancel = CancellationToken::new();
        *self.cancel.lock().await = new_cancel.clone();
        Arc::clone(self).spawn_read_loop(handshaken.reader, new_cancel.clone());
        Arc::clone(self).spawn_heartbeat(new_cancel);

        self.retransmit_pending().await
    }

    async fn retransmit_pending(&self) -> Result<(), RpcError> {
        let tx = self.tx.lock().await.clone();
        for slot in &self.slots {
            let guard = slot.state.lock().await;
            if let Some(pending) = guard.as_ref() {
                tx.send(pending.request.clone()).map_err(|_| RpcError::broken_stream())?;
            }
        }
        Ok(())
    }

    /// Performs one `Init`/`InitBack` round trip over a fresh TCP
    /// connection and spawns its writer task. Shared by [`Client::connect`]
    /// and [`Client::reconnect`]; the latter passes a monotonically
    /// increasing `sequence` so the server doesn't treat the re-handshake
    /// as a stale replay of the first one (§4.7 Ordering).
    async fn open_connection(
        config: &ClientConfig,
        resume_token: Option<&str>,
        sequence: u64,
    ) -> Result<Handshaken, RpcError> {
        let socket = TcpStream::connect(&config.network.address)
            .await
            .map_err(|e| RpcError::net(20, ErrorLevel::Error, e.to_string()))?;
        socket.set_nodelay(true).ok();
        let (mut reader, mut writer) = tokio::io::split(socket);
        let (tx, mut rx) = mpsc::unbounded_channel::<Stream>();

        let write_timeout = config.timeouts.write_timeout;
        let transport_limit = config.limits.transport_limit;
        tokio::spawn(async move {
            while let Some(stream) = rx.recv().await {
                if write_frame(&mut writer, write_timeout, transport_limit, &stream).await.is_err() {
                    break;
                }
            }
        });

        let mut init = Stream::new();
        init.set_kind(StreamKind::Init);
        init.set_sequence(sequence);
        init.write_string(resume_token.unwrap_or(""));
        tx.send(init).map_err(|_| RpcError::broken_stream())?;

        let mut init_back =
            read_frame(&mut reader, config.timeouts.read_timeout, config.limits.transport_limit).await?;
        if init_back.kind() != StreamKind::InitBack {
            return Err(RpcError::protocol(41, ErrorLevel::Warn, "expected InitBack stream"));
        }
        init_back.set_read_pos_to_body_start();
        let token = init_back.read_string()?;
        let _read_timeout_ms = init_back.read_u64().unwrap_or(0);
        let _write_timeout_ms = init_back.read_u64().unwrap_or(0);
        let _transport_limit = init_back.read_u64().unwrap_or(0);
        let concurrency = init_back.read_u64().unwrap_or(1).max(1) as usize;
        let session_id = init_back.session_id();

        Ok(Handshaken { tx, reader, session_id, token, concurrency })
    }

    pub async fn session_token(&self) -> Option<String> {
        self.session_token.lock().await.clone()
    }

    /// Sends an `RpcRequest` for `path` with `args` and awaits its reply.
    pub async fn call(&self, path: &str, args: &[Value]) -> Result<Value, RpcError> {
        let (slot_idx, callback_id) = self.acquire_slot().await?;

        let mut req = Stream::new();
        req.set_kind(StreamKind::RpcRequest);
        req.set_callback_id(callback_id);
        req.set_session_id(self.session_id.load(Ordering::Acquire));
        req.write_string(path);
        req.write_array(args);

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut guard = self.slots[slot_idx].state.lock().await;
            *guard = Some(PendingCall { request: req.clone(), reply_tx: Some(reply_tx) });
        }
        self.pending_by_id.insert(callback_id, slot_idx);

        let send_result = {
            let tx = self.tx.lock().await;
            tx.send(req)
        };
        if send_result.is_err() {
            self.release_slot(slot_idx, callback_id).await;
            return Err(RpcError::broken_stream());
        }

        let result = match tokio::time::timeout(self.config.timeouts.read_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::broken_stream()),
            // A later real response is delivered to this now-released slot's
            // successor and dropped, per §5's cancellation semantics.
            Err(_) => Err(RpcError::client_timeout()),
        };
        self.release_slot(slot_idx, callback_id).await;
        result
    }

    async fn release_slot(&self, slot_idx: usize, callback_id: u64) {
        self.pending_by_id.remove(&callback_id);
        *self.slots[slot_idx].state.lock().await = None;
    }

    /// Reserves a free slot, renewing its callback id first if it has
    /// already served a previous call. Renewal is batched across every
    /// currently idle slot in one `RequestIds` round trip rather than one
    /// per slot.
    async fn acquire_slot(&self) -> Result<(usize, u64), RpcError> {
        loop {
            for i in 0..self.slots.len() {
                let mut guard = self.slots[i].state.lock().await;
                if guard.is_some() {
                    continue;
                }
                if self.slots[i].used_once.load(Ordering::Acquire) {
                    drop(guard);
                    self.renew_ids().await?;
                    guard = self.slots[i].state.lock().await;
                    if guard.is_some() {
                        continue;
                    }
                } else {
                    self.slots[i].used_once.store(true, Ordering::Release);
                }
                *guard = Some(PendingCall { request: Stream::new(), reply_tx: None });
                let callback_id = self.slots[i].callback_id.load(Ordering::Acquire);
                return Ok((i, callback_id));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Implements §4.7's channel-id allocation protocol from the client
    /// side: report the highest id any slot has ever held as `ceiling`,
    /// mark the ids of calls still in flight so the server's sweep
    /// preserves their records, and adopt the fresh contiguous block of
    /// ids the server allocates in return for every currently idle slot.
    async fn renew_ids(&self) -> Result<(), RpcError> {
        let _guard = self.renew_lock.lock().await;
        let mut marks = Vec::new();
        let mut free_idx = Vec::new();
        let mut ceiling = 0u64;
        for (i, slot) in self.slots.iter().enumerate() {
            let guard = slot.state.lock().await;
            let id = slot.callback_id.load(Ordering::Acquire);
            ceiling = ceiling.max(id);
            if guard.is_some() {
                marks.push(id);
            } else {
                free_idx.push(i);
            }
        }
        if free_idx.is_empty() {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        *self.request_ids_waiter.lock().await = Some(tx);

        let mut req = Stream::new();
        req.set_kind(StreamKind::RequestIds);
        req.set_session_id(self.session_id.load(Ordering::Acquire));
        req.set_sequence(self.ctrl_seq.fetch_add(1, Ordering::AcqRel) + 1);
        req.write_u64(ceiling);
        let mark_values: Vec<Value> = marks.into_iter().map(Value::Uint64).collect();
        req.write_array(&mark_values);

        let send_result = {
            let sender = self.tx.lock().await;
            sender.send(req)
        };
        if send_result.is_err() {
            self.request_ids_waiter.lock().await.take();
            return Err(RpcError::broken_stream());
        }

        let highest = tokio::time::timeout(self.config.timeouts.read_timeout, rx)
            .await
            .map_err(|_| RpcError::client_timeout())?
            .map_err(|_| RpcError::broken_stream())?;

        let mut next_id = highest.saturating_sub(free_idx.len() as u64 - 1);
        for idx in free_idx {
            self.slots[idx].callback_id.store(next_id, Ordering::Release);
            next_id += 1;
        }
        Ok(())
    }

    pub fn close(&self) {
        if let Ok(cancel) = self.cancel.try_lock() {
            cancel.cancel();
        }
    }

    fn spawn_read_loop(self: Arc<Self>, mut reader: tokio::io::ReadHalf<TcpStream>, cancel: CancellationToken) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = read_frame(&mut reader, self.config.timeouts.read_timeout, self.config.limits.transport_limit) => {
                        match frame {
                            Ok(mut stream) => self.handle_incoming(&mut stream).await,
                            Err(e) => {
                                warn!(error = %e, "client read loop terminating");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn handle_incoming(&self, stream: &mut Stream) {
        match stream.kind() {
            StreamKind::RpcResponseOk => {
                stream.set_read_pos_to_body_start();
                let value = stream.read_value().unwrap_or(Value::Null);
                self.complete(stream.callback_id(), Ok(value)).await;
            }
            StreamKind::RpcResponseError => {
                stream.set_read_pos_to_body_start();
                let encoded = stream.read_u64().unwrap_or(0);
                let message = stream.read_string().unwrap_or_default();
                self.complete(stream.callback_id(), Err(decode_error(encoded, message))).await;
            }
            StreamKind::Pong => {}
            StreamKind::RequestIdsBack => {
                stream.set_read_pos_to_body_start();
                if let Ok(highest) = stream.read_u64() {
                    if let Some(tx) = self.request_ids_waiter.lock().await.take() {
                        let _ = tx.send(highest);
                    }
                }
            }
            other => warn!(?other, "client received unexpected stream kind"),
        }
    }

    async fn complete(&self, callback_id: u64, result: Result<Value, RpcError>) {
        if let Some((_, slot_idx)) = self.pending_by_id.remove(&callback_id) {
            let mut guard = self.slots[slot_idx].state.lock().await;
            if let Some(pending) = guard.as_mut() {
                if let Some(tx) = pending.reply_tx.take() {
                    let _ = tx.send(result);
                }
            }
        }
    }

    fn spawn_heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.timeouts.heartbeat;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let mut ping = Stream::new();
                        ping.set_kind(StreamKind::Ping);
                        ping.set_session_id(self.session_id.load(Ordering::Acquire));
                        let tx = self.tx.lock().await;
                        if tx.send(ping).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn decode_error(encoded: u64, message: String) -> RpcError {
    let kind_byte = (encoded >> 56) as u8;
    let level_byte = ((encoded >> 48) & 0xFF) as u8;
    let code = ((encoded >> 16) & 0xFFFF_FFFF) as u32;
    let kind = match kind_byte {
        1 => crate::error::ErrorKind::Protocol,
        2 => crate::error::ErrorKind::Transport,
        3 => crate::error::ErrorKind::Reply,
        4 => crate::error::ErrorKind::Runtime,
        5 => crate::error::ErrorKind::Kernel,
        6 => crate::error::ErrorKind::Security,
        7 => crate::error::ErrorKind::Config,
        _ => crate::error::ErrorKind::Net,
    };
    let level = match level_byte {
        1 => ErrorLevel::Warn,
        3 => ErrorLevel::Fatal,
        _ => ErrorLevel::Error,
    };
    RpcError::new(kind, level, code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_roundtrips_kind_level_code() {
        let original = RpcError::reply(9, ErrorLevel::Warn, "boom");
        let decoded = decode_error(original.encoded(), original.message().to_string());
        assert_eq!(decoded.kind(), original.kind());
        assert_eq!(decoded.level(), original.level());
        assert_eq!(decoded.code(), original.code());
    }
}
