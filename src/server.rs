// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The server core (C8): binds a listener, runs the accept loop, and wires
//! each accepted connection to a session, the dispatcher and the registry.
//! Grounded on `client/client.rs`'s `read_loop` (read header, then body,
//! dispatch, write response) and its graceful-quiesce shutdown pattern,
//! turned around from the client's perspective to the server's.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{read_frame, write_frame};
use crate::cfg::config::ServerConfig;
use crate::codec::{Stream, StreamKind, Value};
use crate::dispatcher::{Dispatcher, Job, JobArgs};
use crate::error::{ErrorLevel, RpcError};
use crate::registry::Registry;
use crate::session::{Session, SessionTable};

pub struct Server {
    config: ServerConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionTable>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Registry) -> Arc<Self> {
        let registry = Arc::new(registry);
        let dispatcher = Dispatcher::start(
            config.concurrency.num_of_threads,
            config.concurrency.queue_capacity,
            Arc::clone(&registry),
            config.limits.max_call_depth,
        );
        let sessions = Arc::new(SessionTable::new(config.concurrency.num_of_channels));
        Arc::new(Self { config, registry, dispatcher, sessions, cancel: CancellationToken::new() })
    }

    pub fn session_table(&self) -> Arc<SessionTable> {
        Arc::clone(&self.sessions)
    }

    /// Binds the listener and serves connections until `shutdown` is
    /// called or a fatal bind error occurs.
    pub async fn run(self: Arc<Self>) -> Result<(), RpcError> {
        let listener = TcpListener::bind(&self.config.network.address)
            .await
            .map_err(|e| RpcError::net(10, ErrorLevel::Fatal, e.to_string()))?;
        info!(address = %self.config.network.address, "server listening");
        self.serve(listener).await
    }

    /// Serves connections off an already-bound listener. Split out from
    /// [`Server::run`] so tests can bind an ephemeral port (`:0`) and learn
    /// the chosen address before handing the listener over.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), RpcError> {
        let sweeper = {
            let sessions = Arc::clone(&self.sessions);
            let timeout = self.config.timeouts.heartbeat_timeout;
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(timeout / 2) => {
                            let removed = sessions.sweep_expired(timeout);
                            if removed > 0 {
                                warn!(removed, "swept expired sessions");
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.map_err(|e| RpcError::net(11, ErrorLevel::Error, e.to_string()))?;
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(socket).await {
                            warn!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
        sweeper.abort();
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.dispatcher.shutdown(Duration::from_secs(5));
    }

    async fn handle_connection(self: Arc<Self>, socket: tokio::net::TcpStream) -> Result<(), RpcError> {
        socket.set_nodelay(true).ok();
        let (mut reader, mut writer) = tokio::io::split(socket);
        let (tx, mut rx) = mpsc::unbounded_channel::<Stream>();

        let write_timeout = self.config.timeouts.write_timeout;
        let transport_limit = self.config.limits.transport_limit;
        let writer_task = tokio::spawn(async move {
            while let Some(stream) = rx.recv().await {
                if write_frame(&mut writer, write_timeout, transport_limit, &stream).await.is_err() {
                    break;
                }
            }
        });

        let session = self.handshake(&mut reader, &tx).await?;
        let result = self.connection_loop(&mut reader, &tx, &session).await;
        // Deliberately do not remove the session here: a dropped TCP
        // connection is the common case a resumption token exists for. The
        // session only leaves the table via `sweep_expired` once its
        // heartbeat goes stale past `heartbeat_timeout`.
        drop(tx);
        let _ = writer_task.await;
        result
    }

    /// Validates and serves the `Init`/`InitBack` exchange. Spec §4.7: the
    /// first stream on a connection must have `callback_id == 0`,
    /// `kind == Init`, `sequence > 0`, and a body of exactly one string (the
    /// resumption token, possibly empty). Any deviation — nonzero callback
    /// id, wrong kind, a body that doesn't even parse as a string, or
    /// trailing bytes after it — is a protocol error that closes the
    /// connection. A token that parses as a string but doesn't name a live
    /// session (or whose secret doesn't match) is not "unparsable": that's
    /// the ordinary case of a fresh client, or a stale/evicted session, and
    /// falls back to allocating a new session rather than erroring
    /// (`examples/original_source/server_core.go`'s `onConnRun`).
    async fn handshake<R>(
        &self,
        reader: &mut R,
        tx: &mpsc::UnboundedSender<Stream>,
    ) -> Result<Arc<Session>, RpcError>
    where
        R: AsyncRead + Unpin,
    {
        let mut init = read_frame(reader, self.config.timeouts.read_timeout, self.config.limits.transport_limit)
            .await?;
        if init.callback_id() != 0 {
            return Err(RpcError::protocol(40, ErrorLevel::Warn, "handshake callback_id must be 0"));
        }
        if init.sequence() == 0 {
            return Err(RpcError::protocol(41, ErrorLevel::Warn, "handshake sequence must be > 0"));
        }
        if init.kind() != StreamKind::Init {
            return Err(RpcError::protocol(42, ErrorLevel::Warn, "expected Init stream"));
        }
        init.set_read_pos_to_body_start();
        let resume_token = init.read_string()?;
        if !init.finished_read() {
            return Err(RpcError::protocol(43, ErrorLevel::Warn, "trailing bytes after handshake body"));
        }

        let session = if !resume_token.is_empty() {
            self.sessions.resume(&resume_token).unwrap_or_else(|| self.sessions.create())
        } else {
            self.sessions.create()
        };

        // A stale/replayed Init (older sequence than one we already
        // accepted for this session) is silently dropped rather than
        // answered, matching the ctrl-stream staleness rule in §4.7
        // Ordering.
        if !session.accept_ctrl_sequence(init.sequence()) {
            return Err(RpcError::broken_stream());
        }
        session.touch_heartbeat();
        session.set_active_tx(tx.clone());

        let mut reply = Stream::new();
        reply.set_kind(StreamKind::InitBack);
        reply.set_session_id(session.id());
        reply.write_string(&session.token());
        reply.write_u64(self.config.timeouts.read_timeout.as_millis() as u64);
        reply.write_u64(self.config.timeouts.write_timeout.as_millis() as u64);
        reply.write_u64(self.config.limits.transport_limit as u64);
        reply.write_u64(session.concurrency() as u64);
        tx.send(reply).map_err(|_| RpcError::broken_stream())?;
        Ok(session)
    }

    async fn connection_loop<R>(
        self: &Arc<Self>,
        reader: &mut R,
        tx: &mpsc::UnboundedSender<Stream>,
        session: &Arc<Session>,
    ) -> Result<(), RpcError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let mut req =
                read_frame(reader, self.config.timeouts.read_timeout, self.config.limits.transport_limit).await?;
            session.touch_heartbeat();
            match req.kind() {
                StreamKind::Ping => {
                    let mut pong = Stream::new();
                    pong.set_kind(StreamKind::Pong);
                    pong.set_session_id(session.id());
                    tx.send(pong).map_err(|_| RpcError::broken_stream())?;
                }
                StreamKind::RequestIds => {
                    // Stale/replayed control streams are silently ignored,
                    // not errored, per §4.7 Ordering — the same
                    // `ctrl_sequence` the handshake itself advances.
                    if !session.accept_ctrl_sequence(req.sequence()) {
                        continue;
                    }
                    req.set_read_pos_to_body_start();
                    let ceiling = req.read_u64().unwrap_or(0);
                    let marks: Vec<u64> = req
                        .read_array()
                        .unwrap_or_default()
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::Uint64(id) => Some(id),
                            Value::Int64(id) if id >= 0 => Some(id as u64),
                            _ => None,
                        })
                        .collect();
                    let highest = session.sweep_and_allocate(ceiling, &marks);
                    let mut reply = Stream::new();
                    reply.set_kind(StreamKind::RequestIdsBack);
                    reply.set_session_id(session.id());
                    reply.write_u64(highest);
                    tx.send(reply).map_err(|_| RpcError::broken_stream())?;
                }
                StreamKind::RpcRequest => {
                    self.dispatch_request(req, tx, session)?;
                }
                other => {
                    warn!(?other, "ignoring stream of unexpected kind on established connection");
                }
            }
        }
    }

    fn dispatch_request(
        self: &Arc<Self>,
        mut req: Stream,
        tx: &mpsc::UnboundedSender<Stream>,
        session: &Arc<Session>,
    ) -> Result<(), RpcError> {
        let callback_id = req.callback_id();
        let depth = req.depth();
        req.set_read_pos_to_body_start();
        let path = req.read_string()?;

        // Exact callback_id match only — §4.7's "channel slot index =
        // callback_id mod concurrency" invariant is satisfied by how ids
        // are *allocated* (always a contiguous `concurrency`-sized block),
        // not by indexing lookups with a modulo that could alias two live
        // calls onto the same record.
        let channel = match session.channel(callback_id) {
            Some(channel) => channel,
            None => {
                let err = RpcError::protocol(44, ErrorLevel::Warn, "no channel record for callback id");
                let mut reply = Stream::new();
                reply.set_kind(StreamKind::RpcResponseError);
                reply.set_callback_id(callback_id);
                reply.set_session_id(session.id());
                reply.set_depth(depth);
                reply.write_u64(err.encoded());
                reply.write_string(err.message());
                tx.send(reply).map_err(|_| RpcError::broken_stream())?;
                return Ok(());
            }
        };

        if !channel.set_running() {
            // Already running: retransmit the cached response if one
            // exists, else drop — the client will retry after resumption.
            if let Some(cached) = channel.cached_response() {
                tx.send(cached).map_err(|_| RpcError::broken_stream())?;
            }
            return Ok(());
        }

        let session_id = session.id();
        let session = Arc::clone(session);
        let respond = move |result: Result<Value, RpcError>| {
            let mut reply = Stream::new();
            reply.set_callback_id(callback_id);
            reply.set_session_id(session_id);
            reply.set_depth(depth);
            match &result {
                Ok(value) => {
                    reply.set_kind(StreamKind::RpcResponseOk);
                    reply.write_value(value);
                }
                Err(err) => {
                    reply.set_kind(StreamKind::RpcResponseError);
                    reply.write_u64(err.encoded());
                    reply.write_string(err.message());
                }
            }
            if let Some(channel) = session.channel(callback_id) {
                channel.set_return(reply.clone());
            }
            // Delivered via whichever connection is active for the session
            // *now*, not the one live when the call was dispatched — a
            // handler that outlives a client reconnect must still reach
            // its caller (spec §4.9).
            let _ = session.send(reply);
        };

        match self.registry.lookup(&path) {
            Some(meta) => {
                self.dispatcher.submit(Job {
                    meta,
                    args: JobArgs::Raw(req),
                    on_complete: Box::new(respond),
                })
            }
            None => {
                respond(Err(RpcError::reply_not_found(&path)));
                Ok(())
            }
        }
    }
}
