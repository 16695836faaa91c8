// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tagged error model (type / level / code / message) shared by every
//! subsystem: the wire codec, the session state machine, the dispatcher and
//! the client. Grounded on the accumulating `AddDebug` trail of the Go
//! original this crate is derived from, re-expressed as an immutable value
//! (`add_debug` returns a new `RpcError`, it never mutates `self`).

use std::fmt;

/// Broad category of failure, matching §7's taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    Protocol = 1,
    Transport = 2,
    Reply = 3,
    Runtime = 4,
    Kernel = 5,
    Security = 6,
    Config = 7,
    Net = 8,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "Protocol",
            ErrorKind::Transport => "Transport",
            ErrorKind::Reply => "Reply",
            ErrorKind::Runtime => "Runtime",
            ErrorKind::Kernel => "Kernel",
            ErrorKind::Security => "Security",
            ErrorKind::Config => "Config",
            ErrorKind::Net => "Net",
        }
    }
}

/// Severity attached to an [`RpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorLevel {
    Warn = 1,
    Error = 2,
    Fatal = 3,
}

impl ErrorLevel {
    fn as_str(self) -> &'static str {
        match self {
            ErrorLevel::Warn => "Warn",
            ErrorLevel::Error => "Error",
            ErrorLevel::Fatal => "Fatal",
        }
    }
}

/// A tagged, accumulating error value.
///
/// `code` is an application-defined 32-bit code scoped within `kind`; it is
/// not a global error registry. `debug` accumulates `file:line`-style sites
/// as the error is propagated up through `add_debug`, newline-joined on
/// render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    kind: ErrorKind,
    level: ErrorLevel,
    code: u32,
    message: String,
    debug: Vec<String>,
}

macro_rules! kind_ctor {
    ($name:ident, $kind:expr) => {
        pub fn $name(code: u32, level: ErrorLevel, message: impl Into<String>) -> Self {
            Self::new($kind, level, code, message)
        }
    };
}

impl RpcError {
    pub fn new(
        kind: ErrorKind,
        level: ErrorLevel,
        code: u32,
        message: impl Into<String>,
    ) -> Self {
        Self { kind, level, code, message: message.into(), debug: Vec::new() }
    }

    kind_ctor!(protocol, ErrorKind::Protocol);

    kind_ctor!(transport, ErrorKind::Transport);

    kind_ctor!(reply, ErrorKind::Reply);

    kind_ctor!(runtime, ErrorKind::Runtime);

    kind_ctor!(kernel, ErrorKind::Kernel);

    kind_ctor!(security, ErrorKind::Security);

    kind_ctor!(config, ErrorKind::Config);

    kind_ctor!(net, ErrorKind::Net);

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn level(&self) -> ErrorLevel {
        self.level
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The §3 wire composition of (type, level, code), using OR rather than
    /// the AND the original source used — see DESIGN.md and spec.md §9.
    pub fn encoded(&self) -> u64 {
        ((self.kind as u64) << 56) | ((self.level as u64) << 48) | ((self.code as u64) << 16)
    }

    /// Returns a new error with `site` appended to the debug trail. The
    /// receiver is left untouched.
    #[must_use]
    pub fn add_debug(&self, site: impl Into<String>) -> Self {
        let mut debug = self.debug.clone();
        debug.push(site.into());
        Self { debug, ..self.clone() }
    }

    pub fn debug_trail(&self) -> &[String] {
        &self.debug
    }

    /// A synthetic, client-safe rendering of this error that never leaks
    /// handler internals — used when masking a panic as "internal error".
    pub fn internal_error() -> Self {
        Self::reply(0, ErrorLevel::Error, "internal error")
    }

    pub fn reply_not_found(path: &str) -> Self {
        Self::reply(1, ErrorLevel::Warn, format!("reply not found: {path}"))
    }

    pub fn reply_panic(message: impl Into<String>) -> Self {
        Self::reply(2, ErrorLevel::Fatal, message)
    }

    pub fn broken_stream() -> Self {
        Self::protocol(1, ErrorLevel::Warn, "stream is broken")
    }

    pub fn backpressure() -> Self {
        Self::protocol(2, ErrorLevel::Warn, "dispatcher queue is full")
    }

    pub fn call_depth_exceeded() -> Self {
        Self::runtime(1, ErrorLevel::Error, "max call depth exceeded")
    }

    pub fn illegal_thread() -> Self {
        Self::runtime(2, ErrorLevel::Error, "illegal in current goroutine/thread")
    }

    pub fn client_timeout() -> Self {
        Self::transport(1, ErrorLevel::Warn, "timeout")
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind.as_str(), self.level.as_str(), self.message)?;
        for site in &self.debug {
            write!(f, "\n{site}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

/// Captures the caller's `file:line` the way the original Go runtime
/// captures call sites for debug trails.
#[track_caller]
pub fn here() -> String {
    let loc = std::panic::Location::caller();
    format!("{}:{}", loc.file(), loc.line())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_uses_or_not_and() {
        let e = RpcError::protocol(7, ErrorLevel::Fatal, "x");
        let encoded = e.encoded();
        assert_eq!(encoded >> 56, ErrorKind::Protocol as u64);
        assert_eq!((encoded >> 48) & 0xFF, ErrorLevel::Fatal as u64);
        assert_eq!((encoded >> 16) & 0xFFFF_FFFF, 7);
    }

    #[test]
    fn add_debug_does_not_mutate_original() {
        let base = RpcError::kernel(1, ErrorLevel::Fatal, "boom");
        let extended = base.add_debug("a.rs:1");
        assert!(base.debug_trail().is_empty());
        assert_eq!(extended.debug_trail(), ["a.rs:1"]);
        let twice = extended.add_debug("b.rs:2");
        assert_eq!(twice.debug_trail(), ["a.rs:1", "b.rs:2"]);
    }

    #[test]
    fn display_includes_debug_trail() {
        let e = RpcError::reply(9, ErrorLevel::Warn, "oops").add_debug("f.rs:10");
        let s = e.to_string();
        assert!(s.contains("Reply"));
        assert!(s.contains("oops"));
        assert!(s.contains("f.rs:10"));
    }
}
