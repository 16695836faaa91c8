// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

#![allow(clippy::all)]

mod integration_tests {
    pub mod common;

    pub mod call_roundtrip;
    pub mod heartbeat_timeout;
    pub mod nested_call;
    pub mod reconnect;
    pub mod session_resumption;
}
