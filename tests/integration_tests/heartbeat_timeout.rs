// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use duplex_rpc::client::Client;

use crate::integration_tests::common::{client_config, start_server};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quiet_session_is_swept_after_heartbeat_timeout() {
    let (server, addr) = start_server(30, 120).await;

    // The client's own heartbeat interval is set far longer than the
    // server's heartbeat_timeout, so from the server's perspective this
    // connection goes quiet right after the handshake.
    let client =
        Client::connect(client_config(&addr, 10_000, 20_000), None).await.expect("connect");
    assert_eq!(server.session_table().len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.session_table().len(), 0, "expired session must be swept");

    client.close();
}
