// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use duplex_rpc::client::Client;
use duplex_rpc::codec::Value;

use crate::integration_tests::common::{client_config, start_server};

/// Spec scenario: an in-flight call to a still-running handler survives a
/// client-initiated reconnect. The server never saw the connection drop as
/// an error — it just stops hearing from the old TCP half and keeps the
/// handler running against the session's channel record — so the
/// retransmitted request on the new connection finds that record already
/// marked running and the eventual reply still reaches the original caller.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_flight_call_survives_client_reconnect() {
    let (server, addr) = start_server(50, 5_000).await;
    let client = Client::connect(client_config(&addr, 50, 5_000), None).await.expect("connect");

    let call_client = std::sync::Arc::clone(&client);
    let call_task = tokio::spawn(async move {
        call_client.call("#.sleepy:Wait", &[Value::Int64(300)]).await
    });

    // Give the request time to reach the server and start the handler
    // before we yank the connection out from under it.
    tokio::time::sleep(Duration::from_millis(80)).await;
    client.reconnect().await.expect("reconnect");

    let result = call_task.await.expect("call task join").expect("call should still complete");
    assert_eq!(result.as_str(), Some("done"));

    assert_eq!(server.session_table().len(), 1, "reconnect must reattach the same session");
    client.close();
}
