// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use duplex_rpc::client::Client;
use duplex_rpc::session::Session;

use crate::integration_tests::common::{client_config, start_server};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnecting_with_a_resume_token_reattaches_the_same_session() {
    let (server, addr) = start_server(50, 2_000).await;

    let first = Client::connect(client_config(&addr, 50, 2_000), None).await.expect("connect");
    let token = first.session_token().await.expect("token issued on handshake");
    let (first_id, _secret) = Session::parse_token(&token).expect("token parses");
    first.close();

    assert_eq!(server.session_table().len(), 1);

    let second = Client::connect(client_config(&addr, 50, 2_000), Some(token))
        .await
        .expect("resume connect");
    let resumed_token = second.session_token().await.expect("resumed token");
    let (second_id, _) = Session::parse_token(&resumed_token).expect("resumed token parses");

    assert_eq!(first_id, second_id, "resumed connection must keep the same session id");
    // A resumed session still shows up exactly once in the table.
    assert_eq!(server.session_table().len(), 1);

    second.close();
}
