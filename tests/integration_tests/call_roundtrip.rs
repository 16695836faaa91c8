// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use duplex_rpc::client::Client;
use duplex_rpc::codec::Value;

use crate::integration_tests::common::{client_config, start_server};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_call_roundtrips() {
    let (_server, addr) = start_server(50, 500).await;
    let client = Client::connect(client_config(&addr, 50, 500), None).await.expect("connect");

    let result = client.call("#.echo:Say", &[Value::String("hello".to_string())]).await.expect("call");
    assert_eq!(result.as_str(), Some("hello"));

    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_reply_surfaces_as_error() {
    let (_server, addr) = start_server(50, 500).await;
    let client = Client::connect(client_config(&addr, 50, 500), None).await.expect("connect");

    let err = client.call("#.missing:Nope", &[]).await.expect_err("should fail");
    assert_eq!(err.kind(), duplex_rpc::error::ErrorKind::Reply);

    client.close();
}
