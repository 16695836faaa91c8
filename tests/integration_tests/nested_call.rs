// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use duplex_rpc::client::Client;
use duplex_rpc::codec::Value;

use crate::integration_tests::common::{client_config, start_server};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outer_reply_recurses_into_inner_reply_on_same_worker() {
    let (_server, addr) = start_server(50, 500).await;
    let client = Client::connect(client_config(&addr, 50, 500), None).await.expect("connect");

    // `#.nest:Outer` calls `rt.call("#.nest:Inner", ..)` and adds one to the
    // result; this exercises the dispatcher's reentrant `Runtime::call`
    // path end to end over the wire.
    let result = client.call("#.nest:Outer", &[Value::Int64(10)]).await.expect("call");
    assert_eq!(result.as_i64(), Some(21));

    client.close();
}
