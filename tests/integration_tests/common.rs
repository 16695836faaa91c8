// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;
use std::time::Duration;

use duplex_rpc::cfg::config::{
    BufferConfig, ClientConfig, ConcurrencyConfig, LimitsConfig, NetworkConfig, ServerConfig,
    TimeoutConfig,
};
use duplex_rpc::codec::Value;
use duplex_rpc::registry::{Registry, RegistryBuilder, ServiceBuilder};
use duplex_rpc::server::Server;
use tokio::net::TcpListener;

pub fn demo_registry() -> Registry {
    RegistryBuilder::new()
        .mount(
            ServiceBuilder::new("echo").reply(
                "Say",
                "S",
                Arc::new(|rt, args| {
                    let text = args.first().and_then(Value::as_str).unwrap_or_default();
                    rt.ok(Value::String(text.to_string()))
                }),
            ),
        )
        .mount(ServiceBuilder::new("sleepy").reply(
            "Wait",
            "I",
            Arc::new(|rt, args| {
                let millis = args.first().and_then(Value::as_i64).unwrap_or(0).max(0) as u64;
                std::thread::sleep(Duration::from_millis(millis));
                rt.ok(Value::String("done".to_string()))
            }),
        ))
        .mount(
            ServiceBuilder::new("nest")
                .reply(
                    "Inner",
                    "I",
                    Arc::new(|rt, args| {
                        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                        rt.ok(n * 2)
                    }),
                )
                .reply(
                    "Outer",
                    "I",
                    Arc::new(|rt, args| {
                        let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                        match rt.call("#.nest:Inner", &[Value::Int64(n)]) {
                            Ok(inner) => rt.ok(inner.as_i64().unwrap_or(0) + 1),
                            Err(e) => rt.error(e),
                        }
                    }),
                ),
        )
        .build()
        .expect("demo registry must build")
}

fn timeouts(heartbeat_ms: u64, heartbeat_timeout_ms: u64) -> TimeoutConfig {
    TimeoutConfig {
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        heartbeat: Duration::from_millis(heartbeat_ms),
        heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
    }
}

pub async fn start_server(heartbeat_ms: u64, heartbeat_timeout_ms: u64) -> (Arc<Server>, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    let config = ServerConfig {
        network: NetworkConfig { address: addr.to_string() },
        concurrency: ConcurrencyConfig { num_of_threads: 2, num_of_channels: 8, queue_capacity: 64 },
        timeouts: timeouts(heartbeat_ms, heartbeat_timeout_ms),
        limits: LimitsConfig { transport_limit: 1 << 20, max_call_depth: 8 },
        max_node_depth: 8,
        debug: true,
    };

    let server = Server::new(config, demo_registry());
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    // Give the accept loop a moment to start selecting.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (server, addr.to_string())
}

pub fn client_config(address: &str, heartbeat_ms: u64, heartbeat_timeout_ms: u64) -> ClientConfig {
    ClientConfig {
        network: NetworkConfig { address: address.to_string() },
        buffers: BufferConfig { read_buffer_size: 4096, write_buffer_size: 4096 },
        timeouts: timeouts(heartbeat_ms, heartbeat_timeout_ms),
        limits: LimitsConfig { transport_limit: 1 << 20, max_call_depth: 8 },
        debug: true,
    }
}
