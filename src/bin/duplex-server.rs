// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference server binary: loads a `ServerConfig`, mounts a small demo
//! service tree and serves it until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use duplex_rpc::cfg::{cli::resolve_config_path, config::ServerConfig, logger::init_logger};
use duplex_rpc::codec::Value;
use duplex_rpc::registry::{RegistryBuilder, ServiceBuilder};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "duplex-rpc reference server")]
struct Args {
    #[arg(long, default_value = "config.server.yaml")]
    config: String,

    #[arg(long, default_value = "config.logger.yaml")]
    log_config: String,
}

fn build_registry() -> duplex_rpc::registry::Registry {
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
        .mount(
            ServiceBuilder::new("math").reply(
                "Add",
                "II",
                Arc::new(|rt, args| {
                    let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                    let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                    rt.ok(a + b)
                }),
            ),
        )
        .build()
        .expect("demo registry must mount cleanly")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logger(&args.log_config).context("failed to init logger")?;

    let config_path = resolve_config_path(&args.config).context("failed to resolve config path")?;
    let config = ServerConfig::load_from_file(&config_path).context("failed to load server config")?;

    let registry = build_registry();
    info!(replies = registry.len(), "mounted service registry");

    let server = duplex_rpc::server::Server::new(config, registry);
    let handle = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            handle.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
