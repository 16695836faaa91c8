// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reference client binary: connects, calls a couple of demo replies, and
//! prints their results.

use anyhow::{Context, Result};
use clap::Parser;
use duplex_rpc::cfg::{cli::resolve_config_path, config::ClientConfig, logger::init_logger};
use duplex_rpc::client::Client;
use duplex_rpc::codec::Value;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "duplex-rpc reference client")]
struct Args {
    #[arg(long, default_value = "config.client.yaml")]
    config: String,

    #[arg(long, default_value = "config.logger.yaml")]
    log_config: String,

    #[arg(long)]
    resume_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logger(&args.log_config).context("failed to init logger")?;

    let config_path = resolve_config_path(&args.config).context("failed to resolve config path")?;
    let config = ClientConfig::load_from_file(&config_path).context("failed to load client config")?;

    let client = Client::connect(config, args.resume_token).await.context("failed to connect")?;
    info!(token = ?client.session_token().await, "connected");

    let echoed = client.call("#.echo:Say", &[Value::String("hello".to_string())]).await?;
    info!(?echoed, "echo result");

    let sum = client.call("#.math:Add", &[Value::Int64(2), Value::Int64(40)]).await?;
    info!(?sum, "add result");

    client.close();
    Ok(())
}
