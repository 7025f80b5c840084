//! Stoa node: a single process hosting the chain engine on an in-memory bus

use anyhow::Result;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use std::sync::Arc;
use stoa_common::messages::Message;
use stoa_module_chain_engine::ChainEngine;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["node.toml".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    let fmt_layer = fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fjall=warn")),
    );
    Registry::default().with(fmt_layer).init();

    info!("Stoa node process");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("STOA")).build()?);

    let mut process = Process::<Message>::create(config).await;

    ChainEngine::register(&mut process);

    process.run().await?;

    info!("Exiting");

    Ok(())
}
