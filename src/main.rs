use std::{path::PathBuf, sync::Arc};

use clap::Parser;

use paxos_bank::{
    common::{config::Config, logging},
    consensus::{admission::AdmissionRule, message::NodeId, store::FileLogStore},
    network,
};

#[derive(Parser)]
#[command(name = "paxos-bank")]
#[command(about = "Replicated banking ledger node", long_about = None)]
struct Cli {
    /// Node id (1, 2 or 3)
    #[arg(short, long)]
    id: NodeId,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the local log mirror
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Admission rule (literal, corrected)
    #[arg(long)]
    admission: Option<AdmissionRule>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.node_id = cli.id;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(rule) = cli.admission {
        config.admission = rule;
    }

    let store = FileLogStore::new(&config.data_dir)?;
    network::run(config, Arc::new(store)).await?;
    Ok(())
}
