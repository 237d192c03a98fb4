// FabricMon - an InfiniBand fabric monitor daemon.
//
// Due to the usual permissions on /dev/infiniband/umad*, this will
// probably need to be executed as root.

use std::path::PathBuf;

use clap::Parser;

use fabricmon::{
    ca, config, daemon,
    error::Error,
    nodenamemap::{NodeNameMap, DEFAULT_NODE_NAME_MAP},
};

#[derive(Parser)]
#[command(name = "fabricmon", about = "InfiniBand fabric monitor daemon", version)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "fabricmon.yml")]
    config: PathBuf,

    /// Run forever, sweeping every poll interval; with false, run a
    /// single sweep and exit
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    daemonize: bool,
}

async fn run(args: &Args) -> Result<(), Error> {
    let conf = config::read_config(&args.config)?;

    env_logger::Builder::from_default_env()
        .filter_level(conf.logging.log_level)
        .init();

    let nnmap = NodeNameMap::new(DEFAULT_NODE_NAME_MAP);
    tokio::spawn(nnmap.clone().watch());

    let hcas = ca::get_cas()?;
    if hcas.is_empty() {
        return Err(Error::NoAdapters);
    }

    daemon::run(&conf, hcas, nnmap, args.daemonize).await
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args).await {
        eprintln!("fabricmon: {}", e);
        std::process::exit(1);
    }
}
