//! The Quagga node daemon: wires the state store, the validation engine
//! and the framed transport together, and owns the process lifecycle
//! (startup, reload-config, orderly shutdown).

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::eyre::{eyre, Result, WrapErr};
use gumdrop::Options;
use tracing::{debug, info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use quagga_chain::parameters::ChainParams;
use quagga_consensus::{
    mempool::Mempool, EngineSettings, Event, Notifier, ValidationEngine,
};
use quagga_consensus::engine::EngineHandles;
use quagga_network::NetworkManager;
use quagga_state::{Store, UnspentOutputs};

use config::QuaggadConfig;

#[derive(Debug, Options)]
struct Args {
    #[options(help = "print this help message and exit")]
    help: bool,

    #[options(help = "print the version and exit")]
    version: bool,

    #[options(help = "path to the configuration file", meta = "FILE")]
    conf: Option<PathBuf>,

    #[options(help = "the data directory", meta = "DIR")]
    datadir: Option<PathBuf>,

    #[options(help = "listen address for the framed transport", meta = "HOST:PORT")]
    bind: Option<String>,

    #[options(help = "run detached, under the control of a service manager")]
    daemon: bool,

    #[options(free)]
    free: Vec<String>,
}

fn main() {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match Args::parse_args_default(&raw) {
        Ok(args) => args,
        Err(error) => {
            eprintln!("quaggad: {}", error);
            std::process::exit(1);
        }
    };
    if args.help {
        println!("quaggad {}\n", env!("CARGO_PKG_VERSION"));
        println!("{}", Args::usage());
        return;
    }
    if args.version {
        println!("quaggad {}", env!("CARGO_PKG_VERSION"));
        return;
    }
    if !args.free.is_empty() {
        eprintln!("quaggad: unexpected argument {:?}", args.free[0]);
        std::process::exit(1);
    }

    if let Err(report) = run(args) {
        eprintln!("{:?}", report);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let datadir = args
        .datadir
        .clone()
        .or_else(|| dirs::data_dir().map(|dir| dir.join("quagga")))
        .ok_or_else(|| eyre!("no data directory available; pass --datadir"))?;
    let conf_path = args
        .conf
        .clone()
        .unwrap_or_else(|| QuaggadConfig::default_path(&datadir));

    let mut config = QuaggadConfig::load(&conf_path)?;
    if args.datadir.is_some() {
        config.state.cache_dir = datadir;
    }
    if let Some(bind) = &args.bind {
        config.bind = Some(
            bind.parse()
                .wrap_err_with(|| eyre!("invalid --bind address {:?}", bind))?,
        );
    }

    init_tracing(&config)?;
    if args.daemon {
        // Process supervision belongs to the init system; nothing to fork.
        info!("daemon mode requested; continuing under the service manager");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("building the tokio runtime")?;
    runtime.block_on(serve(config, conf_path))
}

fn init_tracing(config: &QuaggadConfig) -> Result<()> {
    let filter = config
        .tracing_filter
        .clone()
        .unwrap_or_else(|| "info".to_string());
    let filter_layer = EnvFilter::try_new(filter).wrap_err("invalid tracing filter")?;
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .with(ErrorLayer::default())
        .init();
    color_eyre::install()?;
    Ok(())
}

async fn serve(config: QuaggadConfig, conf_path: PathBuf) -> Result<()> {
    info!(network = %config.network, "starting quaggad");

    let params = ChainParams::new(config.network);
    let store = Arc::new(
        Store::open(&config.state, config.network)
            .map_err(|error| eyre!("opening the state store: {}", error))?,
    );
    let utxo = Arc::new(UnspentOutputs::new(store.clone()));
    let mempool = Arc::new(Mempool::new());
    let notifier = Notifier::default();
    let manager = NetworkManager::new(config.transport.clone());

    let mut handles = EngineHandles::new(utxo, store, mempool, notifier.clone());
    let punish_manager = manager.clone();
    handles.punisher = Some(Arc::new(move |peer, score| {
        punish_manager.punish_node(peer, score)
    }));

    let engine = ValidationEngine::spawn(params, EngineSettings::default(), handles);

    if let Some(bind) = config.bind {
        manager
            .listen(bind)
            .await
            .map_err(|error| eyre!("binding the transport listener: {}", error))?;
    }

    // Relay signals from the engine; actual peer announcement is handled by
    // the p2p collaborator.
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Event::RelayBlock(hash) = event {
                debug!(%hash, "block ready for relay");
            }
        }
    });

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .wrap_err("installing the SIGHUP handler")?;
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .wrap_err("installing the SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => match QuaggadConfig::load(&conf_path) {
                Ok(new_config) => {
                    engine.reload_params(ChainParams::new(new_config.network));
                    info!("configuration reloaded");
                }
                Err(error) => warn!(%error, "reload-config failed; keeping the old configuration"),
            },
        }
    }

    info!("shutting down");
    engine.shutdown();
    manager.shutdown();
    Ok(())
}
