use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use deployments::Deployments;
use std::{
    path::Path,
    sync::OnceLock,
};
use team_lottery::{
    config::ClientConfig,
    wallets,
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

mod client;
mod ui;

const LOG_FILE: &str = "team-lottery.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn print_usage_and_exit() -> ! {
    println!(
        "Usage: team-lottery [--network <name|chain-id>] [--rpc-url <url>]\n\
         [--config <path>] [--deployments <path>]\n\
         [--wallet <name>] [--keystore-dir <path>]\n\
         \n\
         Flags:\n\
           --network <name|id>   Network to connect to (default localhost; built in: localhost, sepolia, mainnet)\n\
           --rpc-url <url>       Try this RPC endpoint before the configured ones\n\
           --config <path>       JSON client config (networks, endpoints, retryCount, timeout, ...)\n\
           --deployments <path>  Deployment metadata file (default {})\n\
           --wallet <name>       Keystore to unlock for signing\n\
           --keystore-dir <path> Keystore directory (default {})",
        deployments::DEFAULT_DEPLOYMENTS_FILE,
        team_lottery::config::DEFAULT_KEYSTORE_DIR,
    );
    std::process::exit(0);
}

fn parse_cli_args() -> Result<client::AppConfig> {
    let mut args = std::env::args().skip(1);
    let mut network: Option<String> = None;
    let mut rpc_url: Option<String> = None;
    let mut config_path: Option<String> = None;
    let mut deployments_path: Option<String> = None;
    let mut wallet_name: Option<String> = None;
    let mut keystore_dir: Option<String> = None;

    fn set_once(slot: &mut Option<String>, flag: &str, value: Option<String>) -> Result<()> {
        let value = value.ok_or_else(|| eyre!("{flag} requires an argument"))?;
        if slot.is_some() {
            return Err(eyre!("{flag} may only be specified once"));
        }
        *slot = Some(value);
        Ok(())
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => set_once(&mut network, "--network", args.next())?,
            "--rpc-url" => set_once(&mut rpc_url, "--rpc-url", args.next())?,
            "--config" => set_once(&mut config_path, "--config", args.next())?,
            "--deployments" => {
                set_once(&mut deployments_path, "--deployments", args.next())?
            }
            "--wallet" => set_once(&mut wallet_name, "--wallet", args.next())?,
            "--keystore-dir" => {
                set_once(&mut keystore_dir, "--keystore-dir", args.next())?
            }
            "--help" | "-h" => print_usage_and_exit(),
            other => return Err(eyre!("Unknown argument: {other}")),
        }
    }

    let mut config = ClientConfig::load(config_path.as_deref())?;
    if let Some(path) = deployments_path {
        config.deployments = path;
    }
    if let Some(dir) = keystore_dir {
        config.keystore_dir = dir;
    }
    let selector = network.unwrap_or_else(|| "localhost".to_string());
    if let Some(url) = rpc_url {
        config.prepend_endpoint(&selector, url)?;
    }
    let network = config.network_index(&selector)?;

    let deployments_file = config.deployments_path();
    let deployments = Deployments::load(&deployments_file).map_err(|e| {
        eyre!("Failed to load deployments from {}: {e}", deployments_file.display())
    })?;

    let wallet = wallet_name
        .ok_or_else(|| eyre!("Specify --wallet <name> to select a keystore"))?;
    let wallet = wallets::find_wallet(&config.keystore_dir(), &wallet)?;

    Ok(client::AppConfig {
        config,
        network,
        deployments,
        wallet,
    })
}

fn init_tracing(log_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(rolling::daily(log_dir, LOG_FILE));
    let _ = LOG_GUARD.set(guard);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| eyre!("Failed to install tracing subscriber: {e}"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let app_config = parse_cli_args()?;
    init_tracing(&app_config.config.log_dir())?;
    tracing::info!("starting team-lottery client");
    client::run_app(app_config).await
}
