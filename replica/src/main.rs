mod server;

use clap::Parser;
use replica::config::RuntimeConfig;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "replica", about = "Standalone replicated state member")]
struct Args {
    /// Runtime config file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Member id, overrides the config file
    #[arg(long)]
    member_id: Option<uuid::Uuid>,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let mut config = RuntimeConfig::from_toml(&args.config);
    if args.member_id.is_some() {
        config.member_id = args.member_id;
    }

    let mut server = server::Server::builder(config)?;
    server.start()?;
    shutdown_signal().await;
    server.stop()?;
    Ok(())
}
