use anyhow::Result;
use clap::Parser;
use clawrouter::cli::Args;
use clawrouter::config::ProxyConfig;
use clawrouter::server;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if args.version {
        println!("clawrouter {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if let Err(e) = run(args).await {
        eprintln!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = ProxyConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let proxy = server::start(config).await?;

    shutdown_signal().await;
    eprintln!("[proxy] shutting down");
    proxy.close().await;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
