use std::sync::Arc;

use clap::Parser;
use palclip_backend::{AppState, MemoryClipboard, SystemClipboard, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "palclip-backend")]
struct BackendArgs {
    #[arg(long, default_value = "127.0.0.1:9292")]
    bind_address: String,

    /// Place copied items on the OS clipboard instead of keeping them in memory.
    #[arg(long, default_value_t = false)]
    system_clipboard: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = BackendArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let state = if args.system_clipboard {
        AppState::new(Arc::new(SystemClipboard))
    } else {
        AppState::new(Arc::new(MemoryClipboard::default()))
    };

    info!(
        system_clipboard = args.system_clipboard,
        "backend starting on {}", args.bind_address
    );
    if let Err(err) = serve(listener, state).await {
        warn!("backend exited: {}", err);
    }
}
