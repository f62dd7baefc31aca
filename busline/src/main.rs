use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cli;
#[cfg(feature = "hid")]
mod hid_transport;
mod ws_transport;

use cli::Cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let (dispatcher, handles) = busline_core::dispatcher::channel(
        busline_core::dispatcher::DEFAULT_ADMISSION_CAPACITY,
    );
    let dispatcher_task = tokio::spawn(dispatcher.run());

    let ws_handles = handles.clone();
    let bind_addr = format!("0.0.0.0:{}", cli.port);
    let ws_task = tokio::spawn(async move {
        if let Err(err) = ws_transport::serve(&bind_addr, ws_handles).await {
            tracing::error!(%err, "websocket transport exited");
        }
    });

    #[cfg(feature = "hid")]
    let hid_task = if !cli.no_hid {
        let hid_handles = handles.clone();
        Some(tokio::spawn(async move {
            hid_transport::run(hid_handles).await;
        }))
    } else {
        info!("HID transport disabled (--no-hid)");
        None
    };

    info!(port = cli.port, "busline listening");

    tokio::select! {
        _ = shutdown_signal() => { info!("received shutdown signal"); }
        _ = ws_task => { info!("websocket transport task ended"); }
        _ = dispatcher_task => { info!("dispatcher ended"); }
    }

    #[cfg(feature = "hid")]
    if let Some(task) = hid_task {
        task.abort();
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
