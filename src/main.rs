use tsun_proxy::prelude::*;

#[tokio::main]
async fn main() {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        if let Err(e) = shutdown_tx.send(()) {
            error!("Failed to send shutdown signal: {}", e);
        }
    });

    if let Err(e) = tsun_proxy::app(shutdown_rx).await {
        error!("{:#}", e);
        std::process::exit(255);
    }
}
