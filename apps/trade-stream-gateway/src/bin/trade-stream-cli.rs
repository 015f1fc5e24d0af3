//! Trade Stream CLI
//!
//! Connects to a running gateway, subscribes to trades and prints every
//! update as a JSON line on stdout until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin trade-stream-cli -- BTC-USD ETH-USD
//! ```
//!
//! # Environment Variables
//!
//! - `GATEWAY_URL`: gateway WebSocket URL (default: <ws://localhost:8080/ws>)
//! - `RPC_TIMEOUT_MS`: per-call timeout (default: 30000)
//! - `BACKOFF_*`: reconnect backoff, same keys as the gateway

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use trade_stream_gateway::infrastructure::telemetry::init_with_config;
use trade_stream_gateway::{
    ClientConfig, ConnectionState, Instrument, RpcEngine, TelemetryConfig, TradeStreamClient,
    WebSocketTransport, WsRpcConnection,
};

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let _ = dotenvy::dotenv();
    let _telemetry_guard = init_with_config(TelemetryConfig::for_cli());

    let instruments = parse_instruments(std::env::args().skip(1))?;
    let config = ClientConfig::from_env();

    let connection = WsRpcConnection::new(
        config.gateway_url.clone(),
        Arc::new(WebSocketTransport),
        config.backoff.build()?,
    );
    let client = TradeStreamClient::new(RpcEngine::new(Arc::new(connection), config.rpc_timeout));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    eprintln!("Connecting to {}", config.gateway_url);
    client
        .connect(&cancel)
        .await
        .with_context(|| format!("failed to connect to {}", config.gateway_url))?;

    let mut trades = client.trade_updates();
    let mut lost = client.connection_lost();
    let mut restored = client.connection_restored();
    let mut state = client.connection_state();

    for instrument in &instruments {
        let ack = client
            .subscribe(*instrument)
            .await
            .with_context(|| format!("failed to subscribe to {instrument}"))?;
        eprintln!("Subscribed to {} {}", ack.channel, ack.instrument);
    }

    let mut was_reconnecting = false;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            Some(trade) = trades.next() => {
                println!("{}", serde_json::to_string(&trade)?);
            }
            Some(reason) = lost.next() => {
                eprintln!("Upstream connection lost: {reason}");
            }
            Some(()) = restored.next() => {
                // The gateway kept our subscriptions.
                eprintln!("Upstream connection restored");
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Reconnecting => {
                        was_reconnecting = true;
                        eprintln!("Gateway connection lost, reconnecting");
                    }
                    ConnectionState::Connected if was_reconnecting => {
                        was_reconnecting = false;
                        if let Err(e) = client.resubscribe_all().await {
                            eprintln!("Resubscribe failed: {e}");
                        } else {
                            eprintln!("Reconnected, subscriptions restored");
                        }
                    }
                    ConnectionState::Disconnected => break,
                    _ => {}
                }
            }
        }
    }

    for instrument in client.subscriptions() {
        if let Err(e) = client.unsubscribe(instrument).await {
            tracing::debug!(instrument = %instrument, error = %e, "Unsubscribe on exit failed");
        }
    }
    if let Err(e) = client.disconnect().await {
        tracing::debug!(error = %e, "Disconnect failed");
    }
    client.dispose().await;

    Ok(())
}

fn parse_instruments(args: impl Iterator<Item = String>) -> anyhow::Result<Vec<Instrument>> {
    let mut instruments = Vec::new();
    for arg in args {
        let instrument = Instrument::from_str(&arg)?;
        if !instruments.contains(&instrument) {
            instruments.push(instrument);
        }
    }
    if instruments.is_empty() {
        instruments.push(Instrument::BtcUsd);
    }
    Ok(instruments)
}
