//! Connects to the endpoint in `WS_URL` and logs assignment updates.
//!
//! Shows the raw and typed subscription surfaces side by side, then follows connection
//! state changes until interrupted or until the server closes the connection for good.
//!
//! ```sh
//! WS_URL=wss://portal.example.com/ws RUST_LOG=info cargo run --example subscribe
//! ```

use std::time::Duration;

use futures::StreamExt as _;
use realtime_transport::channels::AssignmentUpdate;
use realtime_transport::{Config, ConnectionState, TransportContext};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let context = TransportContext::new(Config::from_env()?);
    context.activate()?;
    info!(state = %context.connection_state(), "activated");

    let handle = context.handle()?;

    let raw = handle.subscribe("assignment:update", |payload| {
        info!(channel = "assignment:update", %payload, "raw payload");
    });

    let mut updates = Box::pin(handle.stream::<AssignmentUpdate>());
    let mut states = context.state_receiver()?;

    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(Ok(update)) => {
                    let status = update.status.as_ref().map(ToString::to_string).unwrap_or_default();
                    info!(id = update.id, %status, "assignment updated");
                }
                Some(Err(e)) => warn!(error = %e, "update stream failed"),
                None => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                info!(%state, "connection state changed");
                if let ConnectionState::Closed { cause } = state {
                    warn!(%cause, "connection closed for good");
                    break;
                }
            }
        }
    }

    raw.release();
    if timeout(Duration::from_secs(5), context.shutdown()).await.is_err() {
        warn!("shutdown timed out");
    }

    Ok(())
}
