//! Несколько подписок на один канал поверх одного соединения.
//!
//! ```sh
//! cargo run --example channel
//! ```

use std::time::Duration;

use busmux::{init_logging, Callbacks, LoggingConfig, MemoryBus, Multiplexer};
use tokio::sync::mpsc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logging = init_logging(LoggingConfig::default())?;

    let bus = MemoryBus::new();
    let mux = Multiplexer::new(bus.connector());
    mux.wait_connected().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut subscriptions = Vec::new();
    for consumer in ["billing", "audit"] {
        let tx = tx.clone();
        let callbacks = Callbacks::new(move |channel, payload| {
            tx.send((consumer, channel, payload))?;
            Ok(())
        })
        .on_activation(move |channel| {
            info!(consumer, channel = %String::from_utf8_lossy(&channel), "subscribed");
            Ok(())
        });
        let sub = mux.new_channel_subscription(callbacks)?;
        sub.add("orders")?;
        subscriptions.push(sub);
    }
    drop(tx);

    while mux.active_channels().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    info!(
        subscribe_commands = bus.command_count("SUBSCRIBE", "orders"),
        "two consumers share one SUBSCRIBE"
    );

    let delivered = bus.publish("orders", "order #1 created");
    info!(delivered, "published");

    for _ in 0..subscriptions.len() {
        if let Some((consumer, channel, payload)) = rx.recv().await {
            info!(
                consumer,
                channel = %String::from_utf8_lossy(&channel),
                payload = %String::from_utf8_lossy(&payload),
                "received"
            );
        }
    }

    for sub in &subscriptions {
        sub.close()?;
    }
    mux.close()?;
    mux.wait_closed().await;
    info!(
        unsubscribe_commands = bus.command_count("UNSUBSCRIBE", "orders"),
        "closed"
    );
    Ok(())
}
