//! Подписка на шаблон и переживание разрыва соединения.
//!
//! ```sh
//! cargo run --example pattern
//! ```

use std::time::Duration;

use busmux::{init_logging, Callbacks, LoggingConfig, MemoryBus, Multiplexer};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logging = init_logging(LoggingConfig::default())?;

    let bus = MemoryBus::new();
    let mux = Multiplexer::new(bus.connector());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = Callbacks::new_async(move |channel, payload| {
        let tx = tx.clone();
        async move {
            tx.send((channel, payload))?;
            Ok::<(), anyhow::Error>(())
        }
    })
    .on_disconnect(|cause| {
        warn!(error = %cause, "lost the bus, waiting for resubscription");
        Ok(())
    })
    .on_activation(|pattern| {
        info!(pattern = %String::from_utf8_lossy(&pattern), "pattern active");
        Ok(())
    });
    let sensors = mux.new_pattern_subscription("sensor.*", callbacks)?;
    mux.wait_connected().await?;

    while mux.active_patterns().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bus.publish("sensor.kitchen", "21.5");

    bus.disconnect_all();
    mux.wait_connected().await?;
    while mux.active_patterns().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bus.publish("sensor.garage", "12.0");

    for _ in 0..2 {
        if let Some((channel, payload)) = rx.recv().await {
            info!(
                channel = %String::from_utf8_lossy(&channel),
                reading = %String::from_utf8_lossy(&payload),
                "reading"
            );
        }
    }

    sensors.close()?;
    mux.close()?;
    mux.wait_closed().await;
    Ok(())
}
