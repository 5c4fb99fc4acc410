//! Запрос/ответ через одиночные ожидания на каналах с общим префиксом.
//!
//! ```sh
//! cargo run --example promise
//! ```

use std::time::Duration;

use busmux::{init_logging, LoggingConfig, MemoryBus, Multiplexer, StatusCode};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logging = init_logging(LoggingConfig::default())?;

    let bus = MemoryBus::new();
    let mux = Multiplexer::new(bus.connector());
    let replies = mux.new_promise_subscription("reply-")?;

    let request_id = 42;
    let reply = replies
        .wait_for_new_promise(request_id.to_string(), Duration::from_secs(5))
        .await?;

    // "Сервер" отвечает в канал reply-<id>.
    let responder = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        responder.publish(format!("reply-{request_id}"), "pong");
    });
    let payload = reply.await?;
    info!(request_id, reply = %String::from_utf8_lossy(&payload), "request answered");

    let unanswered = replies.new_promise("43", Duration::from_millis(100))?;
    match unanswered.await {
        Err(err) if err.is(StatusCode::Timeout) => info!(error = %err, "no reply"),
        other => info!(?other, "unexpected outcome"),
    }

    replies.close()?;
    mux.close()?;
    mux.wait_closed().await;
    Ok(())
}
