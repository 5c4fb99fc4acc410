#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use busmux::{Callbacks, StatusCode};
use tokio::sync::mpsc;

/// Событие, записанное callback'ами подписки.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Message(Bytes, Bytes),
    Disconnect(StatusCode),
    Activation(Bytes),
}

impl Event {
    pub fn message(
        channel: &'static str,
        payload: &'static str,
    ) -> Self {
        Self::Message(
            Bytes::from_static(channel.as_bytes()),
            Bytes::from_static(payload.as_bytes()),
        )
    }

    pub fn activation(key: &'static str) -> Self {
        Self::Activation(Bytes::from_static(key.as_bytes()))
    }
}

/// Набор callback'ов, пишущих все события в канал.
pub fn recorder() -> (Callbacks, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_message = tx.clone();
    let on_disconnect = tx.clone();
    let callbacks = Callbacks::new(move |channel, payload| {
        let _ = on_message.send(Event::Message(channel, payload));
        Ok(())
    })
    .on_disconnect(move |cause| {
        let _ = on_disconnect.send(Event::Disconnect(cause.status_code()));
        Ok(())
    })
    .on_activation(move |key| {
        let _ = tx.send(Event::Activation(key));
        Ok(())
    });
    (callbacks, rx)
}

/// Следующее событие, пропуская уведомления об активации.
pub async fn next_delivery(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    loop {
        match next_event(rx).await {
            Event::Activation(_) => continue,
            event => return event,
        }
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no event within 10s")
        .expect("recorder dropped")
}

/// Ждёт выполнения условия, опрашивая его раз в миллисекунду.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition was not reached");
}

pub fn keys(names: &[&'static str]) -> Vec<Bytes> {
    names
        .iter()
        .map(|name| Bytes::from_static(name.as_bytes()))
        .collect()
}
