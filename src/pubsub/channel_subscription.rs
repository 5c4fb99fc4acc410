use std::{collections::HashMap, fmt, sync::Arc};

use bytes::Bytes;
use busmux_error::{MuxError, MuxResult, StackError, SubscriptionKind};
use parking_lot::Mutex;
use tracing::debug;

use super::{CallbackBox, EntryHandle, KeyKind, Registry};

/// Подписка на набор точных каналов с одним набором callback'ов.
///
/// Создаётся через [`Multiplexer::new_channel_subscription`]. Живёт до
/// явного вызова [`close`](Self::close): сброс значения не отписывает
/// каналы.
///
/// [`Multiplexer::new_channel_subscription`]: crate::Multiplexer::new_channel_subscription
pub struct ChannelSubscription {
    registry: Arc<Registry>,
    callback: Arc<CallbackBox>,
    inner: Mutex<ChannelState>,
}

struct ChannelState {
    channels: HashMap<Bytes, EntryHandle>,
    closed: bool,
}

impl ChannelSubscription {
    pub(crate) fn open(
        registry: Arc<Registry>,
        callback: Arc<CallbackBox>,
    ) -> MuxResult<Self> {
        registry.register(Arc::clone(&callback))?;
        debug!(subscription = callback.id(), "channel subscription opened");
        Ok(Self {
            registry,
            callback,
            inner: Mutex::new(ChannelState {
                channels: HashMap::new(),
                closed: false,
            }),
        })
    }

    /// Добавляет канал. Повторное добавление того же канала ничего не делает.
    pub fn add(
        &self,
        channel: impl AsRef<[u8]>,
    ) -> MuxResult<()> {
        let key = Bytes::copy_from_slice(channel.as_ref());
        let mut inner = self.inner.lock();
        ensure_open(inner.closed)?;
        if inner.channels.contains_key(&key) {
            return Ok(());
        }

        let handle = self
            .registry
            .add(KeyKind::Channel, key.clone(), Arc::clone(&self.callback))?;
        inner.channels.insert(key, handle);
        Ok(())
    }

    /// Удаляет канал. Отсутствующий канал игнорируется.
    pub fn remove(
        &self,
        channel: impl AsRef<[u8]>,
    ) -> MuxResult<()> {
        let mut inner = self.inner.lock();
        ensure_open(inner.closed)?;
        match inner.channels.remove_entry(channel.as_ref()) {
            Some((key, handle)) => self.registry.remove(KeyKind::Channel, &key, handle),
            None => Ok(()),
        }
    }

    /// Удаляет все каналы, оставляя подписку пригодной к использованию.
    pub fn clear(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock();
        ensure_open(inner.closed)?;
        self.release(&mut inner)
    }

    /// Удаляет все каналы и закрывает подписку. Повторный вызов, как и любой
    /// другой вызов после закрытия, возвращает ошибку.
    pub fn close(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock();
        ensure_open(inner.closed)?;
        inner.closed = true;
        let released = self.release(&mut inner);
        self.registry.unregister(self.callback.id());
        debug!(subscription = self.callback.id(), "channel subscription closed");
        released
    }

    /// Снимок каналов подписки в отсортированном виде.
    pub fn channels(&self) -> Vec<Bytes> {
        let mut channels: Vec<Bytes> = self.inner.lock().channels.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Снимает все каналы с реестра. Продолжает после ошибки и возвращает
    /// первую из них.
    fn release(
        &self,
        inner: &mut ChannelState,
    ) -> MuxResult<()> {
        let mut first_error: Option<StackError> = None;
        for (key, handle) in inner.channels.drain() {
            if let Err(err) = self.registry.remove(KeyKind::Channel, &key, handle) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ChannelSubscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ChannelSubscription")
            .field("id", &self.callback.id())
            .field("channels", &inner.channels.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

fn ensure_open(closed: bool) -> MuxResult<()> {
    if closed {
        return Err(MuxError::SubscriptionClosed {
            kind: SubscriptionKind::Channel,
        }
        .into());
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use busmux_error::StatusCode;

    use super::*;
    use crate::pubsub::Callbacks;

    fn open() -> (Arc<Registry>, ChannelSubscription) {
        let (registry, _rx) = Registry::new();
        let id = registry.next_subscription_id();
        let callback = CallbackBox::spawn(id, Callbacks::new(|_, _| Ok(())));
        let sub = ChannelSubscription::open(Arc::clone(&registry), callback).unwrap();
        (registry, sub)
    }

    /// Тест проверяет идемпотентность add/remove.
    #[tokio::test]
    async fn test_add_remove_are_idempotent() {
        let (registry, sub) = open();

        sub.add("a").unwrap();
        sub.add("a").unwrap();
        sub.add(b"b").unwrap();
        assert_eq!(registry.receivers(KeyKind::Channel, b"a"), 1);
        assert_eq!(sub.channels(), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        sub.remove("a").unwrap();
        sub.remove("a").unwrap();
        sub.remove("missing").unwrap();
        assert_eq!(registry.receivers(KeyKind::Channel, b"a"), 0);
        assert_eq!(registry.keys(KeyKind::Channel), vec![Bytes::from_static(b"b")]);
    }

    /// Тест проверяет, что после close любой вызов, включая второй close,
    /// возвращает ошибку закрытой подписки.
    #[tokio::test]
    async fn test_close_is_terminal() {
        let (registry, sub) = open();
        sub.add("a").unwrap();

        sub.close().unwrap();
        assert!(sub.is_closed());
        assert!(registry.keys(KeyKind::Channel).is_empty());

        for err in [
            sub.close().unwrap_err(),
            sub.add("b").unwrap_err(),
            sub.remove("a").unwrap_err(),
            sub.clear().unwrap_err(),
        ] {
            assert_eq!(err.status_code(), StatusCode::SubscriptionClosed);
            assert_eq!(err.to_string(), "tried to use a closed ChannelSubscription");
        }
    }

    #[tokio::test]
    async fn test_clear_keeps_subscription_usable() {
        let (registry, sub) = open();
        sub.add("a").unwrap();
        sub.add("b").unwrap();

        sub.clear().unwrap();
        assert!(sub.channels().is_empty());
        assert!(registry.keys(KeyKind::Channel).is_empty());

        sub.add("c").unwrap();
        assert_eq!(registry.keys(KeyKind::Channel), vec![Bytes::from_static(b"c")]);
    }

    /// Тест проверяет, что закрытие подписки после закрытия мультиплексора
    /// помечает подписку закрытой и сообщает о закрытом мультиплексоре.
    #[tokio::test]
    async fn test_close_after_multiplexer_closed() {
        let (registry, sub) = open();
        sub.add("a").unwrap();
        registry.close().unwrap();

        let err = sub.add("b").unwrap_err();
        assert!(err.is(StatusCode::MultiplexerClosed));
        let err = sub.close().unwrap_err();
        assert!(err.is(StatusCode::MultiplexerClosed));
        assert!(sub.is_closed());
    }
}
