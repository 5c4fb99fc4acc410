use std::{fmt, sync::Arc};

use bytes::Bytes;
use busmux_error::{MuxError, MuxResult, SubscriptionKind};
use parking_lot::Mutex;
use tracing::debug;

use super::{CallbackBox, EntryHandle, KeyKind, Registry};

/// Подписка на один glob-шаблон.
///
/// Регистрируется сразу при создании: PSUBSCRIBE уходит в шину или
/// ставится в очередь до ближайшего подключения.
pub struct PatternSubscription {
    registry: Arc<Registry>,
    callback: Arc<CallbackBox>,
    pattern: Bytes,
    /// `None` после закрытия
    handle: Mutex<Option<EntryHandle>>,
}

impl PatternSubscription {
    pub(crate) fn open(
        registry: Arc<Registry>,
        callback: Arc<CallbackBox>,
        pattern: Bytes,
    ) -> MuxResult<Self> {
        registry.register(Arc::clone(&callback))?;
        let handle = match registry.add(KeyKind::Pattern, pattern.clone(), Arc::clone(&callback)) {
            Ok(handle) => handle,
            Err(err) => {
                registry.unregister(callback.id());
                return Err(err);
            }
        };
        debug!(
            subscription = callback.id(),
            pattern = %String::from_utf8_lossy(&pattern),
            "pattern subscription opened"
        );

        Ok(Self {
            registry,
            callback,
            pattern,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn pattern(&self) -> &Bytes {
        &self.pattern
    }

    pub fn is_closed(&self) -> bool {
        self.handle.lock().is_none()
    }

    /// Снимает шаблон с реестра и закрывает подписку. Повторный вызов
    /// возвращает ошибку.
    pub fn close(&self) -> MuxResult<()> {
        let handle = self.handle.lock().take().ok_or(MuxError::SubscriptionClosed {
            kind: SubscriptionKind::Pattern,
        })?;
        self.registry.unregister(self.callback.id());
        debug!(subscription = self.callback.id(), "pattern subscription closed");
        self.registry.remove(KeyKind::Pattern, &self.pattern, handle)
    }
}

impl fmt::Debug for PatternSubscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PatternSubscription")
            .field("id", &self.callback.id())
            .field("pattern", &String::from_utf8_lossy(&self.pattern))
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use busmux_error::StatusCode;

    use super::*;
    use crate::pubsub::Callbacks;

    fn open(
        registry: &Arc<Registry>,
        pattern: &'static str,
    ) -> MuxResult<PatternSubscription> {
        let callback = CallbackBox::spawn(
            registry.next_subscription_id(),
            Callbacks::new(|_, _| Ok(())),
        );
        PatternSubscription::open(
            Arc::clone(registry),
            callback,
            Bytes::from_static(pattern.as_bytes()),
        )
    }

    /// Тест проверяет, что два владельца одного шаблона делят ключ реестра.
    #[tokio::test]
    async fn test_shared_pattern_key() {
        let (registry, _rx) = Registry::new();
        let first = open(&registry, "news.*").unwrap();
        let second = open(&registry, "news.*").unwrap();
        assert_eq!(registry.receivers(KeyKind::Pattern, b"news.*"), 2);

        first.close().unwrap();
        assert_eq!(registry.receivers(KeyKind::Pattern, b"news.*"), 1);
        second.close().unwrap();
        assert!(registry.keys(KeyKind::Pattern).is_empty());
    }

    #[tokio::test]
    async fn test_second_close_fails() {
        let (registry, _rx) = Registry::new();
        let sub = open(&registry, "a*").unwrap();
        assert_eq!(sub.pattern(), &Bytes::from_static(b"a*"));

        sub.close().unwrap();
        assert!(sub.is_closed());
        let err = sub.close().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SubscriptionClosed);
        assert_eq!(err.to_string(), "tried to use a closed PatternSubscription");
    }

    /// Тест проверяет, что на закрытом мультиплексоре подписку создать нельзя.
    #[tokio::test]
    async fn test_open_on_closed_registry() {
        let (registry, _rx) = Registry::new();
        registry.close().unwrap();
        let err = open(&registry, "a*").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::MultiplexerClosed);
    }
}
