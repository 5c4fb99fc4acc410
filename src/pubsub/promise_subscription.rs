use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::{BufMut, Bytes, BytesMut};
use busmux_error::{MuxError, MuxResult, StackError, SubscriptionKind};
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::{
    promise::Waiter, CallbackBox, Callbacks, DispatchList, EntryHandle, PatternSubscription,
    Promise, Registry,
};

/// Подписка для ожидания одиночных сообщений ("сетевые promise").
///
/// Внутри держит одну [`PatternSubscription`] на `prefix*`, поэтому
/// создание и завершение promise не порождает команд в шину. Перед
/// созданием promise подписка должна стать активной (сервер подтвердил
/// подписку на шаблон), иначе публикация может опередить подписку.
///
/// ```ignore
/// let promises = mux.new_promise_subscription("hello-")?;
/// promises.wait_for_activation().await?;
///
/// let reply = promises.new_promise("world", Duration::from_secs(10))?;
/// // PUBLISH hello-world "success!"
/// assert_eq!(reply.await?, "success!");
/// ```
pub struct PromiseSubscription {
    shared: Arc<PromiseShared>,
    pattern: PatternSubscription,
}

/// Состояние, разделяемое подпиской, её callback'ами и promise.
pub(crate) struct PromiseShared {
    prefix: Bytes,
    state: Mutex<PromiseState>,
    active: watch::Sender<bool>,
}

struct PromiseState {
    /// Канал → ожидания; запись существует, пока есть хотя бы одно ожидание
    channels: HashMap<Bytes, DispatchList<Waiter>>,
    closed: bool,
}

////////////////////////////////////////////////////////////////////////////////
// PromiseSubscription
////////////////////////////////////////////////////////////////////////////////

impl PromiseSubscription {
    pub(crate) fn open(
        registry: Arc<Registry>,
        prefix: Bytes,
    ) -> MuxResult<Self> {
        let (active, _) = watch::channel(false);
        let shared = Arc::new(PromiseShared {
            prefix: prefix.clone(),
            state: Mutex::new(PromiseState {
                channels: HashMap::new(),
                closed: false,
            }),
            active,
        });

        let on_message = Arc::clone(&shared);
        let on_disconnect = Arc::clone(&shared);
        let on_activation = Arc::clone(&shared);
        let callbacks = Callbacks::new(move |channel, payload| {
            on_message.fulfill(channel, payload);
            Ok(())
        })
        .on_disconnect(move |cause| {
            on_disconnect.disconnect(&cause);
            Ok(())
        })
        .on_activation(move |_| {
            on_activation.activate();
            Ok(())
        });

        let mut pattern = BytesMut::with_capacity(prefix.len() + 1);
        pattern.put_slice(&prefix);
        pattern.put_u8(b'*');

        let callback = CallbackBox::spawn(registry.next_subscription_id(), callbacks);
        let pattern = PatternSubscription::open(registry, callback, pattern.freeze())?;
        Ok(Self { shared, pattern })
    }

    /// Создаёт ожидание следующего сообщения на канале `prefix + suffix`.
    ///
    /// Возвращает `InactiveSubscription`, если подписка на шаблон ещё не
    /// подтверждена, и `SubscriptionClosed`, если подписка закрыта.
    pub fn new_promise(
        &self,
        suffix: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> MuxResult<Promise> {
        let channel = self.shared.channel(suffix.as_ref());
        let (tx, rx) = oneshot::channel();

        let mut state = self.shared.state.lock();
        ensure_open(state.closed)?;
        if !*self.shared.active.borrow() {
            return Err(MuxError::InactiveSubscription {
                prefix: String::from_utf8_lossy(&self.shared.prefix).into_owned(),
            }
            .into());
        }

        let handle = state
            .channels
            .entry(channel.clone())
            .or_default()
            .push(tx);
        drop(state);

        Ok(Promise::new(
            Arc::downgrade(&self.shared),
            channel,
            handle,
            rx,
            timeout,
        ))
    }

    /// Ждёт активации подписки. Если подписка закрыта (в том числе во время
    /// ожидания), возвращает `SubscriptionClosed`.
    pub async fn wait_for_activation(&self) -> MuxResult<()> {
        let mut active = self.shared.active.subscribe();
        ensure_open(self.is_closed())?;
        if active.wait_for(|active| *active).await.is_err() {
            return ensure_open(true);
        }
        ensure_open(self.is_closed())
    }

    /// Как [`new_promise`](Self::new_promise), но сначала ждёт активации.
    /// Если активность потеряна между ожиданием и созданием, делает одну
    /// повторную попытку.
    pub async fn wait_for_new_promise(
        &self,
        suffix: impl AsRef<[u8]>,
        timeout: Duration,
    ) -> MuxResult<Promise> {
        let suffix = suffix.as_ref();
        let mut last_error = None;
        for _ in 0..2 {
            self.wait_for_activation().await?;
            match self.new_promise(suffix, timeout) {
                Err(err) if err.is_retryable() => last_error = Some(err),
                outcome => return outcome,
            }
        }
        Err(last_error.unwrap_or_else(|| self.shared.inactive_error()))
    }

    /// Завершает все ожидания ошибкой `SubscriptionClosed`, не закрывая
    /// подписку.
    pub fn clear(&self) -> MuxResult<()> {
        let mut state = self.shared.state.lock();
        ensure_open(state.closed)?;
        fail_all(&mut state, |_| closed_error());
        Ok(())
    }

    /// Завершает все ожидания, закрывает подписку и внутреннюю подписку на
    /// шаблон. Повторный вызов возвращает ошибку.
    pub fn close(&self) -> MuxResult<()> {
        {
            let mut state = self.shared.state.lock();
            ensure_open(state.closed)?;
            state.closed = true;
            fail_all(&mut state, |_| closed_error());
        }
        // Будим ждущих активации: они увидят закрытое состояние.
        self.shared.active.send_replace(true);
        debug!(prefix = ?self.shared.prefix, "promise subscription closed");
        self.pattern.close()
    }

    pub fn prefix(&self) -> &Bytes {
        &self.shared.prefix
    }

    /// Активна ли подписка: шаблон подтверждён и подписка не закрыта.
    pub fn is_active(&self) -> bool {
        !self.is_closed() && *self.shared.active.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Число каналов, на которых есть незавершённые ожидания.
    pub fn pending_channels(&self) -> usize {
        self.shared.state.lock().channels.len()
    }
}

impl fmt::Debug for PromiseSubscription {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PromiseSubscription")
            .field("prefix", &String::from_utf8_lossy(&self.shared.prefix))
            .field("active", &self.is_active())
            .field("pending_channels", &self.pending_channels())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// PromiseShared
////////////////////////////////////////////////////////////////////////////////

impl PromiseShared {
    fn channel(
        &self,
        suffix: &[u8],
    ) -> Bytes {
        let mut channel = BytesMut::with_capacity(self.prefix.len() + suffix.len());
        channel.put_slice(&self.prefix);
        channel.put_slice(suffix);
        channel.freeze()
    }

    /// Разрешает все ожидания канала одним и тем же сообщением.
    fn fulfill(
        &self,
        channel: Bytes,
        payload: Bytes,
    ) {
        let waiters = self.state.lock().channels.remove(&channel);
        if let Some(mut waiters) = waiters {
            for waiter in waiters.drain() {
                let _ = waiter.send(Ok(payload.clone()));
            }
        }
    }

    /// Разрыв соединения прерывает все ожидания: promise обещает
    /// непрерывную доставку.
    fn disconnect(
        &self,
        cause: &StackError,
    ) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        self.active.send_replace(false);
        let reason = cause.to_string();
        fail_all(&mut state, |channel| {
            MuxError::Disconnected {
                channel: String::from_utf8_lossy(channel).into_owned(),
                reason: reason.clone(),
            }
            .into()
        });
    }

    fn activate(&self) {
        self.active.send_replace(true);
    }

    /// Убирает одно ожидание; опустевший канал удаляется.
    pub(crate) fn forget(
        &self,
        channel: &Bytes,
        handle: EntryHandle,
    ) {
        let mut state = self.state.lock();
        if let Some(waiters) = state.channels.get_mut(channel) {
            waiters.remove(handle);
            if waiters.is_empty() {
                state.channels.remove(channel);
            }
        }
    }

    fn inactive_error(&self) -> StackError {
        MuxError::InactiveSubscription {
            prefix: String::from_utf8_lossy(&self.prefix).into_owned(),
        }
        .into()
    }
}

fn fail_all(
    state: &mut PromiseState,
    error: impl Fn(&Bytes) -> StackError,
) {
    for (channel, mut waiters) in state.channels.drain() {
        for waiter in waiters.drain() {
            let _ = waiter.send(Err(error(&channel)));
        }
    }
}

fn closed_error() -> StackError {
    MuxError::SubscriptionClosed {
        kind: SubscriptionKind::Promise,
    }
    .into()
}

fn ensure_open(closed: bool) -> MuxResult<()> {
    if closed {
        return Err(closed_error());
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use busmux_error::{ConnectionError, StatusCode};

    use super::*;
    use crate::{bus::BusMessage, pubsub::KeyKind};

    fn open(prefix: &'static str) -> (Arc<Registry>, PromiseSubscription) {
        let (registry, _rx) = Registry::new();
        let sub =
            PromiseSubscription::open(Arc::clone(&registry), Bytes::from_static(prefix.as_bytes()))
                .unwrap();
        (registry, sub)
    }

    fn confirm(
        registry: &Registry,
        pattern: &'static str,
    ) {
        registry.dispatch(BusMessage::PSubscribe(Bytes::from_static(pattern.as_bytes())));
    }

    fn publish(
        registry: &Registry,
        channel: &'static str,
        payload: &'static str,
    ) {
        registry.dispatch(BusMessage::PMessage {
            pattern: Bytes::from_static(b"hello-*"),
            channel: Bytes::from_static(channel.as_bytes()),
            payload: Bytes::from_static(payload.as_bytes()),
        });
    }

    /// Тест проверяет, что подписка регистрирует шаблон `prefix*`.
    #[tokio::test]
    async fn test_registers_prefix_pattern() {
        let (registry, sub) = open("hello-");
        assert_eq!(
            registry.keys(KeyKind::Pattern),
            vec![Bytes::from_static(b"hello-*")]
        );
        assert_eq!(sub.prefix(), &Bytes::from_static(b"hello-"));
        assert!(!sub.is_active());
    }

    /// Тест проверяет отказ до активации.
    #[tokio::test]
    async fn test_new_promise_before_activation_fails() {
        let (_registry, sub) = open("hello-");
        let err = sub
            .new_promise("world", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InactiveSubscription);
        assert_eq!(sub.pending_channels(), 0);
    }

    /// Тест проверяет, что сообщение разрешает все ожидания канала.
    #[tokio::test]
    async fn test_fulfill_resolves_all_waiters() {
        let (registry, sub) = open("hello-");
        confirm(&registry, "hello-*");
        sub.wait_for_activation().await.unwrap();

        let first = sub.new_promise("world", Duration::from_secs(5)).unwrap();
        let second = sub.new_promise("world", Duration::from_secs(5)).unwrap();
        let other = sub.new_promise("there", Duration::from_secs(5)).unwrap();
        assert_eq!(first.channel(), &Bytes::from_static(b"hello-world"));
        assert_eq!(sub.pending_channels(), 2);

        publish(&registry, "hello-world", "success!");
        assert_eq!(first.await.unwrap(), Bytes::from_static(b"success!"));
        assert_eq!(second.await.unwrap(), Bytes::from_static(b"success!"));
        assert_eq!(sub.pending_channels(), 1);

        other.cancel();
        assert_eq!(sub.pending_channels(), 0);
    }

    /// Тест проверяет таймаут и отсутствие накопления записей после
    /// повторяющихся циклов создания и истечения.
    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_up() {
        let (registry, sub) = open("hello-");
        confirm(&registry, "hello-*");
        sub.wait_for_activation().await.unwrap();

        for _ in 0..50 {
            let promise = sub.new_promise("world", Duration::from_millis(10)).unwrap();
            let err = promise.await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::Timeout);
            assert_eq!(sub.pending_channels(), 0);
        }
    }

    /// Тест проверяет очистку при сбросе promise без ожидания.
    #[tokio::test]
    async fn test_drop_cleans_up() {
        let (registry, sub) = open("hello-");
        confirm(&registry, "hello-*");
        sub.wait_for_activation().await.unwrap();

        let first = sub.new_promise("a", Duration::from_secs(1)).unwrap();
        let second = sub.new_promise("a", Duration::from_secs(1)).unwrap();
        drop(first);
        assert_eq!(sub.pending_channels(), 1);
        drop(second);
        assert_eq!(sub.pending_channels(), 0);
    }

    /// Тест проверяет, что разрыв соединения прерывает все ожидания и
    /// снимает активность, а повторная активация снова разрешает promise.
    #[tokio::test]
    async fn test_disconnect_fails_all_and_recovers() {
        let (registry, sub) = open("hello-");
        confirm(&registry, "hello-*");
        sub.wait_for_activation().await.unwrap();

        let promises: Vec<Promise> = (0..3)
            .map(|i| {
                sub.new_promise(format!("p{i}"), Duration::from_secs(60))
                    .unwrap()
            })
            .collect();

        sub.shared.disconnect(&ConnectionError::ConnectionClosed.into());
        for promise in promises {
            let err = promise.await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::Disconnected);
        }
        assert!(!sub.is_active());
        assert_eq!(sub.pending_channels(), 0);

        confirm(&registry, "hello-*");
        let promise = sub
            .wait_for_new_promise("again", Duration::from_secs(5))
            .await
            .unwrap();
        publish(&registry, "hello-again", "ok");
        assert_eq!(promise.await.unwrap(), Bytes::from_static(b"ok"));
    }

    /// Тест проверяет закрытие: ожидания завершаются, ждущие активации
    /// просыпаются с ошибкой, повторное закрытие запрещено.
    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (registry, sub) = open("hello-");
        let sub = Arc::new(sub);

        let waiting = {
            let sub = Arc::clone(&sub);
            tokio::spawn(async move { sub.wait_for_activation().await })
        };
        tokio::task::yield_now().await;

        sub.close().unwrap();
        let err = waiting.await.unwrap().unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SubscriptionClosed);
        assert!(registry.keys(KeyKind::Pattern).is_empty());

        let err = sub.close().unwrap_err();
        assert_eq!(err.to_string(), "tried to use a closed PromiseSubscription");
        let err = sub.new_promise("x", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SubscriptionClosed);
        assert!(sub.clear().is_err());
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn test_clear_fails_waiters_but_keeps_subscription() {
        let (registry, sub) = open("hello-");
        confirm(&registry, "hello-*");
        sub.wait_for_activation().await.unwrap();

        let promise = sub.new_promise("x", Duration::from_secs(5)).unwrap();
        sub.clear().unwrap();
        let err = promise.await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SubscriptionClosed);

        assert!(sub.is_active());
        assert!(sub.new_promise("y", Duration::from_secs(5)).is_ok());
    }
}
