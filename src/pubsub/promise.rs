use std::{
    future::Future,
    pin::Pin,
    sync::Weak,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use busmux_error::{MuxError, MuxResult, SubscriptionKind};
use tokio::{
    sync::oneshot,
    time::{sleep, Sleep},
};

use super::{promise_subscription::PromiseShared, EntryHandle};

/// Отправитель результата ожидания.
pub(crate) type Waiter = oneshot::Sender<MuxResult<Bytes>>;

/// Ожидание одного сообщения на конкретном канале с таймаутом.
///
/// Разрешается первым сообщением, опубликованным в канал после создания,
/// или ошибкой: `Timeout` по истечении срока, `Disconnected` при разрыве
/// соединения, `SubscriptionClosed` при закрытии или очистке подписки.
///
/// Сброс, [`cancel`](Self::cancel) и таймаут выполняют одну и ту же
/// очистку: ожидание удаляется из списка канала, опустевший канал
/// удаляется из подписки.
#[must_use = "a promise does nothing unless awaited"]
pub struct Promise {
    channel: Bytes,
    timeout: Duration,
    rx: oneshot::Receiver<MuxResult<Bytes>>,
    deadline: Pin<Box<Sleep>>,
    guard: WaiterGuard,
}

/// Убирает ожидание из списка канала на любом пути выхода.
struct WaiterGuard {
    shared: Weak<PromiseShared>,
    channel: Bytes,
    handle: EntryHandle,
    armed: bool,
}

impl Promise {
    pub(crate) fn new(
        shared: Weak<PromiseShared>,
        channel: Bytes,
        handle: EntryHandle,
        rx: oneshot::Receiver<MuxResult<Bytes>>,
        timeout: Duration,
    ) -> Self {
        Self {
            channel: channel.clone(),
            timeout,
            rx,
            deadline: Box::pin(sleep(timeout)),
            guard: WaiterGuard {
                shared,
                channel,
                handle,
                armed: true,
            },
        }
    }

    /// Полное имя канала (префикс + суффикс).
    pub fn channel(&self) -> &Bytes {
        &self.channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Отменяет ожидание.
    pub fn cancel(mut self) {
        self.guard.release();
    }
}

impl Future for Promise {
    type Output = MuxResult<Bytes>;

    fn poll(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let this = self.get_mut();

        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                // Отправитель уже удалил ожидание из списка.
                this.guard.armed = false;
                return Poll::Ready(outcome);
            }
            Poll::Ready(Err(_)) => {
                this.guard.release();
                return Poll::Ready(Err(MuxError::SubscriptionClosed {
                    kind: SubscriptionKind::Promise,
                }
                .into()));
            }
            Poll::Pending => {}
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => {
                this.guard.release();
                Poll::Ready(Err(MuxError::Timeout {
                    channel: String::from_utf8_lossy(&this.channel).into_owned(),
                    timeout: this.timeout,
                }
                .into()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("channel", &String::from_utf8_lossy(&self.channel))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl WaiterGuard {
    fn release(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.forget(&self.channel, self.handle);
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.release();
    }
}
