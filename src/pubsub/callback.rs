use std::{any::Any, fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

use bytes::Bytes;
use busmux_error::{CallbackError, StackError};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::trace;

use crate::logging::event_at;

/// Результат пользовательского callback'а.
pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

/// `on_message(channel, payload)`.
pub type MessageFn = Arc<dyn Fn(Bytes, Bytes) -> CallbackFuture + Send + Sync>;
/// `on_disconnect(cause)`.
pub type DisconnectFn = Arc<dyn Fn(StackError) -> CallbackFuture + Send + Sync>;
/// `on_activation(key)`.
pub type ActivationFn = Arc<dyn Fn(Bytes) -> CallbackFuture + Send + Sync>;

/// Набор callback'ов одной подписки.
///
/// Синхронные и асинхронные варианты сводятся к одной форме: функция,
/// возвращающая future с `anyhow::Result<()>`. Ошибка или паника
/// callback'а логируется и отбрасывается.
#[derive(Clone)]
pub struct Callbacks {
    pub(crate) on_message: MessageFn,
    pub(crate) on_disconnect: Option<DisconnectFn>,
    pub(crate) on_activation: Option<ActivationFn>,
}

impl Callbacks {
    /// Синхронный обработчик сообщений.
    pub fn new<F>(on_message: F) -> Self
    where
        F: Fn(Bytes, Bytes) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(on_message);
        Self::from_message_fn(Arc::new(move |channel, payload| {
            let f = Arc::clone(&f);
            async move { f(channel, payload) }.boxed()
        }))
    }

    /// Асинхронный обработчик сообщений.
    pub fn new_async<F, Fut>(on_message: F) -> Self
    where
        F: Fn(Bytes, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::from_message_fn(Arc::new(move |channel, payload| {
            on_message(channel, payload).boxed()
        }))
    }

    pub fn on_disconnect<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(StackError) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.on_disconnect = Some(Arc::new(move |cause| {
            let f = Arc::clone(&f);
            async move { f(cause) }.boxed()
        }));
        self
    }

    pub fn on_disconnect_async<F, Fut>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(StackError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_disconnect = Some(Arc::new(move |cause| f(cause).boxed()));
        self
    }

    pub fn on_activation<F>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(Bytes) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.on_activation = Some(Arc::new(move |key| {
            let f = Arc::clone(&f);
            async move { f(key) }.boxed()
        }));
        self
    }

    pub fn on_activation_async<F, Fut>(
        mut self,
        f: F,
    ) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_activation = Some(Arc::new(move |key| f(key).boxed()));
        self
    }

    fn from_message_fn(on_message: MessageFn) -> Self {
        Self {
            on_message,
            on_disconnect: None,
            on_activation: None,
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_activation", &self.on_activation.is_some())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// CallbackBox
////////////////////////////////////////////////////////////////////////////////

/// Единица работы для обработчика одной подписки.
enum Invocation {
    Message { channel: Bytes, payload: Bytes },
    Activation(Bytes),
    Disconnect(StackError),
}

/// Неизменяемый набор callback'ов, разделяемый всеми записями реестра,
/// в которые он вставлен.
///
/// Вызовы ставятся в неограниченную очередь и исполняются отдельной задачей
/// строго по порядку. Цикл приёма только ставит работу в очередь и никогда
/// не ждёт пользовательский код. Задача завершается, когда последняя ссылка
/// на `CallbackBox` сброшена и очередь опустела.
///
/// Очередь ничем не ограничена: пока callback подписки висит, сообщения
/// её каналов копятся в памяти без предела. Зависший callback задерживает
/// только свою подписку, но его память растёт со скоростью публикаций.
pub(crate) struct CallbackBox {
    id: u64,
    queue: mpsc::UnboundedSender<Invocation>,
}

impl CallbackBox {
    /// Создаёт box и запускает его обработчик. Должен вызываться внутри
    /// tokio runtime.
    pub(crate) fn spawn(
        id: u64,
        callbacks: Callbacks,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_dispatcher(id, callbacks, rx));
        Arc::new(Self { id, queue })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn message(
        &self,
        channel: Bytes,
        payload: Bytes,
    ) {
        self.enqueue(Invocation::Message { channel, payload });
    }

    pub(crate) fn activation(
        &self,
        key: Bytes,
    ) {
        self.enqueue(Invocation::Activation(key));
    }

    pub(crate) fn disconnect(
        &self,
        cause: StackError,
    ) {
        self.enqueue(Invocation::Disconnect(cause));
    }

    fn enqueue(
        &self,
        invocation: Invocation,
    ) {
        if self.queue.send(invocation).is_err() {
            trace!(subscription = self.id, "callback dispatcher is gone, dropping invocation");
        }
    }
}

impl fmt::Debug for CallbackBox {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CallbackBox").field("id", &self.id).finish()
    }
}

async fn run_dispatcher(
    id: u64,
    callbacks: Callbacks,
    mut rx: mpsc::UnboundedReceiver<Invocation>,
) {
    while let Some(invocation) = rx.recv().await {
        match invocation {
            Invocation::Message { channel, payload } => {
                let f = &callbacks.on_message;
                invoke(id, "on_message", async { f(channel, payload).await }).await;
            }
            Invocation::Activation(key) => {
                if let Some(f) = &callbacks.on_activation {
                    invoke(id, "on_activation", async { f(key).await }).await;
                }
            }
            Invocation::Disconnect(cause) => {
                if let Some(f) = &callbacks.on_disconnect {
                    invoke(id, "on_disconnect", async { f(cause).await }).await;
                }
            }
        }
    }
    trace!(subscription = id, "callback dispatcher stopped");
}

/// Выполняет один вызов callback'а, перехватывая ошибку и панику.
///
/// Сам вызов функции происходит внутри `fut`, поэтому паника до первого
/// `.await` тоже перехватывается.
async fn invoke(
    id: u64,
    callback: &'static str,
    fut: impl Future<Output = anyhow::Result<()>>,
) {
    let error = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => CallbackError::Failed {
            callback,
            reason: format!("{err:#}"),
        },
        Err(panic) => CallbackError::Panicked {
            callback,
            reason: panic_message(panic.as_ref()),
        },
    };
    report(id, error);
}

/// Логирует сбой callback'а на уровне его статус-кода: ошибка идёт в
/// `warn`, паника в `error`.
fn report(
    id: u64,
    error: CallbackError,
) {
    let error = StackError::new(error);
    event_at!(
        error.log_level(),
        subscription = id,
        error = %error,
        tags = ?error.metrics_tags(),
        "subscription callback failed"
    );
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
