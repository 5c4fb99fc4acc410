use std::{fmt, sync::Arc, time::Duration};

use busmux_error::{ConnectionError, ResultExt, StackError};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep, timeout},
};
use tracing::{debug, info, trace};

use super::{Backoff, Outgoing, Registry};
use crate::{
    bus::{BusCommand, BusConnection, BusConnector, BusSink, BusStream},
    logging::event_at,
};

/// Состояние соединения мультиплексора с шиной.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Идёт (пере)подключение.
    Connecting,
    /// Соединение установлено, работает цикл приёма.
    Connected,
    /// Вызван `close()`, задача соединения останавливается.
    Closing,
    /// Задача соединения завершена.
    Closed,
}

/// Чем закончилось обслуживание одного соединения.
enum Served {
    Shutdown,
    Lost(StackError),
}

/// Задача, владеющая единственным соединением с шиной.
///
/// Цикл: подключение с backoff → пакетная подписка на все ключи → цикл
/// приёма, который также пишет команды из очереди реестра → при ошибке
/// переподключение. Единственный читатель и единственный писатель
/// соединения.
pub(crate) struct ConnectionManager {
    registry: Arc<Registry>,
    connector: Arc<dyn BusConnector>,
    backoff: Backoff,
    connect_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Outgoing>,
    shutdown: watch::Receiver<bool>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl ConnectionManager {
    pub(crate) fn new(
        registry: Arc<Registry>,
        connector: Arc<dyn BusConnector>,
        backoff: Backoff,
        connect_timeout: Duration,
        commands: mpsc::UnboundedReceiver<Outgoing>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            connector,
            backoff,
            connect_timeout,
            commands,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        while let Some(connection) = self.connect().await {
            let Some((epoch, initial)) = self.registry.on_connected() else {
                let BusConnection { mut sink, .. } = connection;
                sink.close().await;
                break;
            };
            info!(epoch, "connected to bus");

            match self.serve(connection, epoch, initial).await {
                Served::Shutdown => break,
                Served::Lost(cause) => self.reconnect(cause),
            }
        }

        self.registry.mark_stopped();
        info!("connection manager stopped");
    }

    /// Повторяет попытки подключения до успеха или остановки.
    async fn connect(&mut self) -> Option<BusConnection> {
        let mut attempt = 1;
        loop {
            if *self.shutdown.borrow() {
                return None;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return None,
                result = timeout(self.connect_timeout, self.connector.connect()) => result,
            };
            let cause = match result {
                Ok(Ok(connection)) => return Some(connection),
                Ok(Err(err)) => err,
                Err(_) => ConnectionError::ConnectTimeout {
                    timeout: self.connect_timeout,
                }
                .into(),
            };

            let delay = self.backoff.delay(attempt);
            event_at!(
                cause.log_level(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %cause,
                tags = ?cause.metrics_tags(),
                "bus connection attempt failed"
            );

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return None,
                _ = sleep(delay) => {}
            }
            attempt = self.backoff.next_attempt(attempt);
        }
    }

    /// Обслуживает одно соединение до его потери или остановки.
    async fn serve(
        &mut self,
        connection: BusConnection,
        epoch: u64,
        initial: Vec<BusCommand>,
    ) -> Served {
        let BusConnection {
            mut sink,
            mut stream,
        } = connection;
        let served = self
            .pump(sink.as_mut(), stream.as_mut(), epoch, initial)
            .await;
        sink.close().await;
        served
    }

    async fn pump(
        &mut self,
        sink: &mut dyn BusSink,
        stream: &mut dyn BusStream,
        epoch: u64,
        initial: Vec<BusCommand>,
    ) -> Served {
        if !initial.is_empty() {
            if let Err(err) = write_all(sink, &initial)
                .await
                .context("Resubscribing after connect")
            {
                return Served::Lost(err);
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return Served::Shutdown,
                Some(outgoing) = self.commands.recv() => {
                    if outgoing.epoch != epoch {
                        trace!(
                            epoch = outgoing.epoch,
                            current = epoch,
                            command = %outgoing.command,
                            "dropping command queued for a previous connection"
                        );
                        continue;
                    }
                    if let Err(err) = write_all(sink, std::slice::from_ref(&outgoing.command))
                        .await
                        .context("Writing bus command")
                    {
                        return Served::Lost(err);
                    }
                }
                read = stream.read() => match read {
                    Ok(message) => {
                        trace!(kind = message.kind(), "bus message");
                        self.registry.dispatch(message);
                    }
                    Err(err) => return Served::Lost(err.context("Reading bus message")),
                },
            }
        }
    }

    /// Протокол переподключения: рассылка причины всем живым подпискам.
    /// Мёртвое соединение к этому моменту уже закрыто, цикл подключения
    /// перезапускается вызывающей стороной.
    fn reconnect(
        &self,
        cause: StackError,
    ) {
        let Some(subscribers) = self.registry.begin_reconnect() else {
            debug!("reconnect already in progress");
            return;
        };
        event_at!(
            cause.log_level(),
            error = %cause,
            tags = ?cause.metrics_tags(),
            subscriptions = subscribers.len(),
            "bus connection lost, reconnecting"
        );
        for subscriber in subscribers {
            subscriber.disconnect(cause.clone());
        }
    }
}

async fn write_all(
    sink: &mut dyn BusSink,
    commands: &[BusCommand],
) -> Result<(), StackError> {
    for command in commands {
        debug!(command = %command, "writing bus command");
        sink.write_command(command)?;
    }
    sink.flush().await
}

/// Завершается, когда запрошена остановка или владелец сигнала сброшен.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов для ConnectionState
////////////////////////////////////////////////////////////////////////////////

impl fmt::Display for ConnectionState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
