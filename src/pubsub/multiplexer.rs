use std::{fmt, sync::Arc};

use bytes::Bytes;
use busmux_error::{MuxError, MuxResult};
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    connection::ConnectionManager, CallbackBox, Callbacks, ChannelSubscription, ConnectionState,
    KeyKind, PatternSubscription, PromiseSubscription, Registry,
};
use crate::{bus::BusConnector, config::MultiplexerConfig};

/// Мультиплексор pub/sub поверх одного соединения с шиной.
///
/// Все подписки процесса делят одно соединение: одинаковые каналы и
/// шаблоны разных подписок сворачиваются в один ключ, и в шину уходит
/// только первая подписка на ключ и только последняя отписка. Соединение
/// обслуживает отдельная задача, которая переподключается с backoff и
/// восстанавливает все подписки одним пакетом.
///
/// Должен создаваться внутри runtime tokio.
pub struct Multiplexer {
    registry: Arc<Registry>,
    shutdown: watch::Sender<bool>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl Multiplexer {
    /// Создаёт мультиплексор с настройками по умолчанию и запускает задачу
    /// соединения.
    pub fn new<C: BusConnector>(connector: C) -> Self {
        Self::start(Arc::new(connector), &MultiplexerConfig::default())
    }

    /// Создаёт мультиплексор с заданной конфигурацией.
    pub fn with_config<C: BusConnector>(
        connector: C,
        config: &MultiplexerConfig,
    ) -> MuxResult<Self> {
        config.validate()?;
        Ok(Self::start(Arc::new(connector), config))
    }

    fn start(
        connector: Arc<dyn BusConnector>,
        config: &MultiplexerConfig,
    ) -> Self {
        let (registry, commands) = Registry::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let manager = ConnectionManager::new(
            Arc::clone(&registry),
            connector,
            config.backoff(),
            config.connect_timeout(),
            commands,
            shutdown_rx,
        );
        tokio::spawn(manager.run());
        debug!(
            backoff_base_ms = config.backoff_base_ms,
            backoff_max_ms = config.backoff_max_ms,
            "multiplexer started"
        );

        Self { registry, shutdown }
    }

    /// Новая подписка на каналы. Каналы добавляются через
    /// [`ChannelSubscription::add`].
    pub fn new_channel_subscription(
        &self,
        callbacks: Callbacks,
    ) -> MuxResult<ChannelSubscription> {
        ChannelSubscription::open(Arc::clone(&self.registry), self.callback_box(callbacks)?)
    }

    /// Новая подписка на glob-шаблон.
    pub fn new_pattern_subscription(
        &self,
        pattern: impl AsRef<[u8]>,
        callbacks: Callbacks,
    ) -> MuxResult<PatternSubscription> {
        PatternSubscription::open(
            Arc::clone(&self.registry),
            self.callback_box(callbacks)?,
            Bytes::copy_from_slice(pattern.as_ref()),
        )
    }

    /// Новая подписка для одиночных ожиданий на каналах `prefix*`.
    pub fn new_promise_subscription(
        &self,
        prefix: impl AsRef<[u8]>,
    ) -> MuxResult<PromiseSubscription> {
        self.ensure_open()?;
        PromiseSubscription::open(
            Arc::clone(&self.registry),
            Bytes::copy_from_slice(prefix.as_ref()),
        )
    }

    /// Закрывает мультиплексор: все последующие изменяющие вызовы
    /// завершаются ошибкой, задача соединения останавливается.
    /// Повторный вызов возвращает `MultiplexerClosed`.
    pub fn close(&self) -> MuxResult<()> {
        self.registry.close()?;
        self.shutdown.send_replace(true);
        info!("multiplexer closed");
        Ok(())
    }

    /// Ждёт завершения задачи соединения после [`close`](Self::close).
    pub async fn wait_closed(&self) {
        let mut state = self.registry.watch_state();
        let _ = state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Ждёт установленного соединения. После закрытия возвращает
    /// `MultiplexerClosed`.
    pub async fn wait_connected(&self) -> MuxResult<()> {
        let mut state = self.registry.watch_state();
        let reached = state
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state);
        match reached {
            Ok(ConnectionState::Connected) => Ok(()),
            _ => Err(MuxError::MultiplexerClosed.into()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.registry.state()
    }

    pub fn is_closed(&self) -> bool {
        self.registry.is_closed()
    }

    /// Каналы, на которые есть хотя бы один подписчик.
    pub fn registered_channels(&self) -> Vec<Bytes> {
        self.registry.keys(KeyKind::Channel)
    }

    pub fn registered_patterns(&self) -> Vec<Bytes> {
        self.registry.keys(KeyKind::Pattern)
    }

    /// Каналы, подписка на которые подтверждена текущим соединением.
    pub fn active_channels(&self) -> Vec<Bytes> {
        self.registry.active_keys(KeyKind::Channel)
    }

    pub fn active_patterns(&self) -> Vec<Bytes> {
        self.registry.active_keys(KeyKind::Pattern)
    }

    fn callback_box(
        &self,
        callbacks: Callbacks,
    ) -> MuxResult<Arc<CallbackBox>> {
        self.ensure_open()?;
        Ok(CallbackBox::spawn(
            self.registry.next_subscription_id(),
            callbacks,
        ))
    }

    fn ensure_open(&self) -> MuxResult<()> {
        if self.registry.is_closed() {
            return Err(MuxError::MultiplexerClosed.into());
        }
        Ok(())
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("state", &self.state())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use busmux_error::StatusCode;

    use super::*;
    use crate::bus::MemoryBus;

    /// Тест проверяет, что некорректная конфигурация отклоняется до запуска.
    #[tokio::test]
    async fn test_with_config_validates() {
        let config = MultiplexerConfig {
            connect_timeout_ms: 0,
            ..Default::default()
        };
        let err = Multiplexer::with_config(MemoryBus::new(), &config).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InvalidConfig);
    }

    /// Тест проверяет полный жизненный цикл: подключение, закрытие,
    /// остановку задачи и отказ всех фабрик после закрытия.
    #[tokio::test(start_paused = true)]
    async fn test_lifecycle() {
        let bus = MemoryBus::new();
        let mux = Multiplexer::new(bus.clone());
        mux.wait_connected().await.unwrap();
        assert_eq!(mux.state(), ConnectionState::Connected);
        assert_eq!(bus.connection_count(), 1);

        mux.close().unwrap();
        mux.wait_closed().await;
        assert_eq!(mux.state(), ConnectionState::Closed);
        assert_eq!(bus.connection_count(), 0);

        assert!(mux.close().unwrap_err().is(StatusCode::MultiplexerClosed));
        assert!(mux.wait_connected().await.is_err());
        for err in [
            mux.new_channel_subscription(Callbacks::new(|_, _| Ok(())))
                .unwrap_err(),
            mux.new_pattern_subscription("a*", Callbacks::new(|_, _| Ok(())))
                .unwrap_err(),
            mux.new_promise_subscription("p-").unwrap_err(),
        ] {
            assert_eq!(err.status_code(), StatusCode::MultiplexerClosed);
        }
    }

    /// Тест проверяет, что сброс мультиплексора останавливает задачу
    /// соединения.
    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_connection() {
        let bus = MemoryBus::new();
        let mux = Multiplexer::new(bus.clone());
        mux.wait_connected().await.unwrap();
        let mut state = mux.registry.watch_state();
        drop(mux);

        state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .unwrap();
        assert_eq!(bus.connection_count(), 0);
    }
}
