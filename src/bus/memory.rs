use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use busmux_error::{ConnectionError, MuxResult};
use dashmap::DashMap;
use globset::{Glob, GlobMatcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{BusCommand, BusConnection, BusConnector, BusMessage, BusSink, BusStream};

const MEMORY_ADDRESS: &str = "memory://bus";

/// Внутрипроцессная шина сообщений.
///
/// Каждое соединение хранит собственные наборы каналов и шаблонов (glob) и,
/// как настоящий сервер, отвечает одним подтверждением на каждый ключ
/// команды подписки/отписки. Поддерживает:
/// - публикацию с возвратом числа доставок;
/// - внедрение сбоев (`fail_next_connects`, `set_reachable`,
///   `disconnect_all`);
/// - журнал всех полученных команд.
///
/// Клонирование дешёвое: все клоны работают с одной шиной.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    /// Живые соединения по идентификатору
    peers: DashMap<u64, Arc<Peer>>,
    next_peer_id: AtomicU64,
    unreachable: AtomicBool,
    /// Сколько ближайших попыток подключения завершить ошибкой
    failing_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    /// Все команды в порядке поступления
    commands: Mutex<Vec<BusCommand>>,
}

/// Серверная сторона одного соединения.
struct Peer {
    id: u64,
    state: Mutex<PeerState>,
}

struct PeerState {
    /// `None` после закрытия: отправитель сброшен, поток читателя
    /// завершается.
    outbox: Option<mpsc::UnboundedSender<BusMessage>>,
    channels: HashSet<Bytes>,
    patterns: HashMap<Bytes, Option<GlobMatcher>>,
}

/// Половина записи соединения с [`MemoryBus`].
pub struct MemorySink {
    bus: MemoryBus,
    peer: Arc<Peer>,
    pending: Vec<BusCommand>,
}

/// Половина чтения соединения с [`MemoryBus`].
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Фабрика соединений с этой шиной.
    pub fn connector(&self) -> impl BusConnector {
        self.clone()
    }

    /// Публикует сообщение. Возвращает число доставок: одна на каждое
    /// соединение с точной подпиской на канал и по одной на каждый
    /// совпавший шаблон.
    pub fn publish(
        &self,
        channel: impl AsRef<[u8]>,
        payload: impl AsRef<[u8]>,
    ) -> usize {
        let channel = Bytes::copy_from_slice(channel.as_ref());
        let payload = Bytes::copy_from_slice(payload.as_ref());
        let name = String::from_utf8_lossy(&channel).into_owned();

        let mut delivered = 0;
        for peer in self.inner.peers.iter() {
            let state = peer.state.lock();
            let Some(outbox) = state.outbox.as_ref() else {
                continue;
            };

            if state.channels.contains(&channel) {
                let message = BusMessage::Message {
                    channel: channel.clone(),
                    payload: payload.clone(),
                };
                if outbox.send(message).is_ok() {
                    delivered += 1;
                }
            }

            for (pattern, matcher) in &state.patterns {
                if !matcher.as_ref().is_some_and(|m| m.is_match(name.as_str())) {
                    continue;
                }
                let message = BusMessage::PMessage {
                    pattern: pattern.clone(),
                    channel: channel.clone(),
                    payload: payload.clone(),
                };
                if outbox.send(message).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Следующие `n` попыток подключения завершатся ошибкой.
    pub fn fail_next_connects(
        &self,
        n: usize,
    ) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Делает шину доступной или недоступной для новых подключений.
    pub fn set_reachable(
        &self,
        reachable: bool,
    ) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Разрывает все живые соединения. Их потоки чтения завершаются ошибкой
    /// `ConnectionClosed`, запись начинает возвращать `WriteFailed`.
    /// Возвращает число разорванных соединений.
    pub fn disconnect_all(&self) -> usize {
        let peers: Vec<Arc<Peer>> = self
            .inner
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for peer in &peers {
            self.drop_peer(peer);
        }
        debug!(connections = peers.len(), "memory bus dropped all connections");
        peers.len()
    }

    /// Все полученные команды в порядке поступления.
    pub fn commands(&self) -> Vec<BusCommand> {
        self.inner.commands.lock().clone()
    }

    /// Сколько команд `name` упоминали ключ `key`.
    pub fn command_count(
        &self,
        name: &str,
        key: impl AsRef<[u8]>,
    ) -> usize {
        let key = key.as_ref();
        self.inner
            .commands
            .lock()
            .iter()
            .filter(|cmd| cmd.name().eq_ignore_ascii_case(name) && cmd.mentions(key))
            .count()
    }

    /// Очищает журнал команд.
    pub fn clear_commands(&self) {
        self.inner.commands.lock().clear();
    }

    /// Число живых соединений.
    pub fn connection_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Число всех попыток подключения, включая неудачные.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    fn open(&self) -> MuxResult<BusConnection> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectFailed {
                address: MEMORY_ADDRESS.to_string(),
                reason: "bus is unreachable".to_string(),
            }
            .into());
        }
        let injected = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ConnectionError::ConnectFailed {
                address: MEMORY_ADDRESS.to_string(),
                reason: "injected connect failure".to_string(),
            }
            .into());
        }

        let id = self.inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Peer {
            id,
            state: Mutex::new(PeerState {
                outbox: Some(tx),
                channels: HashSet::new(),
                patterns: HashMap::new(),
            }),
        });
        self.inner.peers.insert(id, Arc::clone(&peer));
        debug!(peer = id, "memory bus accepted connection");

        Ok(BusConnection {
            sink: Box::new(MemorySink {
                bus: self.clone(),
                peer,
                pending: Vec::new(),
            }),
            stream: Box::new(MemoryStream { rx }),
        })
    }

    /// Применяет команду к соединению и отправляет подтверждения.
    fn apply(
        &self,
        peer: &Peer,
        command: BusCommand,
    ) -> MuxResult<()> {
        let mut state = peer.state.lock();
        let Some(outbox) = state.outbox.clone() else {
            return Err(write_failed());
        };

        for key in command.args() {
            let reply = match &command {
                BusCommand::Subscribe(_) => {
                    state.channels.insert(key.clone());
                    BusMessage::Subscribe(key.clone())
                }
                BusCommand::Unsubscribe(_) => {
                    state.channels.remove(key);
                    BusMessage::Unsubscribe(key.clone())
                }
                BusCommand::PSubscribe(_) => {
                    state.patterns.insert(key.clone(), compile_pattern(key));
                    BusMessage::PSubscribe(key.clone())
                }
                BusCommand::PUnsubscribe(_) => {
                    state.patterns.remove(key);
                    BusMessage::PUnsubscribe(key.clone())
                }
            };
            outbox.send(reply).map_err(|_| write_failed())?;
        }
        drop(state);

        self.inner.commands.lock().push(command);
        Ok(())
    }

    fn drop_peer(
        &self,
        peer: &Peer,
    ) {
        self.inner.peers.remove(&peer.id);
        peer.state.lock().outbox = None;
    }
}

impl Peer {
    fn is_open(&self) -> bool {
        self.state.lock().outbox.is_some()
    }
}

fn compile_pattern(pattern: &Bytes) -> Option<GlobMatcher> {
    let source = String::from_utf8_lossy(pattern);
    match Glob::new(&source) {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(error) => {
            warn!(pattern = %source, %error, "invalid glob pattern, it will never match");
            None
        }
    }
}

fn write_failed() -> busmux_error::StackError {
    ConnectionError::WriteFailed {
        reason: "connection closed".to_string(),
    }
    .into()
}

////////////////////////////////////////////////////////////////////////////////
// Реализации трейтов шины
////////////////////////////////////////////////////////////////////////////////

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> MuxResult<BusConnection> {
        self.open()
    }
}

#[async_trait]
impl BusSink for MemorySink {
    fn write_command(
        &mut self,
        command: &BusCommand,
    ) -> MuxResult<()> {
        if !self.peer.is_open() {
            return Err(write_failed());
        }
        self.pending.push(command.clone());
        Ok(())
    }

    async fn flush(&mut self) -> MuxResult<()> {
        for command in std::mem::take(&mut self.pending) {
            self.bus.apply(&self.peer, command)?;
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.bus.drop_peer(&self.peer);
    }
}

#[async_trait]
impl BusStream for MemoryStream {
    async fn read(&mut self) -> MuxResult<BusMessage> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| ConnectionError::ConnectionClosed.into())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use busmux_error::StatusCode;

    use super::*;

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    /// Тест проверяет подтверждение подписки и доставку по точному каналу.
    #[tokio::test]
    async fn test_subscribe_confirms_and_delivers() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect().await.unwrap();

        conn.sink
            .write_command(&BusCommand::Subscribe(vec![key("a"), key("b")]))
            .unwrap();
        // До flush команда только буферизована.
        assert_eq!(bus.publish("a", "early"), 0);
        conn.sink.flush().await.unwrap();

        assert_eq!(conn.stream.read().await.unwrap(), BusMessage::Subscribe(key("a")));
        assert_eq!(conn.stream.read().await.unwrap(), BusMessage::Subscribe(key("b")));

        assert_eq!(bus.publish("a", "hi"), 1);
        assert_eq!(
            conn.stream.read().await.unwrap(),
            BusMessage::Message {
                channel: key("a"),
                payload: key("hi"),
            }
        );
        assert_eq!(bus.command_count("SUBSCRIBE", "b"), 1);
    }

    /// Тест проверяет доставку по glob-шаблону.
    #[tokio::test]
    async fn test_pattern_delivery() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect().await.unwrap();

        conn.sink
            .write_command(&BusCommand::PSubscribe(vec![key("news.*")]))
            .unwrap();
        conn.sink.flush().await.unwrap();
        assert_eq!(conn.stream.read().await.unwrap(), BusMessage::PSubscribe(key("news.*")));

        assert_eq!(bus.publish("sport.football", "x"), 0);
        assert_eq!(bus.publish("news.today", "y"), 1);
        assert_eq!(
            conn.stream.read().await.unwrap(),
            BusMessage::PMessage {
                pattern: key("news.*"),
                channel: key("news.today"),
                payload: key("y"),
            }
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect().await.unwrap();

        conn.sink.write_command(&BusCommand::Subscribe(vec![key("a")])).unwrap();
        conn.sink.write_command(&BusCommand::Unsubscribe(vec![key("a")])).unwrap();
        conn.sink.flush().await.unwrap();

        assert_eq!(conn.stream.read().await.unwrap(), BusMessage::Subscribe(key("a")));
        assert_eq!(conn.stream.read().await.unwrap(), BusMessage::Unsubscribe(key("a")));
        assert_eq!(bus.publish("a", "hi"), 0);
        assert_eq!(bus.commands().len(), 2);
    }

    /// Тест проверяет, что disconnect_all завершает чтение и запись ошибкой.
    #[tokio::test]
    async fn test_disconnect_all_breaks_connections() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect().await.unwrap();
        assert_eq!(bus.connection_count(), 1);

        assert_eq!(bus.disconnect_all(), 1);
        assert_eq!(bus.connection_count(), 0);

        let err = conn.stream.read().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ConnectionClosed);
        let err = conn
            .sink
            .write_command(&BusCommand::Subscribe(vec![key("a")]))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::WriteFailed);
    }

    /// Тест проверяет внедрение сбоев подключения.
    #[tokio::test]
    async fn test_connect_fault_injection() {
        let bus = MemoryBus::new();
        bus.fail_next_connects(2);

        assert!(bus.connect().await.is_err());
        assert!(bus.connect().await.is_err());
        assert!(bus.connect().await.is_ok());

        bus.set_reachable(false);
        let err = bus.connect().await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::ConnectionFailed);
        bus.set_reachable(true);
        assert!(bus.connect().await.is_ok());

        assert_eq!(bus.connect_attempts(), 5);
        assert_eq!(bus.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let bus = MemoryBus::new();
        let mut conn = bus.connect().await.unwrap();
        conn.sink.close().await;

        assert_eq!(bus.connection_count(), 0);
        assert!(conn.stream.read().await.is_err());
    }
}
