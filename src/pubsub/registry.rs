use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use busmux_error::{bail, MuxError, MuxResult};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::{CallbackBox, ConnectionState, DispatchList, EntryHandle};
use crate::bus::{BusCommand, BusMessage};

/// Пространство ключей реестра.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyKind {
    Channel,
    Pattern,
}

/// Команда, поставленная в очередь задачи соединения.
///
/// `epoch` равен номеру соединения, для которого команда сформирована.
/// Команды прошлых соединений задача отбрасывает: новое соединение уже
/// получило полный снимок ключей одной пакетной командой.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) epoch: u64,
    pub(crate) command: BusCommand,
}

/// Ключи одного пространства и их признак активности.
#[derive(Default)]
struct KeySpace {
    keys: HashMap<Bytes, DispatchList<Arc<CallbackBox>>>,
    active: HashSet<Bytes>,
}

struct RegistryState {
    channels: KeySpace,
    patterns: KeySpace,
    /// Живые подписки для рассылки `on_disconnect`
    subscriptions: HashMap<u64, Arc<CallbackBox>>,
    phase: ConnectionState,
    /// Номер текущего соединения
    epoch: u64,
    reconnecting: bool,
    closed: bool,
}

/// Реестр подписок: ключ канала/шаблона → список получателей.
///
/// Всё изменяемое состояние защищено одной блокировкой, которая никогда не
/// удерживается через `.await`. Команды в шину не пишутся напрямую, а
/// ставятся в очередь задачи соединения, поэтому запись сериализована
/// относительно замены соединения.
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    commands: mpsc::UnboundedSender<Outgoing>,
    status: watch::Sender<ConnectionState>,
    next_subscription_id: AtomicU64,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl KeyKind {
    fn subscribe(
        self,
        keys: Vec<Bytes>,
    ) -> BusCommand {
        match self {
            Self::Channel => BusCommand::Subscribe(keys),
            Self::Pattern => BusCommand::PSubscribe(keys),
        }
    }

    fn unsubscribe(
        self,
        keys: Vec<Bytes>,
    ) -> BusCommand {
        match self {
            Self::Channel => BusCommand::Unsubscribe(keys),
            Self::Pattern => BusCommand::PUnsubscribe(keys),
        }
    }
}

impl RegistryState {
    fn space(
        &self,
        kind: KeyKind,
    ) -> &KeySpace {
        match kind {
            KeyKind::Channel => &self.channels,
            KeyKind::Pattern => &self.patterns,
        }
    }

    fn space_mut(
        &mut self,
        kind: KeyKind,
    ) -> &mut KeySpace {
        match kind {
            KeyKind::Channel => &mut self.channels,
            KeyKind::Pattern => &mut self.patterns,
        }
    }

    /// Номер соединения, если оно сейчас установлено.
    fn connected_epoch(&self) -> Option<u64> {
        (self.phase == ConnectionState::Connected).then_some(self.epoch)
    }
}

impl KeySpace {
    fn mark_active(
        &mut self,
        key: Bytes,
    ) {
        let Some(list) = self.keys.get(&key) else {
            trace!(key = ?key, "confirmation for a key that is no longer registered");
            return;
        };
        for target in list {
            target.activation(key.clone());
        }
        self.active.insert(key);
    }

    fn dispatch(
        &self,
        key: &Bytes,
        channel: Bytes,
        payload: Bytes,
    ) {
        if let Some(list) = self.keys.get(key) {
            for target in list {
                target.message(channel.clone(), payload.clone());
            }
        }
    }

    fn sorted(keys: impl Iterator<Item = Bytes>) -> Vec<Bytes> {
        let mut keys: Vec<Bytes> = keys.collect();
        keys.sort();
        keys
    }
}

impl Registry {
    /// Создаёт реестр и приёмник очереди команд для задачи соединения.
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Outgoing>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ConnectionState::Connecting);
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState {
                channels: KeySpace::default(),
                patterns: KeySpace::default(),
                subscriptions: HashMap::new(),
                phase: ConnectionState::Connecting,
                epoch: 0,
                // До первого соединения запросы на переподключение
                // игнорируются.
                reconnecting: true,
                closed: false,
            }),
            commands,
            status,
            next_subscription_id: AtomicU64::new(1),
        });
        (registry, rx)
    }

    pub(crate) fn next_subscription_id(&self) -> u64 {
        self.next_subscription_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Регистрирует живую подписку для рассылки уведомлений о разрыве.
    pub(crate) fn register(
        &self,
        target: Arc<CallbackBox>,
    ) -> MuxResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            bail!(MuxError::MultiplexerClosed);
        }
        state.subscriptions.insert(target.id(), target);
        Ok(())
    }

    pub(crate) fn unregister(
        &self,
        id: u64,
    ) {
        self.state.lock().subscriptions.remove(&id);
    }

    /// Добавляет получателя под ключ.
    ///
    /// Новый ключ порождает SUBSCRIBE/PSUBSCRIBE, если соединение
    /// установлено; иначе ключ попадёт в пакетную подписку при следующем
    /// подключении. Если ключ уже активен, получатель сразу узнаёт об этом
    /// через свой callback активации.
    pub(crate) fn add(
        &self,
        kind: KeyKind,
        key: Bytes,
        target: Arc<CallbackBox>,
    ) -> MuxResult<EntryHandle> {
        let mut state = self.state.lock();
        if state.closed {
            bail!(MuxError::MultiplexerClosed);
        }

        let epoch = state.connected_epoch();
        let space = state.space_mut(kind);
        let handle = match space.keys.entry(key.clone()) {
            Entry::Vacant(entry) => {
                let handle = entry.insert(DispatchList::new()).push(target);
                if let Some(epoch) = epoch {
                    self.send(epoch, kind.subscribe(vec![key]));
                }
                handle
            }
            Entry::Occupied(entry) => {
                if space.active.contains(&key) {
                    target.activation(key);
                }
                entry.into_mut().push(target)
            }
        };
        Ok(handle)
    }

    /// Удаляет получателя. Опустевший ключ удаляется вместе с признаком
    /// активности, и в шину уходит UNSUBSCRIBE/PUNSUBSCRIBE.
    pub(crate) fn remove(
        &self,
        kind: KeyKind,
        key: &Bytes,
        handle: EntryHandle,
    ) -> MuxResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            bail!(MuxError::MultiplexerClosed);
        }

        let epoch = state.connected_epoch();
        let space = state.space_mut(kind);
        let Some(list) = space.keys.get_mut(key) else {
            return Ok(());
        };
        list.remove(handle);
        if list.is_empty() {
            space.keys.remove(key);
            space.active.remove(key);
            if let Some(epoch) = epoch {
                self.send(epoch, kind.unsubscribe(vec![key.clone()]));
            }
        }
        Ok(())
    }

    /// Обрабатывает одно сообщение из шины. Вызывается только циклом приёма.
    pub(crate) fn dispatch(
        &self,
        message: BusMessage,
    ) {
        let mut state = self.state.lock();
        match message {
            BusMessage::Message { channel, payload } => {
                state.channels.dispatch(&channel, channel.clone(), payload);
            }
            BusMessage::PMessage {
                pattern,
                channel,
                payload,
            } => {
                state.patterns.dispatch(&pattern, channel, payload);
            }
            BusMessage::Subscribe(key) => state.channels.mark_active(key),
            BusMessage::PSubscribe(key) => state.patterns.mark_active(key),
            BusMessage::Unsubscribe(key) => {
                state.channels.active.remove(&key);
            }
            BusMessage::PUnsubscribe(key) => {
                state.patterns.active.remove(&key);
            }
        }
    }

    /// Переводит реестр в состояние `Connected` нового соединения.
    ///
    /// Возвращает номер соединения и пакетные команды подписки на все
    /// зарегистрированные ключи, или `None`, если мультиплексор закрыт.
    pub(crate) fn on_connected(&self) -> Option<(u64, Vec<BusCommand>)> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }

        state.epoch += 1;
        state.phase = ConnectionState::Connected;
        state.reconnecting = false;
        self.status.send_replace(ConnectionState::Connected);

        let mut initial = Vec::with_capacity(2);
        for kind in [KeyKind::Channel, KeyKind::Pattern] {
            let space = state.space(kind);
            if !space.keys.is_empty() {
                initial.push(kind.subscribe(space.keys.keys().cloned().collect()));
            }
        }
        Some((state.epoch, initial))
    }

    /// Начинает переподключение.
    ///
    /// Повторный вызов во время уже идущего переподключения ничего не
    /// делает и возвращает `None`. Иначе сбрасывает признаки активности и
    /// возвращает живые подписки для рассылки причины разрыва.
    pub(crate) fn begin_reconnect(&self) -> Option<Vec<Arc<CallbackBox>>> {
        let mut state = self.state.lock();
        if state.closed || state.reconnecting {
            return None;
        }

        state.reconnecting = true;
        state.phase = ConnectionState::Connecting;
        state.channels.active.clear();
        state.patterns.active.clear();
        self.status.send_replace(ConnectionState::Connecting);

        Some(state.subscriptions.values().cloned().collect())
    }

    /// Закрывает реестр. Повторное закрытие возвращает ошибку.
    pub(crate) fn close(&self) -> MuxResult<()> {
        let released = {
            let mut state = self.state.lock();
            if state.closed {
                bail!(MuxError::MultiplexerClosed);
            }
            Self::shutdown(&mut state)
        };
        self.status.send_if_modified(|current| {
            let changed = *current != ConnectionState::Closing;
            *current = ConnectionState::Closing;
            changed
        });
        debug!(subscriptions = released.len(), "registry closed");
        Ok(())
    }

    /// Фиксирует остановку задачи соединения.
    pub(crate) fn mark_stopped(&self) {
        {
            let mut state = self.state.lock();
            if !state.closed {
                let _ = Self::shutdown(&mut state);
            }
        }
        self.status.send_replace(ConnectionState::Closed);
    }

    /// Снимок ключей пространства в отсортированном виде.
    pub(crate) fn keys(
        &self,
        kind: KeyKind,
    ) -> Vec<Bytes> {
        let state = self.state.lock();
        KeySpace::sorted(state.space(kind).keys.keys().cloned())
    }

    /// Снимок активных ключей пространства в отсортированном виде.
    pub(crate) fn active_keys(
        &self,
        kind: KeyKind,
    ) -> Vec<Bytes> {
        let state = self.state.lock();
        KeySpace::sorted(state.space(kind).active.iter().cloned())
    }

    /// Число получателей под ключом.
    #[cfg(test)]
    pub(crate) fn receivers(
        &self,
        kind: KeyKind,
        key: &[u8],
    ) -> usize {
        let state = self.state.lock();
        state
            .space(kind)
            .keys
            .get(key)
            .map_or(0, DispatchList::len)
    }

    fn shutdown(state: &mut RegistryState) -> Vec<Arc<CallbackBox>> {
        state.closed = true;
        state.phase = ConnectionState::Closing;
        state.channels = KeySpace::default();
        state.patterns = KeySpace::default();
        state.subscriptions.drain().map(|(_, target)| target).collect()
    }

    fn send(
        &self,
        epoch: u64,
        command: BusCommand,
    ) {
        debug!(epoch, command = %command, "queueing bus command");
        if self.commands.send(Outgoing { epoch, command }).is_err() {
            trace!("connection task is gone, command dropped");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
