//! Контракт клиента шины сообщений.
//!
//! Мультиплексор не кодирует протокол сам: он работает с уже
//! декодированными командами и сообщениями через три трейта:
//!
//! - [`BusConnector`]: установка нового соединения;
//! - [`BusSink`]: буферизованная запись команд;
//! - [`BusStream`]: чтение декодированных сообщений.
//!
//! `memory` содержит внутрипроцессную реализацию шины.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use busmux_error::MuxResult;

pub use memory::*;

/// Команда подписки, отправляемая в шину.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCommand {
    Subscribe(Vec<Bytes>),
    Unsubscribe(Vec<Bytes>),
    PSubscribe(Vec<Bytes>),
    PUnsubscribe(Vec<Bytes>),
}

/// Декодированное сообщение, прочитанное из шины.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    /// Подтверждение подписки на канал.
    Subscribe(Bytes),
    /// Подтверждение отписки от канала.
    Unsubscribe(Bytes),
    /// Подтверждение подписки на шаблон.
    PSubscribe(Bytes),
    /// Подтверждение отписки от шаблона.
    PUnsubscribe(Bytes),
    /// Сообщение, опубликованное в канал.
    Message { channel: Bytes, payload: Bytes },
    /// Сообщение, совпавшее с шаблоном.
    PMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
}

/// Живое соединение, разделённое на половины записи и чтения.
pub struct BusConnection {
    pub sink: Box<dyn BusSink>,
    pub stream: Box<dyn BusStream>,
}

/// Фабрика соединений с шиной.
#[async_trait]
pub trait BusConnector: Send + Sync + 'static {
    /// Устанавливает новое соединение.
    async fn connect(&self) -> MuxResult<BusConnection>;
}

/// Половина соединения для записи команд.
#[async_trait]
pub trait BusSink: Send {
    /// Буферизует одну команду.
    fn write_command(
        &mut self,
        command: &BusCommand,
    ) -> MuxResult<()>;

    /// Отправляет все буферизованные команды.
    async fn flush(&mut self) -> MuxResult<()>;

    /// Закрывает соединение. Ошибки закрытия игнорируются.
    async fn close(&mut self);
}

/// Половина соединения для чтения сообщений.
#[async_trait]
pub trait BusStream: Send {
    /// Читает следующее сообщение. Должен быть cancel-safe: отменённый
    /// вызов не теряет сообщений. Возвращает ошибку после потери
    /// соединения.
    async fn read(&mut self) -> MuxResult<BusMessage>;
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl BusCommand {
    /// Имя команды в протоколе.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "SUBSCRIBE",
            Self::Unsubscribe(_) => "UNSUBSCRIBE",
            Self::PSubscribe(_) => "PSUBSCRIBE",
            Self::PUnsubscribe(_) => "PUNSUBSCRIBE",
        }
    }

    /// Аргументы команды.
    pub fn args(&self) -> &[Bytes] {
        match self {
            Self::Subscribe(keys)
            | Self::Unsubscribe(keys)
            | Self::PSubscribe(keys)
            | Self::PUnsubscribe(keys) => keys,
        }
    }

    /// Проверяет, упоминает ли команда ключ `key`.
    pub fn mentions(
        &self,
        key: &[u8],
    ) -> bool {
        self.args().iter().any(|arg| arg.as_ref() == key)
    }
}

impl BusMessage {
    /// Тип сообщения в протоколе.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::PSubscribe(_) => "psubscribe",
            Self::PUnsubscribe(_) => "punsubscribe",
            Self::Message { .. } => "message",
            Self::PMessage { .. } => "pmessage",
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Общие реализации трейтов
////////////////////////////////////////////////////////////////////////////////

impl fmt::Display for BusCommand {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}", self.name())?;
        for arg in self.args() {
            write!(f, " {}", String::from_utf8_lossy(arg))?;
        }
        Ok(())
    }
}

impl fmt::Debug for BusConnection {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("BusConnection").finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_name_and_args() {
        let cmd = BusCommand::PSubscribe(vec![Bytes::from_static(b"news.*")]);
        assert_eq!(cmd.name(), "PSUBSCRIBE");
        assert_eq!(cmd.args(), &[Bytes::from_static(b"news.*")]);
        assert!(cmd.mentions(b"news.*"));
        assert!(!cmd.mentions(b"news"));
    }

    /// Тест проверяет, что Display перечисляет все ключи команды.
    #[test]
    fn test_command_display() {
        let cmd = BusCommand::Subscribe(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(cmd.to_string(), "SUBSCRIBE a b");
    }

    #[test]
    fn test_message_kind() {
        let msg = BusMessage::PMessage {
            pattern: Bytes::from_static(b"a*"),
            channel: Bytes::from_static(b"ab"),
            payload: Bytes::from_static(b"x"),
        };
        assert_eq!(msg.kind(), "pmessage");
        assert_eq!(BusMessage::Unsubscribe(Bytes::new()).kind(), "unsubscribe");
    }
}
