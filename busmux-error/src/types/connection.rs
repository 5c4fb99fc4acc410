use std::{any::Any, io, time::Duration};

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Ошибки соединения с шиной.
///
/// Никогда не возвращаются вызывающей стороне напрямую: менеджер соединения
/// превращает их в протокол переподключения.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Не удалось установить соединение.
    #[error("failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },
    /// Таймаут установки соединения.
    #[error("connection attempt timed out after {timeout:?}")]
    ConnectTimeout { timeout: Duration },
    /// Соединение закрыто удалённой стороной.
    #[error("connection closed by the bus")]
    ConnectionClosed,
    /// Ошибка записи команды.
    #[error("failed to write command: {reason}")]
    WriteFailed { reason: String },
    /// Ошибка чтения сообщения.
    #[error("failed to read message: {reason}")]
    ReadFailed { reason: String },
    /// Ошибка ввода-вывода.
    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectFailed {
                address: String::new(),
                reason: err.to_string(),
            },
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Self::ReadFailed {
                reason: err.to_string(),
            },
            kind => Self::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl ErrorExt for ConnectionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::ConnectFailed { .. } => StatusCode::ConnectionFailed,
            Self::ConnectTimeout { .. } => StatusCode::ConnectTimeout,
            Self::ConnectionClosed => StatusCode::ConnectionClosed,
            Self::WriteFailed { .. } => StatusCode::WriteFailed,
            Self::ReadFailed { .. } => StatusCode::ReadFailed,
            Self::Io { kind, .. } if *kind == io::ErrorKind::TimedOut => StatusCode::Timeout,
            Self::Io { .. } => StatusCode::Io,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "connection".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        match self {
            Self::ConnectFailed { address, .. } => {
                tags.push(("address", address.clone()));
            }
            Self::Io { kind, .. } => {
                tags.push(("io_kind", format!("{kind:?}")));
            }
            _ => {}
        }

        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ConnectionError::ConnectionClosed.status_code(),
            StatusCode::ConnectionClosed
        );
        assert_eq!(
            ConnectionError::ConnectTimeout {
                timeout: Duration::from_secs(1)
            }
            .status_code(),
            StatusCode::ConnectTimeout
        );
        assert!(ConnectionError::WriteFailed {
            reason: "broken pipe".into()
        }
        .status_code()
        .is_retryable());
    }

    #[test]
    fn test_from_io_refused() {
        let err = ConnectionError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(matches!(err, ConnectionError::ConnectFailed { .. }));
    }
}
