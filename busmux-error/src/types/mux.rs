use std::{any::Any, fmt, time::Duration};

use thiserror::Error;

use crate::{ErrorExt, StatusCode};

/// Вид подписки, на которой была выполнена операция.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
    Promise,
}

/// Ошибки использования мультиплексора и подписок.
///
/// Возвращаются вызывающей стороне синхронно. Ошибки соединения сюда не
/// попадают: они остаются внутри менеджера соединения и доходят до
/// подписчиков только как уведомление `on_disconnect`.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// Мультиплексор уже закрыт.
    #[error("tried to use a closed multiplexer")]
    MultiplexerClosed,
    /// Подписка уже закрыта (в том числе повторный `close`).
    #[error("tried to use a closed {kind}")]
    SubscriptionClosed { kind: SubscriptionKind },
    /// Promise запрошен до подтверждения подписки на шаблон.
    #[error("the promise subscription for prefix '{prefix}' is inactive")]
    InactiveSubscription { prefix: String },
    /// Истёк срок ожидания promise.
    #[error("promise on channel '{channel}' timed out after {timeout:?}")]
    Timeout { channel: String, timeout: Duration },
    /// Соединение разорвано, пока promise ожидал сообщение.
    #[error("promise on channel '{channel}' interrupted by disconnect: {reason}")]
    Disconnected { channel: String, reason: String },
}

impl fmt::Display for SubscriptionKind {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Self::Channel => write!(f, "ChannelSubscription"),
            Self::Pattern => write!(f, "PatternSubscription"),
            Self::Promise => write!(f, "PromiseSubscription"),
        }
    }
}

impl ErrorExt for MuxError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MultiplexerClosed => StatusCode::MultiplexerClosed,
            Self::SubscriptionClosed { .. } => StatusCode::SubscriptionClosed,
            Self::InactiveSubscription { .. } => StatusCode::InactiveSubscription,
            Self::Timeout { .. } => StatusCode::Timeout,
            Self::Disconnected { .. } => StatusCode::Disconnected,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn metrics_tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![
            ("error_type", "mux".to_string()),
            ("status_code", self.status_code().to_string()),
        ];

        match self {
            Self::SubscriptionClosed { kind } => {
                tags.push(("subscription", kind.to_string()));
            }
            Self::Timeout { channel, .. } | Self::Disconnected { channel, .. } => {
                tags.push(("channel", channel.clone()));
            }
            Self::InactiveSubscription { prefix } => {
                tags.push(("prefix", prefix.clone()));
            }
            Self::MultiplexerClosed => {}
        }

        tags
    }
}
