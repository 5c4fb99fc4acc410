//! Мультиплексор pub/sub.
//!
//! - `multiplexer`: точка входа, фабрики подписок и жизненный цикл.
//! - `connection` (приватный): задача соединения с переподключением.
//! - `registry` (приватный): свёрнутые ключи каналов и шаблонов.
//! - `callback`: набор callback'ов подписки и их исполнитель.
//! - `channel_subscription`, `pattern_subscription`,
//!   `promise_subscription`, `promise`: подписки для вызывающей стороны.
//! - `backoff`, `dispatch_list`: вспомогательные структуры.

pub mod backoff;
pub mod callback;
pub mod channel_subscription;
mod connection;
pub mod dispatch_list;
pub mod multiplexer;
pub mod pattern_subscription;
pub mod promise;
pub mod promise_subscription;
mod registry;

pub use backoff::Backoff;
pub(crate) use callback::CallbackBox;
pub use callback::Callbacks;
pub use channel_subscription::ChannelSubscription;
pub use connection::ConnectionState;
pub use dispatch_list::{DispatchList, EntryHandle};
pub use multiplexer::Multiplexer;
pub use pattern_subscription::PatternSubscription;
pub use promise::Promise;
pub use promise_subscription::PromiseSubscription;
pub(crate) use registry::{KeyKind, Outgoing, Registry};
