/// Bus collaborator contract and the in-memory bus.
pub mod bus;
/// Multiplexer configuration loading.
pub mod config;
/// Structured logging (formatting, filters, sinks).
pub mod logging;
/// Multiplexer, subscriptions and promises.
pub mod pubsub;

// -----------------------------------------------------------------------------
//  Frequently used public types
// -----------------------------------------------------------------------------

/// Bus traits, commands, messages and the in-memory bus.
pub use bus::{BusCommand, BusConnection, BusConnector, BusMessage, BusSink, BusStream, MemoryBus};
/// Error system shared by the whole crate.
pub use busmux_error::{
    CallbackError, ConnectionError, ErrorExt, MuxError, MuxResult, StackError, StatusCode,
    SubscriptionKind,
};
/// config
pub use config::MultiplexerConfig;
/// Logging initialisation.
pub use logging::{init_logging, LoggingConfig, LoggingHandle};
/// Multiplexer and subscriptions.
pub use pubsub::{
    Backoff, Callbacks, ChannelSubscription, ConnectionState, Multiplexer, PatternSubscription,
    Promise, PromiseSubscription,
};
