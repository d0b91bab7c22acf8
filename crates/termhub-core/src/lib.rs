//! termhub-core: shared model and event hub for the terminal bridge.
//!
//! Provides the error taxonomy, identifiers, event and command types, the
//! reconciled context state, configuration sections and the [`EventBus`].

pub mod bus;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod ids;

// Re-export commonly used items at crate root.
pub use bus::{handler_fn, BusStats, EventBus, EventHandler, SubscriptionId};
pub use command::{Command, CommandFilter, CommandId, CommandStatus, SideEffect};
pub use config::{
    BridgeConfig, BusConfig, CommandPolicy, ContextConfig, SessionConfig, TerminalConfig,
};
pub use context::{ContextState, FileInfo};
pub use error::{BridgeError, BridgeResult};
pub use event::{
    ErrorKind, Event, EventDraft, EventFilter, EventKind, EventPayload, ExitInfo, HistoryQuery,
};
pub use ids::SessionId;
