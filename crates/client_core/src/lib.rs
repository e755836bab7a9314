//! Client side of the real-time Kanban board.

pub mod board;
pub mod channel;
pub mod config;
pub mod drag;
pub mod error;
pub mod reconcile;
pub mod rest;
pub mod store;

pub use board::{BoardHandle, BoardNotice, BoardView};
pub use channel::{
    Channel, ChannelProvider, ChannelTransport, ReconnectPolicy, Subscription, WsTransport,
};
pub use config::{load_settings, RollbackPolicy, Settings};
pub use drag::{DragGesture, DropLocation};
pub use error::{ApiFailure, BoardError, ChannelError};
pub use rest::{AuthSession, HttpApi, SessionSignal, TaskApi};
pub use store::BoardSnapshot;
