// src/lib.rs
pub mod config;
pub mod conn;
pub mod connection;
pub mod date;
pub mod docroot;
pub mod error;
pub mod grammar;
pub mod http;
pub mod inbox;
pub mod logging;
pub mod metrics;
pub mod response;
pub mod server;
pub mod slab;
pub mod syscalls;
pub mod upgrade;
pub mod websocket;
pub mod worker;

// Re-exports for users
pub use config::{Config, LogFormat};
pub use connection::{ConnId, Connection, State, StateObserver, UpgradeRequest};
pub use docroot::DocRoot;
pub use error::{FerryError, FerryResult, HttpError};
pub use http::{Method, Status};
pub use metrics::MetricsSnapshot;
pub use server::{Server, ServerHandle};
pub use upgrade::{Handoff, UpgradeDispatcher};
pub use websocket::{PrefixedStream, WebSocketHandler};

pub use tungstenite::Message;
