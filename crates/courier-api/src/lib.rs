pub mod auth;
pub mod conversations;
pub mod error;
pub mod keys;
pub mod messages;
pub mod middleware;
pub mod p2p;

pub use auth::{AppState, AppStateInner};
