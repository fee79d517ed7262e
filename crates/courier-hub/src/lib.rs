pub mod connection;
pub mod hub;

pub use connection::{HubServices, handle_connection_authenticated};
pub use hub::Hub;
