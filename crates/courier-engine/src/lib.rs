pub mod conversation;
pub mod delivery;
pub mod error;
pub mod p2p;

pub use conversation::ConversationEngine;
pub use delivery::{DeliveryQueue, DeliverySink};
pub use error::{EngineError, EngineResult};
pub use p2p::P2pSessions;
