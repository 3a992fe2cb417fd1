pub mod manager;
pub mod messages;

pub use manager::StateManager;
pub use messages::{StateCommand, StateError, StateResponse};
