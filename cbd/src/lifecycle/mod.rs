pub mod engine;
pub mod hours;
pub mod outcome;

pub use engine::{Engine, EngineError};
pub use hours::HoursDecision;
pub use outcome::OutcomeClass;
