//! The conversation engine: turn loop, events, session registry, call parsing.

pub mod engine;
pub mod events;
pub mod registry;
pub mod tool_parser;
pub mod turn;

pub use engine::{Engine, EngineConfig};
pub use events::Event;
pub use registry::{RegistryError, SessionKey, SessionLease, SessionRegistry};
pub use turn::{RunFailure, RunFailureKind, RunOutcome, RunSuccess};
