pub mod artifacts;
pub mod config;
pub mod events;
pub mod keys;
pub mod types;

pub use artifacts::ScriptArtifact;
pub use config::Config;
pub use events::{Event, EventSink, EventType, MemorySink, SharedSink, TracingSink};
pub use keys::StoreKeys;
pub use types::*;
