pub mod config;
pub mod events;
pub mod policy;
pub mod templates;
pub mod types;

pub use config::Config;
pub use events::{RunTimelineEvent, TimelineEventKind};
pub use types::*;
