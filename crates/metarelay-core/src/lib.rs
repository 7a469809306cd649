//! Domain models, port traits, configuration, and error taxonomy shared
//! across the metarelay crates.
//!
//! The three ports (`EventStore`, `CloudEvents`, `HandlerDispatcher`) are
//! the seams the runtime is wired through; everything else here is plain
//! data and pure helpers.

pub mod config;
pub mod errors;
pub mod models;
pub mod payload;
pub mod ports;

pub use config::{load_config, CloudConfig, MetarelayConfig, DEFAULT_CONFIG_PATH};
pub use errors::{redact, CloudError, ConfigError, StoreError};
pub use models::{
    DispatchOutcome, DispatchRecord, Event, HandlerConfig, RepoConfig,
};
pub use payload::resolve_event_path;
pub use ports::{CloudEvents, EventStore, EventSubscription, HandlerDispatcher};
