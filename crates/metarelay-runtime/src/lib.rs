//! The metarelay runtime: per-repo relay workers, the daemon state
//! machine, and the append-only event journal.

pub mod daemon;
pub mod journal;

pub use daemon::Daemon;
pub use journal::EventJournal;
