//! Handler matching for metarelay: filter expressions, command templates,
//! and the registry that routes events to handlers.
//!
//! Everything here is pure. Filters and templates are validated when the
//! registry loads, so matching and expansion cannot fail at runtime.

pub mod filter;
pub mod registry;
pub mod template;

pub use filter::{Filter, FilterOp};
pub use registry::HandlerRegistry;
pub use template::{expand_command, Template};
