//! Output rendering for podtail
//!
//! Log events are written in one of a fixed set of formats; the dry-run
//! listing is printed as an aligned table.

mod table;
mod theme;
mod writer;

pub use table::write_sources;
pub use theme::Theme;
pub use writer::{OutputFormat, Writer};
