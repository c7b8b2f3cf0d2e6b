//! CLI command implementations

pub mod config;
pub mod list;
pub mod serve;

pub use config::execute as config;
pub use list::execute as list;
pub use serve::execute as serve;
