//! Shared helpers used across the Runlane crates.

pub mod duration;
pub mod path_processing;
pub mod text_processing;

pub use duration::{DurationParseError, format_duration, parse_duration};
pub use path_processing::{default_config_dir, default_data_dir, expand_tilde};
pub use text_processing::{redact_sensitive, redact_sensitive_with};
