pub mod command_line;
pub mod path_processing;
pub mod text_processing;

pub use command_line::{CommandLineError, split_command_line};
pub use path_processing::expand_tilde;
pub use text_processing::{redact_sensitive, redact_sensitive_with};
