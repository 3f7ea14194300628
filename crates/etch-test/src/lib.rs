pub mod fs;
pub mod strategies;

pub use fs::{TemplateDir, create_file};
pub use scopeguard::defer;
