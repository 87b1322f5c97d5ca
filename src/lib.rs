pub mod config;
pub mod error;
pub mod vfs;

pub use config::get_config_path;
pub use config::load_config;
pub use config::validate_config;
pub use config::Config;

pub use error::{ConvergeError, Result};

pub use vfs::{ConvergenceFs, FileSystemOps, Mirror, MountOptions, Status};
