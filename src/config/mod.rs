pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_async_io_enabled() -> bool {
    true
}

fn default_fuse_ttl_secs() -> u64 {
    1
}

fn default_fs_name() -> String {
    "convergefs".to_string()
}
