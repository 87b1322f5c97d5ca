pub mod args;

pub use args::{Args, Commands, ConfigAction, MountArgs};
