use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "convergefs")]
#[command(
    about = "Merge a writable directory and read-only virtual folders into one union filesystem"
)]
pub struct Args {
    #[arg(long, global = true, help = "Config file to use instead of the default location")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Root selection shared by every command that builds a union.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct MountArgs {
    #[arg(long, help = "Writable root; new files land here")]
    pub write_target: Option<PathBuf>,

    #[arg(
        long = "folder",
        help = "Read-only root; repeat to add more, later ones take priority"
    )]
    pub folders: Vec<PathBuf>,

    #[arg(long, help = "Serve reads and writes synchronously")]
    pub no_async: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Mount the union and serve it until Ctrl-C")]
    Mount {
        #[arg(help = "Directory to mount the union on")]
        mount_point: PathBuf,

        #[command(flatten)]
        roots: MountArgs,
    },
    #[command(about = "Build the union tree and print it")]
    Tree {
        #[command(flatten)]
        roots: MountArgs,

        #[arg(long, help = "JSON output")]
        json: bool,
    },
    #[command(about = "Print the physical path and owning root of a virtual path")]
    Resolve {
        #[arg(help = "Path inside the union, e.g. /docs/readme.txt")]
        virtual_path: String,

        #[command(flatten)]
        roots: MountArgs,
    },
    #[command(about = "Manage configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    #[command(about = "Show current configuration values")]
    Show,
    #[command(about = "Show config file path")]
    Path,
}
