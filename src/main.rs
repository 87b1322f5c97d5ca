use clap::Parser;

mod cli;
mod commands;

use cli::{Args, Commands};
use commands::effective_config;
use convergefs::error;

fn main() {
    match run() {
        Ok(code) => {
            std::process::exit(code);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> error::Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("CONVERGEFS_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_file = args.config.as_deref();

    match args.command {
        Commands::Mount { mount_point, roots } => {
            let config = effective_config(config_file, &roots)?;
            commands::run_mount(&mount_point, &config)?;
            Ok(0)
        }
        Commands::Tree { roots, json } => {
            let config = effective_config(config_file, &roots)?;
            commands::print_tree(&config, json)?;
            Ok(0)
        }
        Commands::Resolve {
            virtual_path,
            roots,
        } => {
            let config = effective_config(config_file, &roots)?;
            commands::print_resolution(&config, &virtual_path)?;
            Ok(0)
        }
        Commands::Config { action } => {
            commands::handle_config_command(action, config_file)?;
            Ok(0)
        }
    }
}
