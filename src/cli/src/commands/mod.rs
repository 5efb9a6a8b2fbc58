//! CLI command definitions and dispatch.

mod save;

use clap::{Args, Parser, Subcommand};
use tarbox_core::TarboxConfig;
use tarbox_runtime::LocalImageEngine;

pub use save::{save, SaveArgs};

const SAVE_EXAMPLES: &str = "\
Examples:
  tarbox save --quiet -o myimage.tar imageID
  tarbox save --format docker-dir -o ubuntu-dir ubuntu
  tarbox save > alpine-all.tar alpine:latest";

/// Tarbox — export container images to portable archives.
#[derive(Parser)]
#[command(name = "tarbox", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Save image(s) to an archive
    #[command(after_help = SAVE_EXAMPLES)]
    Save(SaveArgs),
    /// Manage images
    Image(ImageArgs),
}

#[derive(Args)]
pub struct ImageArgs {
    #[command(subcommand)]
    pub command: ImageCommand,
}

/// `tarbox image` subcommands.
#[derive(Subcommand)]
pub enum ImageCommand {
    /// Save image(s) to an archive
    #[command(after_help = SAVE_EXAMPLES)]
    Save(SaveArgs),
}

/// Export engine over the configured image store.
pub(crate) fn open_engine(config: &TarboxConfig) -> LocalImageEngine {
    LocalImageEngine::new(config.storage.image_dir())
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: &TarboxConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Save(args) => save::execute(args, config).await,
        Command::Image(ImageArgs {
            command: ImageCommand::Save(args),
        }) => save::execute(args, config).await,
    }
}
