//! CLI argument parsing with clap derive

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::{AppContext, AppFlags, BehaviourFlags, OutputFlags};
use crate::commands;

/// Resumable WireGuard VPN provisioning for self-hosted servers
#[derive(Parser)]
#[command(
    name = "vpnforge",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Print debug-level detail
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip interactive prompts
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run provisioning phases
    Run(commands::run::RunArgs),

    /// Show provisioning state
    Review,

    /// Show version
    Version,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the command's error; `main` maps it to an exit code.
    pub async fn run(self) -> Result<()> {
        let Cli {
            json,
            quiet,
            no_color,
            verbose,
            yes,
            command,
        } = self;

        let flags = AppFlags {
            output: OutputFlags {
                no_color,
                quiet,
                json,
                verbose,
            },
            behaviour: BehaviourFlags { yes },
        };

        match command {
            Command::Version => {
                commands::version::run(json);
                Ok(())
            }
            Command::Run(args) => {
                let ctx = AppContext::new(&flags)?;
                commands::run::run(&ctx, &args).await
            }
            Command::Review => {
                let ctx = AppContext::new(&flags)?;
                commands::review::run(&ctx)
            }
        }
    }
}
