//! vpnforge - resumable WireGuard VPN provisioning for self-hosted servers

use clap::Parser;

use vpnforge_cli::cli::Cli;
use vpnforge_cli::domain::error::{error_code_label, exit_code_for};
use vpnforge_cli::output::json;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_mode = cli.json;
    if let Err(e) = cli.run().await {
        let code = exit_code_for(&e);
        if json_mode {
            match json::format_error(&format!("{e:#}"), error_code_label(code)) {
                Ok(obj) => eprintln!("{obj}"),
                Err(_) => eprintln!("Error: {e:#}"),
            }
        } else {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(code);
    }
}
