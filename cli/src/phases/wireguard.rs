//! Phase 2: WireGuard server — keypair, interface config, ip forwarding,
//! service bring-up.
//!
//! The private key is read from `wg genkey`'s stdout and piped to
//! `wg pubkey` over stdin. It reaches disk only inside the 0600 interface
//! config; it never appears in any argument vector.

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::command_runner::{CommandRunner, CommandSpec};
use crate::domain::error::{SystemCommandError, ValidationError};
use crate::domain::validate;

use super::{PhaseContext, PhaseOutcome, classify_failure};

const RB_PRIOR_CONFIG: &str = "wireguard.prior_config";
const RB_CONFIG_ABSENT: &str = "wireguard.prior_config_absent";
const RB_IP_FORWARD: &str = "sysctl.ip_forward.prior";

pub async fn execute<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<PhaseOutcome> {
    match run(ctx).await {
        Ok(()) => Ok(PhaseOutcome::Success),
        Err(e) => classify_failure(e),
    }
}

async fn run<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let iface = validate::interface_name(&ctx.network.wg_interface)?;
    let server_ip = validate::ipv4_address(&ctx.network.vpn_server_ip)?;
    let subnet = validate::cidr(&ctx.network.vpn_subnet)?;
    let listen_port = validate::port(&ctx.network.wireguard_port.to_string())?;

    // Keypair. The private key travels stdout -> stdin, never argv.
    let genkey = ctx
        .runner
        .execute(&CommandSpec::new("wg").arg("genkey"))
        .await?
        .ensure_success("wg genkey")?;
    let private_key = genkey.stdout.trim().to_string();
    if !validate::is_wireguard_key(&private_key) {
        return Err(SystemCommandError {
            program: "wg genkey".to_string(),
            exit_code: 0,
            stderr: "output is not a WireGuard key".to_string(),
        }
        .into());
    }

    let pubkey = ctx
        .runner
        .execute(
            &CommandSpec::new("wg")
                .arg("pubkey")
                .secret_stdin(format!("{private_key}\n").into_bytes()),
        )
        .await?
        .ensure_success("wg pubkey")?;
    let public_key = pubkey.stdout.trim().to_string();
    if !validate::is_wireguard_key(&public_key) {
        return Err(SystemCommandError {
            program: "wg pubkey".to_string(),
            exit_code: 0,
            stderr: "output is not a WireGuard key".to_string(),
        }
        .into());
    }

    let config_path = config_path(ctx, &iface)?;

    // Snapshot pre-state before any mutation.
    if config_path.exists() {
        let prior = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        ctx.rollback.insert(RB_PRIOR_CONFIG.to_string(), prior);
    } else {
        ctx.rollback
            .insert(RB_CONFIG_ABSENT.to_string(), "true".to_string());
    }
    let prior_forward = ctx
        .runner
        .execute(&CommandSpec::new("sysctl").args(["-n", "net.ipv4.ip_forward"]))
        .await?
        .ensure_success("sysctl")?;
    ctx.rollback.insert(
        RB_IP_FORWARD.to_string(),
        prior_forward.stdout.trim().to_string(),
    );

    write_interface_config(&config_path, &server_ip, &subnet, &listen_port, &private_key)?;

    ctx.runner
        .execute(&CommandSpec::new("sysctl").args(["-w", "net.ipv4.ip_forward=1"]))
        .await?
        .ensure_success("sysctl")?;

    let unit = format!("wg-quick@{iface}");
    ctx.runner
        .execute(&CommandSpec::new("systemctl").args(["enable", &unit]))
        .await?
        .ensure_success("systemctl enable")?;
    ctx.runner
        .execute(&CommandSpec::new("systemctl").args(["start", &unit]))
        .await?
        .ensure_success("systemctl start")?;

    ctx.server.wg_public_key = Some(public_key);
    Ok(())
}

/// Re-check actual interface state instead of trusting exit codes: both the
/// wireguard view (`wg show`) and the kernel view (`ip link`) must agree.
pub async fn verify<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<bool> {
    let Ok(iface) = validate::interface_name(&ctx.network.wg_interface) else {
        return Ok(false);
    };
    let wg = ctx
        .runner
        .execute(&CommandSpec::new("wg").args(["show", &iface]))
        .await?;
    if !wg.succeeded {
        return Ok(false);
    }
    let link = ctx
        .runner
        .execute(&CommandSpec::new("ip").args(["link", "show", &iface]))
        .await?;
    Ok(link.succeeded)
}

pub async fn rollback<R: CommandRunner>(ctx: &mut PhaseContext<'_, R>) -> Result<()> {
    let Ok(iface) = validate::interface_name(&ctx.network.wg_interface) else {
        return Ok(());
    };
    let unit = format!("wg-quick@{iface}");
    // Service teardown first; failures here must not stop the file restore.
    let _ = ctx
        .runner
        .execute(&CommandSpec::new("systemctl").args(["stop", &unit]))
        .await;
    let _ = ctx
        .runner
        .execute(&CommandSpec::new("systemctl").args(["disable", &unit]))
        .await;

    if let Some(prior) = ctx.rollback.get(RB_IP_FORWARD) {
        let setting = format!("net.ipv4.ip_forward={}", prior.trim());
        let _ = ctx
            .runner
            .execute(&CommandSpec::new("sysctl").args(["-w", &setting]))
            .await;
    }

    let config_path = config_path(ctx, &iface)?;
    if let Some(prior) = ctx.rollback.get(RB_PRIOR_CONFIG) {
        write_owner_only(&config_path, prior)
            .with_context(|| format!("restoring {}", config_path.display()))?;
    } else if ctx.rollback.contains_key(RB_CONFIG_ABSENT) && config_path.exists() {
        std::fs::remove_file(&config_path)
            .with_context(|| format!("removing {}", config_path.display()))?;
    }
    Ok(())
}

fn config_path<R: CommandRunner>(
    ctx: &PhaseContext<'_, R>,
    iface: &str,
) -> Result<PathBuf, ValidationError> {
    validate::safe_path(&format!("{iface}.conf"), &ctx.paths.wireguard_dir)
}

fn write_interface_config(
    path: &std::path::Path,
    server_ip: &str,
    subnet: &str,
    listen_port: &str,
    private_key: &str,
) -> Result<()> {
    let prefix = subnet.split_once('/').map_or("24", |(_, p)| p);
    let content = format!(
        "[Interface]\n\
         Address = {server_ip}/{prefix}\n\
         ListenPort = {listen_port}\n\
         PrivateKey = {private_key}\n\
         SaveConfig = false\n"
    );
    write_owner_only(path, &content).with_context(|| format!("writing {}", path.display()))
}

/// Write `content` to `path` through a freshly-created mode-600 file,
/// removing any existing file first. The content must never be readable
/// through an inode with looser permissions, even transiently.
fn write_owner_only(path: &std::path::Path, content: &str) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(anyhow::Error::from(e)
                .context(format!("replacing {}", path.display())));
        }
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(content.as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
