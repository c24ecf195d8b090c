//! Review command — show the persisted provisioning state.

use anyhow::{Context, Result};

use crate::app::AppContext;
use crate::domain::config::{PhaseStatus, SetupDocument};
use crate::phases::STANDARD_PHASES;

/// Show the setup document: network settings, server identity, and the
/// status of every phase. Read-only; never touches the host.
///
/// # Errors
///
/// Returns `ConfigError::NotFound` when no document exists yet, or a load
/// error for a corrupt or unsupported document.
pub fn run(ctx: &AppContext) -> Result<()> {
    let doc = ctx.store.load()?;

    if ctx.is_json() {
        let rendered =
            serde_json::to_string_pretty(&doc).context("serializing setup document")?;
        println!("{rendered}");
        return Ok(());
    }

    render_human(ctx, &doc);
    Ok(())
}

fn render_human(ctx: &AppContext, doc: &SetupDocument) {
    let out = &ctx.output;

    out.header("network");
    out.kv("subnet      ", &doc.network.vpn_subnet);
    out.kv("server ip   ", &doc.network.vpn_server_ip);
    out.kv("wg port     ", &doc.network.wireguard_port.to_string());
    out.kv("ssh port    ", &doc.network.ssh_port.to_string());
    out.kv("wg interface", &doc.network.wg_interface);

    out.header("server");
    out.kv(
        "hostname    ",
        doc.server.hostname.as_deref().unwrap_or("-"),
    );
    out.kv(
        "endpoint    ",
        doc.server.public_endpoint.as_deref().unwrap_or("-"),
    );
    out.kv(
        "wg pubkey   ",
        doc.server.wg_public_key.as_deref().unwrap_or("-"),
    );

    out.header("phases");
    for descriptor in STANDARD_PHASES {
        let status = doc.phase_status(descriptor.id);
        let mut value = status_label(status).to_string();
        if let Some(record) = doc.phases.get(&descriptor.id)
            && let Some(when) = record.finished_at.or(record.started_at)
        {
            value = format!("{value}  ({})", when.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        out.kv(
            &format!("{} {:16}", descriptor.id, descriptor.name),
            &value,
        );
    }
}

fn status_label(status: PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Pending => "pending",
        PhaseStatus::Running => "running",
        PhaseStatus::Completed => "completed",
        PhaseStatus::Failed => "failed",
        PhaseStatus::RolledBack => "rolled back",
    }
}
