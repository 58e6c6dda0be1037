use super::Workspace;
use crate::cli::LeasesCommands;
use crate::output::UserOutput;
use serde::Serialize;
use vm_ports::config::format_duration;
use vm_ports::port::LeaseStore;
use vm_ports::Machine;

/// Owner name used for stores opened by this command. It never acquires.
const INSPECTOR_OWNER: &str = "vmports-leases";

#[derive(Serialize)]
struct LeaseRow {
    machine: String,
    key: String,
    owner: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    age_secs: u64,
    expired: bool,
}

pub fn run_leases(
    ws: &Workspace,
    cmd: &LeasesCommands,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    match cmd {
        LeasesCommands::List { machine, json } => list(ws, machine.as_deref(), *json, out),
        LeasesCommands::Prune { machine } => prune(ws, machine.as_deref(), out),
    }
}

fn machines(ws: &Workspace, name: Option<&str>) -> anyhow::Result<Vec<Machine>> {
    let names: Vec<String> = name.map(str::to_string).into_iter().collect();
    Ok(ws.config.select_machines(&names, &ws.base)?)
}

fn store(ws: &Workspace, machine: &Machine) -> anyhow::Result<LeaseStore> {
    Ok(LeaseStore::for_machine(&machine.data_dir, INSPECTOR_OWNER)
        .with_ttl(ws.config.lease_ttl()?))
}

fn list(
    ws: &Workspace,
    machine: Option<&str>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    let mut rows = Vec::new();
    for machine in machines(ws, machine)? {
        for entry in store(ws, &machine)?.list()? {
            let age_secs = (now - entry.created_at).num_seconds().max(0) as u64;
            rows.push(LeaseRow {
                machine: machine.name.clone(),
                key: entry.key,
                owner: entry.owner,
                created_at: entry.created_at,
                age_secs,
                expired: entry.expired,
            });
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        out.status("No leases held");
        return Ok(());
    }

    out.status(&format!(
        "{:<16} {:<28} {:<40} {:>8}",
        "MACHINE", "KEY", "OWNER", "AGE"
    ));
    for row in &rows {
        out.status(&format!(
            "{:<16} {:<28} {:<40} {:>8}{}",
            row.machine,
            row.key,
            row.owner.as_deref().unwrap_or("-"),
            format_duration(std::time::Duration::from_secs(row.age_secs)),
            if row.expired { " (expired)" } else { "" }
        ));
    }
    Ok(())
}

fn prune(ws: &Workspace, machine: Option<&str>, out: &dyn UserOutput) -> anyhow::Result<()> {
    let mut total = 0;
    for machine in machines(ws, machine)? {
        let removed = store(ws, &machine)?.prune()?;
        if removed > 0 {
            out.status(&format!("{}: removed {} expired lease(s)", machine.name, removed));
        }
        total += removed;
    }
    out.success(&format!("Pruned {} expired lease(s)", total));
    Ok(())
}
