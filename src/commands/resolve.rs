use super::Workspace;
use crate::output::UserOutput;
use anyhow::Context;
use std::process::Command;
use vm_ports::orchestrator::{begin_batch, Resolution};
use vm_ports::port::{Outcome, ReleaseRegistry, RemapTable};
use vm_ports::Orchestrator;

pub struct ResolveArgs {
    pub machines: Vec<String>,
    pub no_repair: bool,
    pub remap: Vec<(u16, u16)>,
    pub fresh: bool,
    pub json: bool,
    pub command: Vec<String>,
}

/// Resolve the selected machines. With a command, the command runs while
/// every resolved port is still leased and its exit code is returned.
pub fn run_resolve(
    ws: &Workspace,
    args: &ResolveArgs,
    registry: ReleaseRegistry,
    out: &dyn UserOutput,
) -> anyhow::Result<i32> {
    let config = &ws.config;
    let machines = config.select_machines(&args.machines, &ws.base)?;
    if machines.is_empty() {
        out.warning("No machines configured");
        return Ok(0);
    }

    let mut options = config.pass_options()?;
    if args.no_repair {
        options.repair = false;
    }
    let cli_remap: RemapTable = args.remap.iter().copied().collect();
    options.remap.extend(&cli_remap);

    let orchestrator = Orchestrator::new()
        .with_retry(config.retry_policy()?)
        .with_lease_ttl(config.lease_ttl()?)
        .with_registry(registry)
        .remember_assignments(!args.fresh);

    out.status(&format!("Resolving {} machine(s)...", machines.len()));
    let batch = begin_batch(&orchestrator, &machines, &options)?;

    for resolution in batch.resolutions() {
        for notice in &resolution.notices {
            out.notice(&resolution.machine, notice);
        }
    }

    if args.command.is_empty() {
        let resolutions = batch.finish(true)?;
        print_resolutions(&resolutions, args.json, out)?;
        return Ok(0);
    }

    let resolutions: Vec<Resolution> = batch.resolutions().cloned().collect();
    let status = Command::new(&args.command[0])
        .args(&args.command[1..])
        .envs(port_env_vars(&resolutions))
        .status()
        .with_context(|| format!("Failed to run '{}'", args.command[0]));

    let code = match &status {
        Ok(status) => status.code().unwrap_or(1),
        Err(_) => 1,
    };
    let finished = batch.finish(code == 0);
    let status = status?;
    finished?;

    if !status.success() {
        out.warning(&format!("'{}' exited with status {}", args.command[0], code));
    }
    Ok(code)
}

fn print_resolutions(
    resolutions: &[Resolution],
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(resolutions)?);
        return Ok(());
    }

    for resolution in resolutions {
        out.blank();
        out.status(&format!("{}:", resolution.machine));
        for rule in &resolution.rules {
            let note = match rule.outcome {
                Outcome::Unchanged => String::new(),
                Outcome::Remapped { from } => format!(" (remapped from {})", from),
                Outcome::Repaired { from } => format!(" (repaired, was {})", from),
                Outcome::Skipped => " (not arbitrated)".to_string(),
            };
            out.status(&format!(
                "  {:<12} {}:{} -> guest {}/{}{}",
                rule.id(),
                rule.rule.host_ip,
                rule.host_port,
                rule.rule.guest_port,
                rule.rule.protocol,
                note
            ));
        }
    }
    Ok(())
}

/// `VMPORTS_<MACHINE>_<ID>_HOST_PORT` for every rule. With a single machine,
/// `VMPORTS_<ID>_HOST_PORT` is set as well.
pub fn port_env_vars(resolutions: &[Resolution]) -> Vec<(String, String)> {
    let single = resolutions.len() == 1;
    let mut vars = Vec::new();
    for resolution in resolutions {
        let machine = env_segment(&resolution.machine);
        for rule in &resolution.rules {
            let id = env_segment(&rule.id());
            let port = rule.host_port.to_string();
            vars.push((
                format!("VMPORTS_{}_{}_HOST_PORT", machine, id),
                port.clone(),
            ));
            if single {
                vars.push((format!("VMPORTS_{}_HOST_PORT", id), port));
            }
        }
    }
    vars
}

fn env_segment(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
