use crate::output::UserOutput;
use vm_ports::port::{HostIp, PortProber, SystemProber};

/// Probe one port. Returns exit code 1 when the port is in use.
pub fn run_probe(port: u16, host_ip: Option<&str>, out: &dyn UserOutput) -> anyhow::Result<i32> {
    let host_ip = HostIp::parse_optional(host_ip).map_err(anyhow::Error::msg)?;
    let prober = SystemProber::new();

    if !prober.is_open(host_ip, port)? {
        out.success(&format!("Port {} on {} is free", port, host_ip));
        return Ok(0);
    }

    out.status(&format!("Port {} on {} is in use", port, host_ip));
    for holder in prober.holders(port) {
        out.status(&format!(
            "  PID {} ({}){}",
            holder.pid,
            holder.name,
            holder
                .command
                .as_deref()
                .map(|c| format!(": {}", c))
                .unwrap_or_default()
        ));
    }
    Ok(1)
}
