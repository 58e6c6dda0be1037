use vm_ports::port::RepairNotice;

/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// output can be suppressed (`--json`, quiet runs) without touching the
/// commands themselves.
pub trait UserOutput: Send + Sync {
    /// Informational status message (e.g., "Resolving 2 machine(s)...")
    fn status(&self, message: &str);

    /// Success message (e.g., "Configuration is valid")
    fn success(&self, message: &str);

    /// Warning message (e.g., "Failed to release leases")
    fn warning(&self, message: &str);

    /// Error message
    fn error(&self, message: &str);

    /// A repaired port collision for `machine`.
    fn notice(&self, machine: &str, notice: &RepairNotice);

    /// A blank line separator.
    fn blank(&self);
}

/// Standard CLI output: writes to stdout/stderr with ANSI colors.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("{}", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn notice(&self, machine: &str, notice: &RepairNotice) {
        eprintln!("\x1b[33m==> {}: {}\x1b[0m", machine, notice);
    }

    fn blank(&self) {
        println!();
    }
}

/// Suppresses all output. Used when stdout carries JSON.
pub struct QuietOutput;

impl UserOutput for QuietOutput {
    fn status(&self, _message: &str) {}
    fn success(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
    fn notice(&self, _machine: &str, _notice: &RepairNotice) {}
    fn blank(&self) {}
}
