mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use commands::{ResolveArgs, Workspace};
use output::{CliOutput, QuietOutput, UserOutput};
use vm_ports::port::ReleaseRegistry;
use vm_ports::Error as PortsError;

/// Exit code after Ctrl-C, matching shells (128 + SIGINT).
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    // Leases of in-flight passes are released before exiting on Ctrl-C.
    let registry = ReleaseRegistry::new();
    let interrupt_registry = registry.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            match interrupt_registry.release_all() {
                Ok(n) if n > 0 => tracing::info!("Released {} lease(s) after interrupt", n),
                Ok(_) => {}
                Err(e) => eprintln!("Failed to release leases: {}", e),
            }
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });

    // Passes block (lock backoff, probes), so keep them off the runtime.
    let result = tokio::task::spawn_blocking(move || run(cli, registry)).await;

    match result {
        Ok(Ok(code)) => std::process::exit(code),
        Ok(Err(e)) => {
            // Crate errors: print with suggestions
            if let Some(ports_error) = e.downcast_ref::<PortsError>() {
                eprintln!("Error: {}", ports_error);
                if let Some(suggestion) = ports_error.suggestion() {
                    eprintln!("\nHint: {}", suggestion);
                }
            } else {
                eprintln!("Error: {:#}", e);
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli, registry: ReleaseRegistry) -> anyhow::Result<i32> {
    // ── Commands that need NO config ──────────────────────────────────
    match &cli.command {
        Commands::Validate => {
            commands::run_validate(cli.config.clone(), &CliOutput)?;
            return Ok(0);
        }
        Commands::Probe { port, host_ip } => {
            return commands::run_probe(*port, host_ip.as_deref(), &CliOutput);
        }
        _ => {}
    }

    // ── Load config ───────────────────────────────────────────────────
    let ws = Workspace::load(cli.config.clone(), cli.workdir.clone())?;
    tracing::debug!(
        "Using {} (base {})",
        ws.config_path.display(),
        ws.base.display()
    );

    match cli.command {
        Commands::Resolve {
            machines,
            no_repair,
            remap,
            fresh,
            json,
            command,
        } => {
            let out: &dyn UserOutput = if json { &QuietOutput } else { &CliOutput };
            let args = ResolveArgs {
                machines,
                no_repair,
                remap,
                fresh,
                json,
                command,
            };
            commands::run_resolve(&ws, &args, registry, out)
        }
        Commands::Leases(ref cmd) => {
            let quiet = matches!(cmd, cli::LeasesCommands::List { json: true, .. });
            let out: &dyn UserOutput = if quiet { &QuietOutput } else { &CliOutput };
            commands::run_leases(&ws, cmd, out)?;
            Ok(0)
        }
        Commands::Validate | Commands::Probe { .. } => Ok(0),
    }
}

fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{}", e))
}
