use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vmports")]
#[command(about = "Forwarded port collision detection and repair for local dev VMs")]
pub struct Cli {
    /// Config file path (defaults to vmports.yaml, searched upwards)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Working directory (defaults to the config file's directory)
    #[arg(short, long, global = true)]
    pub workdir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve forwarded ports for machines, repairing collisions
    Resolve {
        /// Machines to resolve (defaults to all, in config order)
        machines: Vec<String>,

        /// Fail on any collision instead of repairing
        #[arg(long)]
        no_repair: bool,

        /// Force a host port replacement, HOST:NEW (repeatable)
        #[arg(long, value_name = "HOST:NEW", value_parser = parse_remap)]
        remap: Vec<(u16, u16)>,

        /// Ignore ports remembered from earlier runs
        #[arg(long)]
        fresh: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Command to run while the resolved ports stay leased
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
    /// Inspect or clean up port leases
    #[command(subcommand)]
    Leases(LeasesCommands),
    /// Check whether a host port is accepting connections
    Probe {
        port: u16,

        /// Host address to probe (defaults to every interface)
        #[arg(long, value_name = "IP")]
        host_ip: Option<String>,
    },
    /// Validate the configuration file
    Validate,
}

#[derive(Subcommand)]
pub enum LeasesCommands {
    /// List lease markers
    List {
        /// Machine to inspect (defaults to all)
        machine: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete expired lease markers
    Prune {
        /// Machine to prune (defaults to all)
        machine: Option<String>,
    },
}

fn parse_remap(s: &str) -> Result<(u16, u16), String> {
    let (from, to) = s
        .split_once(':')
        .ok_or_else(|| format!("expected HOST:NEW, got '{}'", s))?;
    let from = from
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("invalid host port '{}': {}", from, e))?;
    let to = to
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("invalid replacement port '{}': {}", to, e))?;
    Ok((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_remap_pairs() {
        assert_eq!(parse_remap("2222:2200"), Ok((2222, 2200)));
        assert!(parse_remap("2222").is_err());
        assert!(parse_remap("a:1").is_err());
    }

    #[test]
    fn resolve_accepts_trailing_command() {
        let cli = Cli::try_parse_from([
            "vmports", "resolve", "web", "--remap", "2222:2200", "--", "echo", "hi",
        ])
        .unwrap();
        match cli.command {
            Commands::Resolve {
                machines,
                remap,
                command,
                ..
            } => {
                assert_eq!(machines, vec!["web"]);
                assert_eq!(remap, vec![(2222, 2200)]);
                assert_eq!(command, vec!["echo", "hi"]);
            }
            _ => panic!("expected resolve"),
        }
    }
}
