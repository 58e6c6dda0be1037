use crate::output::UserOutput;
use std::path::PathBuf;
use vm_ports::Parser as ConfigParser;

pub fn run_validate(config_path: Option<PathBuf>, out: &dyn UserOutput) -> anyhow::Result<()> {
    let parser = ConfigParser::new();
    let config_path = if let Some(path) = config_path {
        path
    } else {
        match parser.find_config_file() {
            Ok(path) => path,
            Err(_) => {
                out.error("Error: No configuration file found");
                out.error(&format!(
                    "\nSearched for vmports.yaml in:\n  - Current directory: {}\n  - Parent directories up to root",
                    std::env::current_dir()?.display()
                ));
                return Err(anyhow::anyhow!("Configuration file not found"));
            }
        }
    };

    out.status(&format!("Validating {}...", config_path.display()));

    let config = match parser.load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            out.error("Configuration failed to load");
            return Err(e.into());
        }
    };

    config.validate()?;

    out.success("Configuration is valid");
    out.blank();

    let range = config.usable_port_range;
    out.status(&format!(
        "Repair: {} (candidates {}-{})",
        if config.repair { "enabled" } else { "disabled" },
        range.start,
        range.end
    ));

    out.status(&format!("Machines: {}", config.machines.len()));
    for machine in &config.machines {
        let arbitrated = machine
            .forwarded_ports
            .iter()
            .filter(|r| r.is_arbitrated())
            .count();
        let auto_correct = machine
            .forwarded_ports
            .iter()
            .filter(|r| r.is_arbitrated() && r.auto_correct)
            .count();
        out.status(&format!(
            "  - {} ({} forwarded port(s), {} arbitrated, {} auto-correct)",
            machine.name,
            machine.forwarded_ports.len(),
            arbitrated,
            auto_correct
        ));
    }

    Ok(())
}
