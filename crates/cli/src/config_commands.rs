use std::path::Path;

use {anyhow::Result, clap::Subcommand};

use cadence_config::validate::{self, Severity, ValidationResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration as TOML.
    Show,
}

pub fn handle_config(action: ConfigAction, path: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(path, verbose),
        ConfigAction::Show => show(path),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(cadence_config::find_config_file);

    let result = match &path {
        Some(path) if path.extension().is_some_and(|ext| ext == "toml") => {
            eprintln!("Checking {}\n", path.display());
            validate::validate_file(path)
        },
        Some(path) => {
            eprintln!("Checking {}\n", path.display());
            let config = cadence_config::load_config(path)?;
            validate::validate(&config)
        },
        None => {
            eprintln!("No config file found; checking defaults.\n");
            validate::validate(&cadence_config::CadenceConfig::default())
        },
    };

    report(&result, verbose);

    if result.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &ValidationResult, verbose: bool) {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
}

fn show(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(path) => cadence_config::load_config(path)?,
        None => cadence_config::discover_and_load(),
    };
    let config = cadence_config::apply_env_overrides(config);
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
