// converge CLI

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use parking_lot::Mutex;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use converge::config::EngineConfig;
use converge::executor::{HostConnector, Scheduler};
use converge::inventory::{Host, Inventory};
use converge::output::{ConvergeError, OutputFormat, OutputWriter};
use converge::parser::{parse_playbook_file, HostPattern, Playbook};
use converge::plugins::{create_callback_plugin, CallbackManager};

#[derive(Parser)]
#[command(
    name = "converge",
    about = "Converge groups of hosts to a declared state, phase by phase",
    version,
    disable_colored_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode - only show failures and the recap
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    output_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the hosts named by a run file
    Run {
        playbook: PathBuf,

        #[command(flatten)]
        targets: TargetArgs,

        /// Maximum hosts worked on at once within a phase
        #[arg(long)]
        forks: Option<usize>,

        /// Cancel the whole run at the first hard failure
        #[arg(long)]
        strict: bool,

        /// Report what would change without changing anything
        #[arg(short, long)]
        check: bool,

        /// Show differences for changed files
        #[arg(short = 'D', long)]
        diff: bool,

        /// Run every task with sudo
        #[arg(short = 's', long)]
        sudo: bool,

        /// SSH user (overrides inventory)
        #[arg(short, long)]
        user: Option<String>,

        /// Path to SSH private key
        #[arg(long)]
        private_key: Option<PathBuf>,

        /// Prompt for the SSH password
        #[arg(short = 'k', long)]
        ask_pass: bool,

        /// POST the JSON run summary here when the run ends
        #[arg(long)]
        webhook: Option<String>,

        /// Callback plugin (json_log:PATH, webhook:URL); repeatable
        #[arg(long = "callback")]
        callbacks: Vec<String>,

        /// Configuration file (default: ./converge.yml when present)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Parse a run file and report its phases
    Validate { playbook: PathBuf },

    /// Print the hosts each phase would target
    ListHosts {
        playbook: PathBuf,

        #[command(flatten)]
        targets: TargetArgs,
    },
}

#[derive(clap::Args)]
struct TargetArgs {
    /// Path to the inventory file
    #[arg(short, long)]
    inventory: Option<PathBuf>,

    /// Comma-separated host list (alternative to an inventory file)
    #[arg(short = 'H', long, conflicts_with = "inventory")]
    hosts: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            report_error(&e);
            1
        }
    };

    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Engine errors keep their own colored rendering; everything else gets the
/// anyhow context chain
fn report_error(e: &anyhow::Error) {
    match e.downcast_ref::<ConvergeError>() {
        Some(err) => eprintln!("{}", err),
        None => eprintln!("{} {:#}", "error:".red().bold(), e),
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let format = OutputFormat::from_str(&cli.output_format).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Run {
            playbook,
            targets,
            forks,
            strict,
            check,
            diff,
            sudo,
            user,
            private_key,
            ask_pass,
            webhook,
            callbacks,
            config,
        } => {
            let cwd = std::env::current_dir().context("cannot determine working directory")?;
            let mut engine = EngineConfig::discover(config.as_deref(), &cwd)
                .context("failed to load configuration")?;

            // Flags win over the file
            if let Some(forks) = forks {
                if forks == 0 {
                    bail!("--forks must be at least 1");
                }
                engine.forks = forks;
            }
            engine.strict |= strict;
            engine.check |= check;
            engine.diff |= diff;
            engine.sudo |= sudo;
            if user.is_some() {
                engine.ssh.user = user;
            }
            if private_key.is_some() {
                engine.ssh.private_key = private_key;
            }
            if ask_pass {
                engine.ssh.password = Some(prompt_password("SSH Password: ")?);
            }
            if webhook.is_some() {
                engine.webhook = webhook;
            }
            engine.callbacks.extend(callbacks);

            run(&playbook, &targets, engine, format, cli.verbose > 0, cli.quiet).await
        }
        Commands::Validate { playbook } => {
            validate(&playbook)?;
            Ok(0)
        }
        Commands::ListHosts { playbook, targets } => {
            list_hosts(&playbook, &targets)?;
            Ok(0)
        }
    }
}

async fn run(
    playbook_path: &Path,
    targets: &TargetArgs,
    engine: EngineConfig,
    format: OutputFormat,
    verbose: bool,
    quiet: bool,
) -> Result<i32> {
    let playbook = parse_playbook_file(playbook_path)?;
    let inventory = resolve_inventory(targets, &playbook, engine.ssh.user.as_deref())?;

    let mut callbacks = CallbackManager::new();
    for spec in engine.callback_specs() {
        let plugin = create_callback_plugin(&spec)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("failed to load callback plugin '{}'", spec))?;
        callbacks.add(plugin);
    }

    info!(
        playbook = %playbook_path.display(),
        forks = engine.forks,
        strict = engine.strict,
        check = engine.check,
        "configured run"
    );

    let output = Arc::new(Mutex::new(OutputWriter::new(format, verbose, quiet)));
    let connector = Arc::new(HostConnector::new(engine.ssh_settings()));
    let scheduler = Scheduler::with_callbacks(
        engine.scheduler_config(),
        connector,
        output,
        Arc::new(callbacks),
    );

    let summary = scheduler.execute_playbook(&playbook, &inventory).await;
    Ok(summary.exit_code())
}

/// `--hosts`, else `--inventory`, else the control machine when every phase
/// targets localhost
fn resolve_inventory(
    targets: &TargetArgs,
    playbook: &Playbook,
    default_user: Option<&str>,
) -> Result<Inventory> {
    if let Some(ref hosts) = targets.hosts {
        return Ok(Inventory::from_cli_hosts(hosts, default_user));
    }

    if let Some(ref path) = targets.inventory {
        let mut inventory = Inventory::from_file(path)?;
        if default_user.is_some() {
            inventory.default_user = default_user.map(str::to_string);
        }
        return Ok(inventory);
    }

    let local_only = playbook
        .phases
        .iter()
        .all(|p| matches!(&p.hosts, HostPattern::Group(name) if name == "localhost"));
    if local_only {
        debug!("no inventory given, running against localhost");
        let mut inventory = Inventory::new();
        inventory.add_host(Host::localhost());
        return Ok(inventory);
    }

    Err(ConvergeError::Inventory {
        message: "No inventory source provided".to_string(),
        suggestion: Some(
            "Use --inventory/-i to name an inventory file or --hosts/-H for a comma-separated host list"
                .to_string(),
        ),
    }
    .into())
}

fn validate(playbook_path: &Path) -> Result<()> {
    let playbook = parse_playbook_file(playbook_path)?;

    println!("{} {} is valid", "✓".green(), playbook_path.display());
    println!();
    for (i, phase) in playbook.phases.iter().enumerate() {
        println!(
            "  {} {} {}",
            format!("{}.", i + 1).dimmed(),
            phase.name.white().bold(),
            format!("[hosts: {}]", phase.hosts).dimmed()
        );
        println!(
            "     {} {}  {} {}",
            "Tasks:".dimmed(),
            phase.tasks.len(),
            "Handlers:".dimmed(),
            phase.handlers.len()
        );
    }
    println!();
    println!(
        "  {} phases, {} tasks, {} handlers",
        playbook.phases.len(),
        playbook.task_count(),
        playbook.handler_count()
    );

    Ok(())
}

fn list_hosts(playbook_path: &Path, targets: &TargetArgs) -> Result<()> {
    let playbook = parse_playbook_file(playbook_path)?;
    let inventory = resolve_inventory(targets, &playbook, None)?;

    for phase in &playbook.phases {
        let hosts = inventory.get_hosts(&phase.hosts);
        println!(
            "{} {} ({} hosts)",
            "PHASE".yellow().bold(),
            phase.name,
            hosts.len()
        );
        for host in hosts {
            println!("  {} {}", "•".cyan(), host.name);
        }
    }

    Ok(())
}

fn prompt_password(prompt: &str) -> Result<String> {
    // Prompt on stderr so it shows even with stdout redirected
    eprint!("{}", prompt.cyan());
    io::stderr().flush().ok();

    let password = rpassword::read_password().context("failed to read password")?;
    let password = password.trim_end_matches(['\r', '\n']).to_string();
    eprintln!();

    if password.is_empty() {
        bail!("password cannot be empty");
    }
    Ok(password)
}
