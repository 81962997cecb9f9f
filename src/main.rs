mod doctor;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use pipewright_core::config::PipewrightConfig;
use pipewright_flow::checkpoint::{CheckpointReader, CheckpointSelector};

#[derive(Parser)]
#[command(name = "pipewright", version, about = "Inspect and maintain pipeline checkpoints")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "pipewright.toml")]
    config: PathBuf,

    /// Checkpoint root directory (overrides the config file)
    #[arg(long, env = "PIPEWRIGHT_ROOT")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or clean up checkpoints
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointCmd,
    },
    /// Show current configuration
    Config,
    /// Run health checks against the config and checkpoint root
    Doctor,
}

#[derive(Subcommand)]
enum CheckpointCmd {
    /// List checkpoints of a flow, newest first
    List {
        flow: String,
    },
    /// Print a checkpoint
    Show {
        flow: String,
        /// Checkpoint name (default: latest)
        #[arg(long)]
        name: Option<String>,
        /// Also print the saved state
        #[arg(long)]
        state: bool,
    },
    /// Show reviewer edits that a resume would apply
    Diff {
        flow: String,
        /// Checkpoint name (default: latest)
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete all but the newest checkpoints of a flow
    Prune {
        flow: String,
        /// Number of checkpoint files to keep
        #[arg(long, default_value = "5")]
        keep: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("pipewright=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = PipewrightConfig::load_or_default(&cli.config)?;
    if let Some(root) = &cli.root {
        config.checkpoint.root_dir = root.to_string_lossy().into_owned();
    }
    info!(root = %config.checkpoint.root_path().display(), "Using checkpoint root");

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Doctor => {
            println!("Pipewright Doctor");
            println!("=================");
            doctor::run_doctor(&config);
        }
        Commands::Checkpoints { action } => {
            let reader = CheckpointReader::from_config(&config.checkpoint);
            handle_checkpoints(&reader, action)?;
        }
    }

    Ok(())
}

fn selector(name: Option<String>) -> CheckpointSelector {
    match name {
        Some(name) => CheckpointSelector::Named(name),
        None => CheckpointSelector::AutoDetect,
    }
}

fn handle_checkpoints(reader: &CheckpointReader, action: CheckpointCmd) -> anyhow::Result<()> {
    match action {
        CheckpointCmd::List { flow } => {
            let summaries = reader.list(&flow)?;
            if summaries.is_empty() {
                println!("No checkpoints for flow '{}'.", flow);
                return Ok(());
            }
            println!("Checkpoints for '{}':", flow);
            for s in summaries {
                let resumable = if s.can_resume { "resumable" } else { "incomplete" };
                println!(
                    "  {}  {:<20} next={:<16} keys={:<3} [{}]",
                    s.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    s.name,
                    s.next_action,
                    s.keys,
                    resumable
                );
            }
        }
        CheckpointCmd::Show { flow, name, state } => {
            let path = reader.resolve(&flow, &selector(name))?;
            let cp = reader.read_file(&path)?;
            println!("Path:        {}", path.display());
            println!("Checkpoint:  {}", cp.metadata.checkpoint_name);
            println!("Flow:        {}", cp.metadata.flow_name);
            println!("Saved:       {}", cp.metadata.timestamp.to_rfc3339());
            println!("Saved by:    {}", cp.metadata.node_class);
            println!("Format:      {}", cp.metadata.format_version);
            println!("Next action: {}", cp.recovery_info.next_action);
            println!("Resumable:   {}", cp.recovery_info.can_resume);
            if let Some(ref output) = cp.metadata.output_file {
                println!("Output file: {}", output);
            }
            if let Some(ref instruction) = cp.recovery_info.instruction {
                println!("Instruction: {}", instruction);
            }
            if state {
                println!();
                print!("{}", serde_yaml_ng::to_string(&cp.shared_state)?);
            }
        }
        CheckpointCmd::Diff { flow, name } => {
            let loaded = reader.load(&flow, &selector(name))?;
            for warning in &loaded.warnings {
                println!("warning: {}", warning);
            }
            match loaded.output_path {
                Some(ref p) => println!("Edits from {}", p.display()),
                None => println!("No output file; nothing to merge."),
            }
            if loaded.modifications.is_empty() {
                println!("No modifications.");
            }
            for m in &loaded.modifications {
                println!("  {}", m);
            }
        }
        CheckpointCmd::Prune { flow, keep } => {
            let removed = reader.prune(&flow, keep)?;
            for path in &removed {
                println!("  removed {}", path.display());
            }
            println!("{} file(s) removed.", removed.len());
        }
    }
    Ok(())
}
