use clap::{Parser, Subcommand};
use std::process;

mod commands;
mod output;

use commands::{checkpoint, replicate, serve, sync, tree};

/// Freightliner - replicate container images between OCI registries
#[derive(Parser)]
#[command(name = "freightliner")]
#[command(author = "Freightliner Contributors")]
#[command(version)]
#[command(about = "Replicate container images between OCI-compliant registries", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Emit machine-readable JSON instead of summaries
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a single repository between registries
    #[command(visible_alias = "r")]
    Replicate(replicate::ReplicateArgs),

    /// Replicate a whole tree of repositories
    #[command(name = "replicate-tree", visible_alias = "rt")]
    ReplicateTree(tree::TreeArgs),

    /// Run a batch sync from a YAML spec
    Sync(sync::SyncArgs),

    /// Checkpoint lifecycle management
    #[command(subcommand)]
    Checkpoint(checkpoint::CheckpointCommands),

    /// Start the clustered replication service
    Serve(serve::ServeArgs),

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Handle color output
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Execute command; commands return their exit code so partial
    // failures surface without an Err
    let result = match cli.command {
        Commands::Replicate(args) => replicate::execute(args, cli.json).await,
        Commands::ReplicateTree(args) => tree::execute(args, cli.json).await,
        Commands::Sync(args) => sync::execute(args, cli.json).await,
        Commands::Checkpoint(cmd) => checkpoint::execute(cmd, cli.json).await,
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(0)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            if cli.verbose {
                eprintln!("\nCaused by:");
                for cause in e.chain().skip(1) {
                    eprintln!("  {cause}");
                }
            }
            process::exit(1);
        }
    }
}

fn generate_completions(shell: clap_complete::Shell) {
    use clap::CommandFactory;
    use clap_complete::generate;
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();
    generate(shell, &mut cmd, bin_name, &mut io::stdout());
}
