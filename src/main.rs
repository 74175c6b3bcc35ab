/*!
 * Ferry CLI
 */

use clap::{ArgAction, Args, Parser, Subcommand};
use ferry::config::parse_size;
use ferry::engine::CancelFlag;
use ferry::error::{EXIT_FAILURE, EXIT_SUCCESS, EXIT_USAGE};
use ferry::logging::init_logging;
use ferry::manifest::ManifestStore;
use ferry::progress::{LogSink, NoopSink, ProgressSink, TerminalSink};
use ferry::service::TransferService;
use ferry::TransferConfig;
use std::io::IsTerminal;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(version = ferry::VERSION)]
#[command(about = "Resumable parallel file transfer over SSH", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Transfer a file between local and remote hosts
    Transfer(TransferArgs),

    /// Show stored transfer manifests
    List,

    /// Remove stored manifests
    Clean {
        /// Task id to remove
        task: Option<String>,

        /// Remove every stored manifest
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args)]
struct TransferArgs {
    /// Source path (local or [user@]host:path)
    src: String,

    /// Destination path (local or [user@]host:path)
    dst: String,

    /// SSH port
    #[arg(short = 'P', long = "port")]
    port: Option<u16>,

    /// Preserve file mode bits
    #[arg(short = 'p')]
    preserve: bool,

    /// Verbose logging
    #[arg(short = 'v')]
    verbose: bool,

    /// Quiet mode
    #[arg(short = 'q')]
    quiet: bool,

    /// Enable compression
    #[arg(short = 'C')]
    compress: bool,

    /// Limit transfer rate (e.g. 1M, 500K)
    #[arg(short = 'l', long = "limit-rate")]
    limit_rate: Option<String>,

    /// Recursive transfer (not supported)
    #[arg(short = 'r')]
    recursive: bool,

    /// Resume from an existing manifest (default)
    #[arg(long = "resume", overrides_with = "no_resume", action = ArgAction::SetTrue)]
    resume: bool,

    /// Ignore any existing manifest
    #[arg(long = "no-resume", overrides_with = "resume", action = ArgAction::SetTrue)]
    no_resume: bool,

    /// Discard manifest and destination, restart from scratch
    #[arg(long)]
    force: bool,

    /// Number of parallel chunk workers
    #[arg(long, default_value_t = 4)]
    parallel: usize,

    /// Aggressive profile: 1 MiB chunks, up to 16 workers
    #[arg(long)]
    aria2: bool,

    /// Chunk count hint for aria2 mode
    #[arg(long, default_value_t = 32)]
    split: u32,

    /// Chunk size override (e.g. 4M, 512K)
    #[arg(long)]
    chunk: Option<String>,
}

fn main() {
    process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    match cli.command {
        Commands::Transfer(args) => run_transfer(args),
        Commands::List => run_list(),
        Commands::Clean { task, all } => run_clean(task.as_deref(), all),
    }
}

fn run_transfer(args: TransferArgs) -> i32 {
    init_logging(args.verbose, args.quiet);

    if args.recursive {
        eprintln!("Error: recursive transfer (-r) is not supported");
        return EXIT_USAGE;
    }

    let chunk_size = match args.chunk.as_deref().map(parse_size) {
        Some(None) => {
            eprintln!(
                "Error: invalid chunk size: {}",
                args.chunk.as_deref().unwrap_or_default()
            );
            return EXIT_USAGE;
        }
        Some(some) => some,
        None => None,
    };

    let limit_rate = match args.limit_rate.as_deref().map(parse_size) {
        Some(None) => {
            eprintln!(
                "Error: invalid rate limit: {}",
                args.limit_rate.as_deref().unwrap_or_default()
            );
            return EXIT_USAGE;
        }
        Some(some) => some,
        None => None,
    };

    let config = TransferConfig {
        resume: (args.resume || !args.no_resume) && !args.force,
        force: args.force,
        parallel: args.parallel,
        aria2: args.aria2,
        split: args.split,
        chunk_size,
        preserve_permissions: args.preserve,
        compress: args.compress,
        limit_rate,
        ssh_port: args.port.unwrap_or(22),
        ..Default::default()
    };

    let store = match ManifestStore::open_default() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FAILURE;
        }
    };

    let sink: Arc<dyn ProgressSink> = if args.quiet {
        Arc::new(NoopSink)
    } else if std::io::stderr().is_terminal() {
        Arc::new(TerminalSink::new())
    } else {
        Arc::new(LogSink::new())
    };

    let service = TransferService::new(store, sink);
    match service.transfer(&args.src, &args.dst, &config, CancelFlag::new()) {
        Ok(result) => {
            if !args.quiet {
                println!(
                    "Transferred {} bytes in {} chunks ({:.1}s)",
                    result.bytes_transferred,
                    result.chunks,
                    result.elapsed.as_secs_f64()
                );
                println!("sha256: {}", result.file_hash);
            }
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn run_list() -> i32 {
    init_logging(false, false);

    let store = match ManifestStore::open_default() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FAILURE;
        }
    };

    let service = TransferService::new(store, Arc::new(NoopSink));
    match service.list_tasks() {
        Ok(tasks) if tasks.is_empty() => {
            println!("No stored transfers.");
            EXIT_SUCCESS
        }
        Ok(tasks) => {
            for task in tasks {
                let percent = if task.file_size == 0 {
                    100.0
                } else {
                    task.completed_bytes as f64 * 100.0 / task.file_size as f64
                };
                println!(
                    "{}  {:?}  {:>5.1}%  {} -> {}",
                    &task.task_id[..16],
                    task.status,
                    percent,
                    task.src,
                    task.dst
                );
            }
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            EXIT_FAILURE
        }
    }
}

fn run_clean(task: Option<&str>, all: bool) -> i32 {
    init_logging(false, false);

    let store = match ManifestStore::open_default() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            return EXIT_FAILURE;
        }
    };

    let service = TransferService::new(store, Arc::new(NoopSink));
    match service.clean(task, all) {
        Ok(removed) => {
            println!("Removed {} manifest(s).", removed);
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}
