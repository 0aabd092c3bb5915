use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use summon::cancel::CancelSignal;
use summon::config::SummonConfig;
use summon::engine::{Runner, Task};
use summon::interrupt::InterruptCoordinator;
use summon::plan;
use summon::process::ProcessRunner;
use summon::system::{FsType, System};
use summon::telemetry::init_telemetry;

const EXIT_CONFIG: u8 = 1;
const EXIT_RUN_FAILED: u8 = 3;

#[derive(Parser)]
#[command(name = "summon")]
#[command(about = "Provision and enter encrypted Arch Linux systems")]
#[command(long_about = "Summon partitions, encrypts, formats and installs a named system onto a disk, \
                       and opens and mounts existing systems to run commands inside them. \
                       Every step that sets something up is undone when the run ends, \
                       including after a failure or an interrupt.")]
struct Cli {
    /// System name; partitions are labelled `<name>-root`, `<name>-efi`, ...
    #[arg(short, long, global = true, default_value = "summon")]
    name: String,

    /// Root filesystem type (ext4 or btrfs); detected on mount when omitted
    #[arg(short, long = "fs", global = true)]
    fs_type: Option<FsType>,

    /// Configuration file (defaults to ./summon.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Partition, encrypt and install a new system onto a disk
    Create {
        /// Target disk, wiped completely
        #[arg(short, long)]
        disk: String,
        /// Also set the password for this user
        #[arg(short, long)]
        user: Option<String>,
        /// Create an encrypted swap partition
        #[arg(long)]
        swap: bool,
        /// Create OS X and recovery partitions
        #[arg(long)]
        enable_osx: bool,
    },
    /// Open and mount a system, then run a command with the terminal attached
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Copy files with rsync, preserving sparse files and extended attributes
    Backup {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Check that the package mirrors are reachable
    CheckInternet,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("summon: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let steps = match build_plan(&cli, &config) {
        Ok(steps) => steps,
        Err(err) => {
            eprintln!("summon: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let outcome = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| runtime.block_on(run(steps)));
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::from(EXIT_RUN_FAILED)
        }
    }
}

fn load_config(cli: &Cli) -> Result<SummonConfig> {
    SummonConfig::load_env_file()?;
    let mut config = SummonConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_telemetry(&config.logging)?;
    Ok(config)
}

fn build_plan(cli: &Cli, config: &SummonConfig) -> Result<Vec<Task>> {
    let runner = Arc::new(ProcessRunner);
    let sys = System::new(&cli.name, config.system.clone(), runner).with_fs_type(cli.fs_type);

    let steps = match &cli.command {
        Commands::Create {
            disk,
            user,
            swap,
            enable_osx,
        } => {
            let mut sys = sys
                .with_disk(disk.as_str())
                .with_osx(*enable_osx)
                .with_disk_password(config.credentials.disk_password()?);
            if *swap {
                sys = sys.with_swap();
            }
            let password = config.credentials.user_password()?.to_string();
            plan::create(Arc::new(sys), user.clone(), password)
        }
        Commands::Exec { command } => {
            let sys = sys.with_disk_password(config.credentials.disk_password()?);
            plan::exec(Arc::new(sys), command.clone())
        }
        Commands::Backup { args } => plan::backup(Arc::new(sys), args.clone()),
        Commands::CheckInternet => plan::check_internet(Arc::new(sys)),
    };
    Ok(steps)
}

async fn run(steps: Vec<Task>) -> Result<()> {
    let forward = CancelSignal::new();
    let cleanup = CancelSignal::new();
    let listener = InterruptCoordinator::new(forward.clone(), cleanup.clone()).install()?;

    info!(steps = steps.len(), "starting");
    let result = Runner::new(forward)
        .with_cleanup_signal(cleanup)
        .run_steps(&steps)
        .await;
    listener.abort();

    if let Err(err) = &result {
        error!(error = %err, "run failed");
    }
    Ok(result?)
}
