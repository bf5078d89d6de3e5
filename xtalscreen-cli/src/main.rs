use clap::{CommandFactory, Parser};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{debug, error, info, Instrument};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use uuid::Uuid;
use xtalscreen_core::ScreenConfig;
use xtalscreen_runner::{ProcessRunner, RunnerSettings, ScreenExecutor, ScreenRequest};

const LOG_FILE: &str = "xtalscreen.log";
const DEBUG_LOG_FILE: &str = "xtalscreen.debug.log";

const EXAMPLES: &str = "\
This program processes screening data from single crystal diffraction
experiments.

Examples:

  xtalscreen datablock.json

  xtalscreen *.cbf

  xtalscreen /path/to/data/

  xtalscreen /path/to/data/image0001.cbf:1:100
";

#[derive(Parser)]
#[command(name = "xtalscreen")]
#[command(about = "Quick screening of crystal diffraction data", long_about = None)]
#[command(after_help = EXAMPLES)]
struct Cli {
    /// Image files, an image directory, an image range (template:first:last)
    /// or a datablock JSON file
    inputs: Vec<String>,

    /// Number of processors to use (default: all available)
    #[arg(long)]
    nproc: Option<usize>,

    /// Configuration file (default: ./xtalscreen.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log every tool invocation and its output
    #[arg(long)]
    debug: bool,

    /// Only log to the console
    #[arg(long)]
    no_log_files: bool,
}

impl Cli {
    /// Accept a leading `nproc=N` argument in place of `--nproc N`
    fn take_legacy_nproc(&mut self) -> anyhow::Result<()> {
        let Some(value) = self.inputs.first().and_then(|arg| arg.strip_prefix("nproc=")) else {
            return Ok(());
        };
        let nproc: usize = value
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid processor count: {}", value))?;
        if nproc == 0 {
            anyhow::bail!("Processor count must be positive");
        }
        if self.nproc.is_none() {
            self.nproc = Some(nproc);
        }
        self.inputs.remove(0);
        Ok(())
    }
}

fn version_information() -> String {
    format!(
        "xtalscreen {} ({})",
        env!("CARGO_PKG_VERSION"),
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

fn init_logging(log_files: bool) -> anyhow::Result<()> {
    let console = fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    let (info_log, debug_log) = if log_files {
        let info_file = Arc::new(File::create(LOG_FILE)?);
        let debug_file = Arc::new(File::create(DEBUG_LOG_FILE)?);
        (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(info_file)
                    .with_filter(LevelFilter::INFO),
            ),
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(debug_file)
                    .with_filter(LevelFilter::DEBUG),
            ),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(console)
        .with(info_log)
        .with(debug_log)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    let version = version_information();
    cli.take_legacy_nproc()?;

    if cli.inputs.is_empty() {
        Cli::command().print_help()?;
        println!("\n{}", version);
        return Ok(());
    }

    init_logging(!cli.no_log_files)?;
    info!("{}", version);
    debug!(inputs = ?cli.inputs, "Run with arguments");

    let work_dir = std::env::current_dir()?;
    let config = ScreenConfig::load(cli.config.as_deref(), &work_dir)?;
    let debug = cli.debug || config.runner.debug;

    let runner = ProcessRunner::new(RunnerSettings::from(&config.runner));
    let executor = ScreenExecutor::new(runner)
        .with_work_dir(&work_dir)
        .with_debug(debug)
        .with_plot_config(config.plot);

    let run_id = Uuid::new_v4();
    let request = ScreenRequest {
        inputs: cli.inputs,
        nproc: cli.nproc,
        run_id: Some(run_id),
    };

    let span = tracing::info_span!("screen", run_id = %run_id);
    if let Err(e) = executor.execute(&request).instrument(span).await {
        error!("{}", e);
        process::exit(1);
    }
    Ok(())
}
