//! Command-line runner for keyweave macro scripts.
//!
//! Scripts run against the dry-run driver: every key and mouse primitive is
//! recorded and logged instead of injected, which makes the CLI a checker
//! and debugger for scripts as much as a runner.
//!
//! # Usage
//!
//! ```bash
//! # Run a script (text or JSON envelope)
//! keyweave run farm.kw
//!
//! # Run twice as fast, three times over
//! keyweave run farm.kw --speed 2 --iterations 3
//!
//! # Step through from line 12
//! keyweave run farm.kw --break 12
//!
//! # Check syntax and lint warnings
//! keyweave check farm.kw
//!
//! # Wrap a text script in the JSON envelope
//! keyweave pack farm.kw -o farm.json --speed 1.5
//!
//! # Turn a JSON-lines recording into a script
//! keyweave convert recording.jsonl -o recorded.kw
//! ```

mod host;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::{Parser, Subcommand};
use keyweave_core::config::KeyweaveConfig;
use keyweave_core::context::ExecutionContext;
use keyweave_core::dry_run::DryRunDriver;
use keyweave_core::executor::{MacroExecutor, RunOptions, RunStatus};
use keyweave_core::log::{LogEntry, LogLevel};
use keyweave_core::parser::{lint, ScriptParser, Severity};
use keyweave_core::recorder::{RecorderError, ScriptRecorder};
use keyweave_core::script_file::{self, MacroFile, ScriptFileError};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::host::{debug_console, Terminal, TerminalHost};

/// Run, check and convert keyweave macro scripts.
#[derive(Parser)]
#[command(name = "keyweave")]
#[command(about = "Run, check and convert keyweave macro scripts")]
#[command(version)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Write tracing output to this file instead of stderr
    #[arg(long, global = true, env = "KEYWEAVE_LOG_FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script on the dry-run driver
    Run {
        /// Script file (plain text or JSON envelope)
        file: PathBuf,
        /// Speed multiplier (overrides the file and the config)
        #[arg(short, long)]
        speed: Option<f64>,
        /// Number of times to run the script
        #[arg(short = 'n', long)]
        iterations: Option<u32>,
        /// Enable step debugging
        #[arg(short, long)]
        debug: bool,
        /// Set a breakpoint on a line (implies --debug)
        #[arg(short = 'b', long = "break", value_name = "LINE")]
        breakpoints: Vec<usize>,
        /// Print debug-level run messages
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check a script for syntax errors and warnings
    Check {
        /// Script file (plain text or JSON envelope)
        file: PathBuf,
    },

    /// Wrap a script in the JSON envelope
    Pack {
        /// Script file to pack
        file: PathBuf,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Speed stored in the envelope
        #[arg(short, long)]
        speed: Option<f64>,
        /// Iterations stored in the envelope
        #[arg(short = 'n', long)]
        iterations: Option<u32>,
    },

    /// Convert a JSON-lines input recording to a script
    Convert {
        /// Path to the recording (reads from stdin if omitted)
        recording: Option<PathBuf>,
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the configuration file and its values
    Config {
        /// Write the current values to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::from(4);
        }
    };
    let result = runtime.block_on(run(cli));
    // A pending stdin read would otherwise hold shutdown until Enter.
    runtime.shutdown_background();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

fn init_tracing(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let file_target = log_file.and_then(|path| {
        let name = path.file_name()?.to_owned();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Some((dir, name))
    });

    match file_target {
        Some((dir, name)) => {
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

#[derive(Debug)]
enum CliError {
    /// The run was stopped or crashed.
    RunFailed(String),
    Syntax(String),
    /// The input file is not a valid script or recording.
    BadInput(String),
    Io(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::RunFailed(_) => ExitCode::from(1),
            CliError::Syntax(_) => ExitCode::from(2),
            CliError::BadInput(_) => ExitCode::from(3),
            CliError::Io(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::RunFailed(msg) => write!(f, "Run failed: {}", msg),
            CliError::Syntax(msg) => write!(f, "Syntax error: {}", msg),
            CliError::BadInput(msg) => write!(f, "Invalid input: {}", msg),
            CliError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl From<ScriptFileError> for CliError {
    fn from(e: ScriptFileError) -> Self {
        match e {
            ScriptFileError::Io(e) => CliError::Io(e.to_string()),
            other => CliError::BadInput(other.to_string()),
        }
    }
}

impl From<RecorderError> for CliError {
    fn from(e: RecorderError) -> Self {
        match e {
            RecorderError::Io(e) => CliError::Io(e.to_string()),
            other => CliError::BadInput(other.to_string()),
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let format = cli.format;
    match cli.command {
        Command::Run {
            file,
            speed,
            iterations,
            debug,
            breakpoints,
            verbose,
        } => {
            let options = RunArgs {
                speed,
                iterations,
                debug: debug || !breakpoints.is_empty(),
                breakpoints,
                verbose,
            };
            run_script(&file, options, format).await
        }
        Command::Check { file } => check_script(&file, format),
        Command::Pack {
            file,
            output,
            speed,
            iterations,
        } => pack_script(&file, output.as_deref(), speed, iterations),
        Command::Convert { recording, output } => {
            let script = match recording {
                Some(path) => ScriptRecorder::convert_file(&path)?,
                None => ScriptRecorder::convert_stdin()?,
            };
            write_output(output.as_deref(), &(script + "\n"))
        }
        Command::Config { init } => show_config(init, format),
    }
}

struct RunArgs {
    speed: Option<f64>,
    iterations: Option<u32>,
    debug: bool,
    breakpoints: Vec<usize>,
    verbose: bool,
}

async fn run_script(path: &Path, args: RunArgs, format: OutputFormat) -> Result<(), CliError> {
    let config = KeyweaveConfig::load();
    let loaded = script_file::load(path)?;
    debug!(path = %path.display(), format = ?loaded.format, "script loaded");

    let mut ctx = ExecutionContext::new();
    let actions = ScriptParser::new(&mut ctx)
        .parse(&loaded.script)
        .map_err(|e| CliError::Syntax(e.to_string()))?;

    // Flag, then file, then config.
    let from_file = loaded.format == script_file::ScriptFormat::Json;
    let options = RunOptions {
        speed: args
            .speed
            .unwrap_or(if from_file { loaded.speed } else { config.default_speed }),
        iterations: args.iterations.unwrap_or(if from_file {
            loaded.iterations
        } else {
            config.default_iterations
        }),
    };

    let terminal = Terminal::new();
    let (host, hits) = TerminalHost::new(terminal.clone());
    let executor = MacroExecutor::new(Arc::new(DryRunDriver::new()))
        .with_host(Arc::new(host))
        .with_settings(config.executor_settings());
    executor.enable_debug_mode(args.debug);
    for line in &args.breakpoints {
        executor.add_breakpoint(*line);
    }

    let console = args
        .debug
        .then(|| tokio::spawn(debug_console(executor.clone(), terminal, hits)));

    let stopper = executor.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping...");
            stopper.stop();
        }
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_log(rx, args.verbose || args.debug, format));

    info!(path = %path.display(), speed = options.speed, iterations = options.iterations, "starting run");
    let report = executor.execute(ctx, actions, options, Some(tx)).await;

    ctrl_c.abort();
    if let Some(console) = console {
        console.abort();
    }
    let _ = printer.await;

    if format == OutputFormat::Json {
        let json = serde_json::to_string_pretty(&report).map_err(|e| CliError::Io(e.to_string()))?;
        println!("{}", json);
    }

    match report.status {
        RunStatus::Completed => Ok(()),
        RunStatus::Failed(msg) => Err(CliError::RunFailed(msg)),
        other => Err(CliError::RunFailed(format!("run ended as {:?}", other))),
    }
}

async fn print_log(
    mut rx: mpsc::UnboundedReceiver<LogEntry>,
    verbose: bool,
    format: OutputFormat,
) {
    while let Some(entry) = rx.recv().await {
        if entry.level == LogLevel::Debug && !verbose {
            continue;
        }
        if format == OutputFormat::Json {
            if let Ok(line) = serde_json::to_string(&entry) {
                eprintln!("{}", line);
            }
            continue;
        }
        let time = entry.timestamp.with_timezone(&Local).format("%H:%M:%S");
        let message = match entry.level {
            LogLevel::Error => format!("[ERROR] {}", entry.message),
            LogLevel::Warn => format!("[WARN] {}", entry.message),
            LogLevel::Debug => format!("[DEBUG] {}", entry.message),
            LogLevel::Command | LogLevel::Echo | LogLevel::Info => entry.message,
        };
        println!("[{}] {}", time, message);
    }
}

fn check_script(path: &Path, format: OutputFormat) -> Result<(), CliError> {
    let loaded = script_file::load(path)?;
    let mut scratch = ExecutionContext::new();
    let (ok, message) = ScriptParser::new(&mut scratch).validate_syntax(&loaded.script);
    let diagnostics = lint(&loaded.script);

    if format == OutputFormat::Json {
        let json = serde_json::json!({
            "valid": ok,
            "message": message,
            "diagnostics": diagnostics,
        });
        println!("{}", json);
    } else {
        for d in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
            println!("line {}: warning: {}", d.line, d.message);
        }
        if ok {
            println!("{}", message);
        }
    }

    if ok {
        Ok(())
    } else {
        Err(CliError::Syntax(message))
    }
}

fn pack_script(
    path: &Path,
    output: Option<&Path>,
    speed: Option<f64>,
    iterations: Option<u32>,
) -> Result<(), CliError> {
    let loaded = script_file::load(path)?;
    let mut file = MacroFile::new(
        loaded.script,
        speed.unwrap_or(loaded.speed),
        iterations.unwrap_or(loaded.iterations),
    );
    file.metadata.extra = loaded.metadata.extra;
    let json = file.to_json()?;
    write_output(output, &(json + "\n"))
}

fn show_config(init: bool, format: OutputFormat) -> Result<(), CliError> {
    let config = KeyweaveConfig::load();
    let path = KeyweaveConfig::path();
    if init {
        config.save().map_err(|e| CliError::Io(e.to_string()))?;
        eprintln!("Wrote {}", path.display());
    }

    if format == OutputFormat::Json {
        let json = serde_json::to_string_pretty(&config).map_err(|e| CliError::Io(e.to_string()))?;
        println!("{}", json);
    } else {
        println!("config: {}", path.display());
        println!("default_speed: {}", config.default_speed);
        println!("default_iterations: {}", config.default_iterations);
        println!("while_iteration_limit: {}", config.while_iteration_limit);
        println!("type_delay_ms: {}", config.type_delay_ms);
        println!("pixel_tolerance: {}", config.pixel_tolerance);
    }
    Ok(())
}

fn write_output(output: Option<&Path>, content: &str) -> Result<(), CliError> {
    match output {
        Some(path) => {
            std::fs::write(path, content).map_err(|e| CliError::Io(e.to_string()))?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        }
        None => {
            print!("{}", content);
            Ok(())
        }
    }
}
