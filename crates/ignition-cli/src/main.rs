//! Ignition CLI
//!
//! A command-line front end for the ignition execution engine: run a source
//! file through an installed runtime, list runtimes, or generate a starter
//! configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ignition::api::{ExecuteRequest, FileEntry};
use ignition::{Config, EXAMPLE_CONFIG, Engine};
use tracing::{Level, debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ignition")]
#[command(about = "Sandboxed multi-language code execution")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path (default: ignition.toml)
        #[arg(short, long, default_value = "ignition.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Run a program (compile if needed, then execute)
    Run {
        /// Source files; the first is the entry point
        #[arg(value_name = "FILE", required = true)]
        sources: Vec<PathBuf>,

        /// Language name or alias
        #[arg(short, long)]
        language: String,

        /// Version spec (default: highest installed)
        #[arg(short = 'V', long, default_value = "*")]
        lang_version: String,

        /// File whose contents are fed to the program's stdin
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Run wall clock budget in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Run memory limit in bytes (-1 for unlimited)
        #[arg(short, long)]
        memory: Option<i64>,

        /// Arguments passed to the program
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// List installed runtimes
    Runtimes,

    /// Show the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    let config = if let Some(ref path) = cli.config {
        info!(?path, "loading configuration");
        Config::from_file(path).context("failed to load configuration")?
    } else {
        debug!("using default configuration");
        Config::default()
    };

    match cli.command {
        Commands::Init { output, force } => init_config(&output, force).await,
        Commands::Run {
            sources,
            language,
            lang_version,
            input,
            timeout,
            memory,
            args,
        } => {
            run(
                config,
                sources,
                language,
                lang_version,
                input,
                timeout,
                memory,
                args,
            )
            .await
        }
        Commands::Runtimes => {
            list_runtimes(config)?;
            Ok(())
        }
        Commands::ShowConfig => {
            show_config(&config);
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: Config,
    sources: Vec<PathBuf>,
    language: String,
    lang_version: String,
    input: Option<PathBuf>,
    timeout: Option<u64>,
    memory: Option<i64>,
    args: Vec<String>,
) -> Result<()> {
    let engine = Engine::from_config(config).context("failed to load runtimes")?;

    let mut files = Vec::with_capacity(sources.len());
    for source in &sources {
        let content = tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read {}", source.display()))?;
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        files.push(FileEntry {
            name,
            content,
            encoding: Default::default(),
            executable: false,
        });
    }

    let stdin = match input {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => String::new(),
    };

    let request = ExecuteRequest {
        language,
        version: lang_version,
        files,
        args,
        stdin,
        run_timeout: timeout,
        compile_timeout: None,
        run_memory_limit: memory,
        compile_memory_limit: None,
    };

    let result = engine
        .execute(&request, "cli")
        .await
        .context("execution failed")?;

    if let Some(compile) = &result.compile {
        debug!(
            exit_code = ?compile.exit_code,
            wall_ms = compile.wall_ms,
            "compile phase complete"
        );
        if !compile.is_success() {
            eprintln!("Compilation failed:");
            eprint!("{}", compile.output);
            std::process::exit(compile.exit_code.unwrap_or(1));
        }
    }

    let Some(run) = &result.run else {
        anyhow::bail!("run phase did not execute");
    };

    print!("{}", run.stdout);
    if !run.stderr.is_empty() {
        eprint!("{}", run.stderr);
    }

    // Log execution info via tracing (stderr), keeping stdout clean for piping
    info!(
        language = result.language,
        version = result.version,
        exit_code = ?run.exit_code,
        signal = ?run.signal,
        wall_ms = run.wall_ms,
        "execution result"
    );

    if let Some(message) = &run.message {
        eprintln!("{message}");
    }

    if run.is_success() {
        Ok(())
    } else {
        std::process::exit(run.exit_code.unwrap_or(1));
    }
}

fn list_runtimes(config: Config) -> Result<()> {
    let engine = Engine::from_config(config).context("failed to load runtimes")?;

    println!("Installed runtimes:\n");

    let mut runtimes: Vec<_> = engine.registry().list().to_vec();
    runtimes.sort_by(|a, b| {
        a.language
            .cmp(&b.language)
            .then_with(|| a.version.cmp(&b.version))
    });

    for runtime in runtimes {
        let kind = if runtime.is_compiled() {
            "compiled"
        } else {
            "interpreted"
        };
        let aliases = if runtime.aliases.is_empty() {
            String::new()
        } else {
            format!(" (aliases: {})", runtime.aliases.join(", "))
        };
        println!(
            "  {:<12} {:<10} {kind}{aliases}",
            runtime.language,
            runtime.version.to_string()
        );
    }

    Ok(())
}

fn show_config(config: &Config) {
    println!("Packages root: {}", config.packages_root.display());
    println!("Sandbox root:  {}", config.sandbox_root.display());
    println!("Slots:         {}", config.slot_count);
    println!(
        "Slot uid/gid:  {}+N / {}+N",
        config.base_uid, config.base_gid
    );
    println!();
    println!("Concurrency:");
    println!("  Per client: {}", config.per_client_max_jobs);
    println!("  Global:     {}", config.global_max_jobs);
    println!();
    println!("Limits:");
    println!("  Compile timeout: {} ms", config.limits.compile_timeout_ms);
    println!("  Run timeout:     {} ms", config.limits.run_timeout_ms);
    println!("  Timeout ceiling: {} ms", config.limits.max_timeout_ms);
    println!("  Output cap:      {} bytes", config.limits.max_output_bytes);
    println!("  Max processes:   {}", config.limits.max_processes);
}

async fn init_config(output: &PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at '{}'. Use --force to overwrite.",
            output.display()
        );
    }

    tokio::fs::write(output, EXAMPLE_CONFIG)
        .await
        .context("failed to write configuration file")?;

    println!("Created configuration file at '{}'", output.display());
    Ok(())
}
