//! hostrun CLI
//!
//! Run one shell command on many hosts over SSH, or locally

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use eyre::bail;
use hostrun_exec::{Group, Hide, Operation, Providers, RunOptions};
use tracing_subscriber::EnvFilter;

mod config;
mod prompt;
mod render;

use config::Config;
use prompt::TerminalPrompt;

#[derive(Parser)]
#[command(name = "hostrun", version)]
#[command(about = "Run shell commands locally or on remote hosts", long_about = None)]
struct Cli {
    /// Path to hostrun.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on hosts
    Run(RunArgs),
    /// List configured hosts
    Hosts,
}

#[derive(Args)]
struct RunArgs {
    /// Hosts or aliases, comma separated
    #[arg(short = 'H', long = "hosts", value_delimiter = ',')]
    hosts: Vec<String>,

    /// Select every configured host with this tag
    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Run on this machine instead
    #[arg(long, conflicts_with = "sudo")]
    local: bool,

    /// Run through sudo
    #[arg(long)]
    sudo: bool,

    /// Allocate a pseudo-terminal
    #[arg(long)]
    pty: bool,

    /// Do not fail on nonzero exit
    #[arg(long)]
    warn: bool,

    /// Streams not echoed: none, out, err, both
    #[arg(long, default_value = "none")]
    hide: Hide,

    /// Per-host timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Hosts executing at once
    #[arg(long)]
    concurrency: Option<usize>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<String>,

    /// Extra environment, KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Print results as JSON (implies --hide both)
    #[arg(long)]
    json: bool,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = Config::load_default(cli.config.as_deref())?;
    init_tracing(&config.log_level, cli.verbose);

    match cli.command {
        Commands::Run(args) => {
            if !run(&config, args).await? {
                std::process::exit(1);
            }
        }
        Commands::Hosts => {
            for host in &config.host {
                println!("{:<16} {:<32} {}", host.name, host.target, host.tags.join(","));
            }
        }
    }

    Ok(())
}

/// Logs go to stderr; RUST_LOG wins over the config and `-v`
fn init_tracing(log_level: &str, verbose: u8) {
    let level = match verbose {
        0 => log_level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every host succeeded
async fn run(config: &Config, args: RunArgs) -> Result<bool> {
    let operation = match (args.local, args.sudo) {
        (true, _) => Operation::Local,
        (false, true) => Operation::Sudo,
        (false, false) => Operation::Run,
    };

    let mut targets = config.resolve(&args.hosts, &args.tags);
    if targets.is_empty() {
        if operation != Operation::Local {
            bail!("no hosts selected; pass -H or -t");
        }
        targets.push("localhost".to_string());
    }

    let mut providers = Providers::default();
    if std::io::stdin().is_terminal() {
        providers = providers.with_password_prompt(Arc::new(TerminalPrompt));
    }

    let group = Group::from_hosts_with_providers(&targets, &config.connect_options(), &providers)?
        .with_concurrency(args.concurrency.unwrap_or(config.concurrency));

    let mut options = RunOptions::new()
        .hide(if args.json { Hide::Both } else { args.hide })
        .pty(args.pty)
        .warn(args.warn);
    if let Some(secs) = args.timeout {
        options = options.timeout(Duration::from_secs(secs));
    }
    if let Some(cwd) = args.cwd {
        options = options.cwd(cwd);
    }
    for (key, value) in args.env {
        options = options.env(key, value);
    }

    let command = args.command.join(" ");
    let results = group.dispatch(operation, &command, &options).await;
    group.close().await;

    if args.json {
        println!("{}", render::json(&results)?);
    } else {
        eprint!("{}", render::summary(&results));
    }

    Ok(results.ok())
}
