use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use magic_mirrord::daemon::{MirrorConfig, MirrorDaemon, logout};
use magic_mirrord::sync::conflict::Resolution;
use magic_mirrord::sync::planner::{SyncDirection, SyncPlan, SyncReport};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Keeps a local directory of magic-api scripts in sync with the server.
#[derive(Debug, Parser)]
#[command(name = "magic-mirrord", version, about)]
struct Cli {
    /// More output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Compare the mirror with the server without changing anything.
    Status,
    /// Reconcile the mirror with the server once.
    Sync {
        /// both, push or pull; asked interactively when omitted.
        #[arg(short, long)]
        direction: Option<SyncDirection>,
        /// Print the comparison and exit.
        #[arg(long)]
        dry_run: bool,
    },
    /// Reconcile, then propagate changes in both directions until Ctrl-C.
    Watch,
    /// Apply a manual merge choice and remove its scratch files.
    Resolve {
        /// Script in the mirror, e.g. api/user/login.ms.
        path: PathBuf,
        #[command(flatten)]
        choice: MergeChoice,
    },
    /// Forget the cached session token.
    Logout,
}

#[derive(Debug, PartialEq, Eq, Args)]
#[group(required = true, multiple = false)]
struct MergeChoice {
    /// Push the mirror copy over the server's.
    #[arg(long)]
    keep_local: bool,
    /// Overwrite the mirror copy with the server's.
    #[arg(long)]
    take_remote: bool,
    /// Write FILE to the mirror and push it.
    #[arg(long, value_name = "FILE")]
    merged: Option<PathBuf>,
}

impl MergeChoice {
    async fn into_resolution(self) -> anyhow::Result<Resolution> {
        if let Some(file) = self.merged {
            let script = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            return Ok(Resolution::Merged(script));
        }
        Ok(if self.take_remote {
            Resolution::TakeRemote
        } else {
            Resolution::KeepLocal
        })
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = MirrorConfig::from_env()?;
    match cli.command {
        Command::Logout => {
            if logout(&config.mirror_root).await? {
                println!("cached token removed");
            } else {
                println!("no cached token");
            }
            Ok(())
        }
        Command::Status => {
            let daemon = MirrorDaemon::bootstrap(config).await?;
            let plan = daemon.plan(&CancellationToken::new()).await?;
            print_plan(&plan);
            Ok(())
        }
        Command::Sync { direction, dry_run } => {
            let daemon = MirrorDaemon::bootstrap(config).await?;
            let cancel = CancellationToken::new();
            let plan = daemon.plan(&cancel).await?;
            print_plan(&plan);
            if dry_run || plan.entries.is_empty() {
                return Ok(());
            }
            let direction = match direction {
                Some(direction) => direction,
                None => match prompt_direction().await? {
                    Some(direction) => direction,
                    None => {
                        println!("skipped");
                        return Ok(());
                    }
                },
            };
            let report = daemon.apply(plan, direction, &cancel).await;
            print_report(&report);
            if report.failures.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("{} resource(s) failed to sync", report.failures.len())
            }
        }
        Command::Watch => MirrorDaemon::bootstrap(config).await?.run_watch().await,
        Command::Resolve { path, choice } => {
            let resolution = choice.into_resolution().await?;
            let daemon = MirrorDaemon::bootstrap(config).await?;
            let key = daemon.resolve(&path, resolution).await?;
            println!("resolved {key}");
            Ok(())
        }
    }
}

async fn prompt_direction() -> anyhow::Result<Option<SyncDirection>> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout
            .write_all(b"sync direction [both/push/pull/skip]: ")
            .await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            return Ok(None);
        };
        match SyncDirection::parse_choice(&line) {
            Ok(choice) => return Ok(choice),
            Err(err) => eprintln!("{err}"),
        }
    }
}

fn print_plan(plan: &SyncPlan) {
    println!("{}", plan.summary());
    for entry in &plan.entries {
        println!("  {:<12} {}", entry.presence_label(), entry.key);
    }
    for (key, reason) in &plan.failures {
        println!("  failed {key}: {reason}");
    }
}

fn print_report(report: &SyncReport) {
    println!(
        "pushed: {}, pulled: {}, skipped: {}, manual merges: {}, failed: {}",
        report.pushed.len(),
        report.pulled.len(),
        report.skipped,
        report.merges.len(),
        report.failures.len()
    );
    for key in &report.merges {
        println!("  merge needed: {key}");
    }
    if !report.merges.is_empty() {
        println!("remote copies are under .merge/; settle each with `magic-mirrord resolve`");
    }
    for (key, reason) in &report.failures {
        println!("  failed {key}: {reason}");
    }
}
