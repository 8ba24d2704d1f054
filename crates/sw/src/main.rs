//! sw - stepwise CLI
//!
//! Validate workflow documents, locate elements, capture scripted sessions and
//! replay workflows against fixture pages. Results go to stdout as JSON, logs
//! to stderr (`RUST_LOG`, default `info`).

mod script;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use script::{Fixture, Script};
use stepwise::prelude::*;
use stepwise::{locator, ControllerConfig, ControllerHandle, Run};

#[derive(Parser)]
#[command(name = "sw")]
#[command(about = "stepwise - capture interactions and replay them as supervised workflows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow document
    Validate {
        file: PathBuf,
    },
    /// Replay a workflow against fixture pages
    Run {
        file: PathBuf,
        #[arg(long)]
        fixture: PathBuf,
        /// Approve every supervised pause without asking
        #[arg(long)]
        auto_approve: bool,
        /// Override a workflow variable, NAME=VALUE
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
        /// Delay before retrying a failed step, in milliseconds
        #[arg(long, default_value = "500")]
        retry_delay: u64,
        #[arg(long, env = "STEPWISE_RUNS_DIR")]
        runs_dir: Option<PathBuf>,
    },
    /// Generate the locator for an element of a page fixture
    Locate {
        page: PathBuf,
        /// CSS selector picking the element
        selector: String,
    },
    /// Record a scripted session
    Capture {
        script: PathBuf,
        #[arg(short, long)]
        session: Option<String>,
        /// Save to the recordings directory instead of printing events
        #[arg(long)]
        save: bool,
        #[arg(long, env = "STEPWISE_RECORDINGS_DIR")]
        recordings_dir: Option<PathBuf>,
    },
    /// Manage saved recordings
    Recordings {
        #[command(subcommand)]
        action: RecordingsAction,
        #[arg(long, env = "STEPWISE_RECORDINGS_DIR", global = true)]
        dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum RecordingsAction {
    List,
    Show {
        file: String,
        #[arg(long)]
        all: bool,
    },
    Delete {
        file: String,
    },
}

#[derive(Serialize)]
struct Output<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Error>,
}

impl<T: Serialize> Output<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }
    fn err(e: Error) -> Output<()> {
        Output { success: false, data: None, error: Some(e) }
    }
}

fn print_json<T: Serialize>(output: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got `{}`", s)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let result: Result<()> = match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Run { file, fixture, auto_approve, vars, retry_delay, runs_dir } => {
            replay(&file, &fixture, auto_approve, vars, retry_delay, runs_dir).await
        }
        Commands::Locate { page, selector } => locate(&page, &selector),
        Commands::Capture { script, session, save, recordings_dir } => {
            capture(&script, session, save, recordings_dir)
        }
        Commands::Recordings { action, dir } => match action {
            RecordingsAction::List => list(dir),
            RecordingsAction::Show { file, all } => show(dir, &file, all),
            RecordingsAction::Delete { file } => delete(dir, &file),
        },
    };

    if let Err(e) = result {
        match e.downcast_ref::<Error>() {
            Some(err) => {
                let _ = print_json(&Output::<()>::err(err.clone()));
            }
            None => eprintln!("Error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn load_workflow(file: &Path) -> Result<Workflow> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    Ok(Workflow::from_json(&text).map_err(Error::from)?)
}

fn validate(file: &Path) -> Result<()> {
    let workflow = load_workflow(file)?;
    let mut inline: Vec<&str> = workflow.owned_ids().into_iter().collect();
    inline.sort_unstable();
    let steps: Vec<_> = workflow
        .steps
        .iter()
        .map(|s| json!({"id": s.id(), "type": s.kind(), "description": s.describe()}))
        .collect();
    print_json(&Output::ok(json!({
        "id": workflow.id,
        "name": workflow.name,
        "settings": workflow.settings,
        "steps": steps,
        "inline": inline,
    })))
}

// ══════════════════════════════════════════════════════════════════════════════
//  Replay
// ══════════════════════════════════════════════════════════════════════════════

enum Decision {
    Resume,
    Next,
    Cancel,
}

async fn replay(
    file: &Path,
    fixture: &Path,
    auto_approve: bool,
    vars: Vec<(String, String)>,
    retry_delay: u64,
    runs_dir: Option<PathBuf>,
) -> Result<()> {
    let mut workflow = load_workflow(file)?;
    for (name, value) in vars {
        workflow.variables.insert(name, value.into());
    }
    let page = Arc::new(Fixture::load(fixture)?.into_page());
    let store: Arc<dyn RunStore> = match runs_dir {
        Some(dir) => Arc::new(FileRunStore::with_dir(dir)?),
        None => Arc::new(FileRunStore::new()?),
    };

    let (transport, end) = in_process();
    Driver::new(StepExecutor::new(page.clone()), end).spawn();
    let config = ControllerConfig {
        retry_delay: Duration::from_millis(retry_delay),
    };
    let (controller, _) = Controller::new(transport, store).with_config(config).spawn();

    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })?;

    let run_id = controller.start(workflow).await?;
    tracing::info!(%run_id, "replaying (Ctrl+C to cancel)");
    let run = supervise(&controller, auto_approve, &mut stop_rx).await?;
    controller.shutdown();

    let status = run.status();
    print_json(&Output {
        success: status == RunStatus::Completed,
        data: Some(json!({"run": run, "url": page.current_url()})),
        error: None,
    })?;
    if status != RunStatus::Completed {
        bail!("run {} ended {:?}", run_id, status);
    }
    Ok(())
}

/// Nothing in flight and waiting on the operator, or finished.
fn settled(snap: &Snapshot) -> bool {
    snap.in_flight.is_none()
        && snap
            .status()
            .is_some_and(|s| s == RunStatus::Paused || s.is_terminal())
}

async fn supervise(
    controller: &ControllerHandle,
    auto_approve: bool,
    stop_rx: &mut mpsc::UnboundedReceiver<()>,
) -> Result<Run> {
    loop {
        let snap = tokio::select! {
            snap = controller.wait_until(settled) => snap?,
            _ = stop_rx.recv() => {
                eprintln!("Cancelling...");
                controller.cancel().await.ok();
                return Ok(controller.wait_for_end().await?);
            }
        };
        let Some(run) = snap.run.as_ref() else {
            bail!("controller has no run");
        };
        if run.is_terminal() {
            return Ok(run.clone());
        }

        let failed = run.logs().last().is_some_and(|l| l.level == LogLevel::Error);
        let decision = match (auto_approve, failed) {
            (true, false) => Decision::Resume,
            (true, true) => Decision::Cancel,
            (false, _) => ask(&snap).await?,
        };
        match decision {
            Decision::Resume => controller.resume().await?,
            Decision::Next => controller.next_step().await?,
            Decision::Cancel => controller.cancel().await?,
        }
    }
}

async fn ask(snap: &Snapshot) -> Result<Decision> {
    if let Some(run) = &snap.run {
        let index = run.current_step_index();
        eprintln!("\nPaused before step {}/{}", index + 1, snap.step_count);
        if let Some(last) = run.logs().last() {
            eprintln!("  last: [{:?}] {} {}", last.level, last.step_id, last.message);
        }
    }
    eprint!("[r]esume, [n]ext step, [c]ancel > ");
    io::stderr().flush()?;

    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|n| (n, line))
    })
    .await??;
    Ok(match line {
        (0, _) => Decision::Cancel,
        (_, l) => match l.trim() {
            "n" | "next" => Decision::Next,
            "c" | "cancel" | "q" => Decision::Cancel,
            _ => Decision::Resume,
        },
    })
}

// ══════════════════════════════════════════════════════════════════════════════
//  Locators and capture
// ══════════════════════════════════════════════════════════════════════════════

fn locate(page: &Path, selector: &str) -> Result<()> {
    let text = std::fs::read_to_string(page).with_context(|| format!("reading {}", page.display()))?;
    let doc = DomTree::build(serde_json::from_str(&text)?);
    let node = doc.find(selector).ok_or_else(|| Error::target_not_found(selector))?;
    let locator = locator::generate(&doc, node)?;
    let resolved = locator::resolve(&doc, &locator)?;
    print_json(&Output::ok(json!({
        "element": doc.element(node),
        "locator": locator,
        "resolvesToSame": resolved == node,
    })))
}

fn recordings(dir: Option<PathBuf>) -> Result<RecordingStorage> {
    match dir {
        Some(dir) => RecordingStorage::with_dir(dir),
        None => RecordingStorage::new(),
    }
}

fn capture(path: &Path, session: Option<String>, save: bool, dir: Option<PathBuf>) -> Result<()> {
    let script = Script::load(path)?;
    let source = Arc::new(ScriptedSource::new());
    let recorder = EventRecorder::new(source.clone());
    let export = script.record(&recorder, &source, session)?;

    if save {
        let saved = recordings(dir)?.save(&export)?;
        print_json(&Output::ok(json!({
            "path": saved,
            "sessionId": export.session_id,
            "eventCount": export.event_count,
        })))
    } else {
        print_json(&Output::ok(export))
    }
}

fn list(dir: Option<PathBuf>) -> Result<()> {
    let files = recordings(dir)?.list()?;
    print_json(&Output::ok(files))
}

fn show(dir: Option<PathBuf>, file: &str, all: bool) -> Result<()> {
    let export = recordings(dir)?.load(file)?;
    let mut summary: BTreeMap<String, usize> = BTreeMap::new();
    for e in &export.events {
        let kind = serde_json::to_value(e.kind)?;
        *summary.entry(kind.as_str().unwrap_or_default().to_string()).or_default() += 1;
    }
    let mut data = json!({
        "sessionId": export.session_id,
        "eventCount": export.event_count,
        "summary": summary,
    });
    if all {
        data["events"] = serde_json::to_value(&export.events)?;
    }
    print_json(&Output::ok(data))
}

fn delete(dir: Option<PathBuf>, file: &str) -> Result<()> {
    recordings(dir)?.delete(file)?;
    print_json(&Output::ok(json!({"deleted": file})))
}
