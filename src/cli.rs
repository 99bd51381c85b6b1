use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use log::{info, warn};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::clock::SystemClock;
use crate::config::Config;
use crate::error::ScanError;
use crate::orchestrator::{OrchestratorHandle, OrchestratorSettings, ScanEvent, ScanOrchestrator};
use crate::session::ScanPhase;
use crate::store::{MemoryStore, ScanStateStore, SqliteStore};
use crate::transport::HttpTransport;

#[derive(Parser)]
#[command(
    name = "websentinel",
    version,
    about = "WebSentinel: drive and follow web vulnerability scans"
)]
pub struct Cli {
    /// Keep scan state in memory only. Nothing survives the process.
    #[arg(long, global = true)]
    pub ephemeral: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scan a URL and follow it to completion (resumes an interrupted scan instead, if one exists)
    Scan {
        /// Target to scan, e.g. https://example.com
        url: String,
    },
    /// Follow a scan interrupted by an earlier exit
    Resume,
    /// Stop the scan left running by an earlier exit
    Stop,
    /// Discard any persisted scan state
    Clear,
}

impl Cli {
    pub fn handle_command_line(
        project_dirs: &ProjectDirs,
        config: &Config,
    ) -> Result<(), ScanError> {
        let args = Cli::parse();

        let store = Self::open_store(config, project_dirs, args.ephemeral)?;

        if let Command::Clear = args.command {
            store.clear()?;
            println!("Cleared persisted scan state");
            return Ok(());
        }

        let transport = Arc::new(HttpTransport::new(
            &config.server.base_url,
            Duration::from_secs(config.server.request_timeout_secs),
        )?);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ScanError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let (orchestrator, handle) = ScanOrchestrator::new(
                OrchestratorSettings::from_config(config),
                transport.clone(),
                store,
                Arc::new(SystemClock),
            );
            let recovered = handle.snapshot();
            let events = handle.subscribe();
            let task = tokio::spawn(orchestrator.run());

            let result = match args.command {
                Command::Scan { url } => {
                    if recovered.phase == ScanPhase::Running {
                        println!(
                            "Resuming interrupted scan of {} (requested {} ignored)",
                            recovered.target_url, url
                        );
                    } else {
                        let scan_id = handle.start_scan(&url).await?;
                        println!("Started scan {} of {}", scan_id, url);
                    }
                    Self::follow(&handle, events, &transport).await
                }
                Command::Resume => {
                    if recovered.phase == ScanPhase::Running {
                        println!(
                            "Resuming scan of {} at {}%",
                            recovered.target_url, recovered.progress_percent
                        );
                        Self::follow(&handle, events, &transport).await
                    } else {
                        println!("No interrupted scan to resume");
                        Ok(())
                    }
                }
                Command::Stop => {
                    if recovered.phase == ScanPhase::Running {
                        handle.stop_scan().await?;
                        println!("Stopped scan of {}", recovered.target_url);
                        Ok(())
                    } else {
                        Err(ScanError::NoActiveScan)
                    }
                }
                Command::Clear => Ok(()),
            };

            handle.shutdown();
            if let Err(e) = task.await {
                warn!("Orchestrator task ended abnormally: {}", e);
            }
            result
        })
    }

    fn open_store(
        config: &Config,
        project_dirs: &ProjectDirs,
        ephemeral: bool,
    ) -> Result<Box<dyn ScanStateStore>, ScanError> {
        if ephemeral {
            info!("Using in-memory scan state");
            return Ok(Box::new(MemoryStore::new()));
        }
        let db_path = config.db_path(project_dirs);
        info!("Using scan state database {}", db_path.display());
        Ok(Box::new(SqliteStore::open(&db_path)?))
    }

    /// Print progress and lifecycle events until the orchestrator returns to Idle.
    /// Ctrl-C requests a stop of the running scan.
    async fn follow(
        handle: &OrchestratorHandle,
        mut events: broadcast::Receiver<ScanEvent>,
        transport: &HttpTransport,
    ) -> Result<(), ScanError> {
        let mut progress = handle.watch();
        let mut last_percent = None;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    if !stop_requestable(handle.snapshot().phase) {
                        continue;
                    }
                    println!("Stopping scan...");
                    if let Err(e) = handle.stop_scan().await {
                        eprintln!("Could not stop scan: {}", e);
                    }
                }
                changed = progress.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = progress.borrow_and_update().clone();
                    if session.phase == ScanPhase::Running
                        && last_percent != Some(session.progress_percent)
                    {
                        println!("[{:>3}%] {}", session.progress_percent, session.status_message);
                        last_percent = Some(session.progress_percent);
                    }
                }
                event = events.recv() => match event {
                    Ok(ScanEvent::Completed { scan_id }) => {
                        println!("Scan {} completed", scan_id);
                        match transport.results(&scan_id).await {
                            Ok(results) => {
                                for line in summarize_results(&results) {
                                    println!("{}", line);
                                }
                            }
                            Err(e) => eprintln!("Could not fetch results: {}", e),
                        }
                    }
                    Ok(ScanEvent::Failed { scan_id, error }) => {
                        println!("Scan {} failed: {}", scan_id, error)
                    }
                    Ok(ScanEvent::Stopped { scan_id }) => println!("Scan {} stopped", scan_id),
                    Ok(ScanEvent::TimedOut { scan_id }) => {
                        println!("Scan {} timed out", scan_id)
                    }
                    Ok(ScanEvent::PhaseChanged { phase: ScanPhase::Idle }) => break,
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} scan events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

/// Ctrl-C only asks for a stop while the scan runs; a stop already in flight is left alone
fn stop_requestable(phase: ScanPhase) -> bool {
    phase == ScanPhase::Running
}

/// Console summary of a results document. Missing sections are skipped.
fn summarize_results(results: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    let summary = &results["summary"];

    if let Some(total) = summary
        .pointer("/scan_info/total_vulnerabilities")
        .and_then(Value::as_u64)
    {
        lines.push(format!("Total vulnerabilities found: {}", total));
    }

    if let Some(by_type) = summary["vulnerabilities_by_type"].as_object() {
        let mut by_type: Vec<_> = by_type
            .iter()
            .filter_map(|(kind, count)| count.as_u64().map(|count| (kind, count)))
            .collect();
        by_type.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (kind, count) in by_type {
            lines.push(format!("  {}: {}", kind.replace('_', " "), count));
        }
    }

    if lines.is_empty() {
        lines.push("No summary available for this scan".to_string());
    }
    lines
}
