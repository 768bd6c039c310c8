//! Diagnostic event journal
//!
//! Operator-relevant events are appended as timestamped JSON lines. The file is only
//! ever opened in append mode.

use chrono::{DateTime, Utc};
use pairguard_cns::{ChannelEvent, TimeoutEvent};
use pairguard_core::{MachineId, PairVerdict};
use pairguard_eye::SourceEvent;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub const JOURNAL_FILE: &str = "diagnostics.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    Started { machines: Vec<MachineId> },
    MachineRejected { machine: MachineId, reason: String },
    MachineStarted { machine: MachineId },
    MachineStopped { machine: MachineId },
    Source(SourceEvent),
    Timeout(TimeoutEvent),
    /// A relay write ended in an unknown state
    Channel(ChannelEvent),
    VerdictChanged { machine: MachineId, verdicts: Vec<PairVerdict> },
    SourceRestart { machine: MachineId },
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JournalRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: DiagnosticEvent,
}

pub fn journal_path(log_dir: &Path) -> PathBuf {
    log_dir.join(JOURNAL_FILE)
}

/// Append events from `events` to `path` until `shutdown` fires and the channel is drained
pub fn spawn_journal(
    path: PathBuf,
    mut events: broadcast::Receiver<DiagnosticEvent>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!("Cannot create journal directory {}: {}", parent.display(), e);
                return;
            }
        }
        let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => file,
            Err(e) => {
                error!("Cannot open diagnostic journal {}: {}", path.display(), e);
                return;
            }
        };

        loop {
            let event = tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Diagnostic journal lagged, {} events lost", missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.cancelled() => {
                    // keep what is already queued
                    match events.try_recv() {
                        Ok(event) => event,
                        Err(_) => break,
                    }
                }
            };
            let record = JournalRecord {
                timestamp: Utc::now(),
                event,
            };
            let mut line = match serde_json::to_string(&record) {
                Ok(line) => line,
                Err(e) => {
                    warn!("Cannot encode diagnostic event: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                error!("Diagnostic journal write failed: {}", e);
            }
        }
        let _ = file.flush().await;
    })
}
