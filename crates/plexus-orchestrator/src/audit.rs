use crate::metrics::Metrics;
use plexus_core::{EventSink, OrchestrationEvent, PlexusError, PlexusResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Append-only JSONL log of orchestration events.
///
/// `deliver` only pushes onto an unbounded channel; a background task owns
/// the file and appends one JSON object per line to `<dir>/events.jsonl`.
pub struct AuditLog {
    tx: mpsc::UnboundedSender<OrchestrationEvent>,
    writer: JoinHandle<()>,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new AuditLog. Spawns the background writer task.
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        let log_dir = log_dir.as_ref().to_path_buf();
        let path = log_dir.join("events.jsonl");
        let (tx, mut rx) = mpsc::unbounded_channel::<OrchestrationEvent>();

        let file_path = path.clone();
        let writer = tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&log_dir).await {
                warn!(dir = %log_dir.display(), error = %e, "Audit directory unavailable");
                return;
            }
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
                .await
            {
                Ok(file) => file,
                Err(e) => {
                    warn!(path = %file_path.display(), error = %e, "Audit log unavailable");
                    return;
                }
            };

            while let Some(event) = rx.recv().await {
                let Ok(mut line) = serde_json::to_string(&event) else {
                    continue;
                };
                line.push('\n');
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    warn!(error = %e, "Failed to append audit event");
                }
            }
            let _ = file.flush().await;
        });

        Self { tx, writer, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting events and wait until everything queued is on disk.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.writer.await;
    }
}

impl EventSink for AuditLog {
    fn deliver(&self, event: &OrchestrationEvent) -> PlexusResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| PlexusError::Store("audit writer has stopped".into()))
    }
}

/// Fire-and-forget front for an optional [`EventSink`].
///
/// Delivery errors are swallowed and counted in
/// [`Metrics`]; they never reach the caller.
#[derive(Clone)]
pub struct Emitter {
    sink: Option<Arc<dyn EventSink>>,
    metrics: Arc<Metrics>,
}

impl Emitter {
    pub fn new(sink: Option<Arc<dyn EventSink>>, metrics: Arc<Metrics>) -> Self {
        Self { sink, metrics }
    }

    /// An emitter that discards every event.
    pub fn disabled(metrics: Arc<Metrics>) -> Self {
        Self::new(None, metrics)
    }

    pub fn emit(&self, event: OrchestrationEvent) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Err(e) = sink.deliver(&event) {
            debug!(event = event.name(), error = %e, "Event dropped");
            self.metrics.record_event_dropped();
        }
    }
}
