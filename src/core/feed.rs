//! Change notifications from the desired-state feed: decode, coalesce, stage, and dispatch one
//! reconciliation per affected VM.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use super::document::{ConfigStore, StageOutcome, VmDocument};
use super::events::{Event, emit};
use super::outcome::{OperationOutput, OperationResult};
use crate::config::AgentConfig;
use crate::error::{EX_TEMPFAIL, Error, Result};

const NODE_PREFIX: &str = "node/";
const SNAPSHOT_PREFIX: &str = "snapshot/";

/// One entry of the feed's change batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Notification {
    #[serde(rename = "Key")]
    pub key: String,
    /// Base64 payload; absent when the key was deleted.
    #[serde(rename = "Value", default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotRequest {
    vm: String,
    snapshot: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Document(VmDocument),
    Snapshot { vm: String, name: String },
}

/// Work handed to a [`Dispatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Ensure { vm: String },
    Snapshot { vm: String, name: String },
}

impl Job {
    pub fn vm(&self) -> &str {
        match self {
            Self::Ensure { vm } | Self::Snapshot { vm, .. } => vm,
        }
    }
}

/// Runs the per-VM work a notification batch calls for. Called from several workers at once.
pub trait Dispatcher: Send + Sync {
    fn ensure(&self, vm: &str) -> Result<()>;
    fn snapshot(&self, vm: &str, name: &str) -> Result<()>;
}

/// Runs each job as a child `steward` process, so every VM gets its own host lock and log.
#[derive(Debug, Clone)]
pub struct SubprocessDispatcher {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl SubprocessDispatcher {
    pub fn new(program: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    fn run(&self, vm: &str, args: &[&str]) -> Result<()> {
        let mut command = Command::new(&self.program);
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        command.args(args);
        tracing::debug!(vm, program = %self.program.display(), ?args, "spawning worker");
        let status = command
            .status()
            .map_err(|err| Error::io(format!("Failed to run {}", self.program.display()), err))?;
        match status.code() {
            Some(0) => Ok(()),
            // Another run already owns the VM and will pick up the staged config.
            Some(code) if code == i32::from(EX_TEMPFAIL) => {
                tracing::info!(vm, "VM is busy; leaving the staged config to the running pass");
                Ok(())
            }
            _ => Err(Error::Dispatch {
                vm: vm.to_string(),
                message: format!("`{}` exited with {status}", args.join(" ")),
            }),
        }
    }
}

impl Dispatcher for SubprocessDispatcher {
    fn ensure(&self, vm: &str) -> Result<()> {
        self.run(vm, &["ensure", vm])
    }

    fn snapshot(&self, vm: &str, name: &str) -> Result<()> {
        self.run(vm, &["snapshot", vm, name])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedOutcome {
    /// VMs whose config was staged, with the staged generation.
    pub staged: Vec<(String, u64)>,
    /// VMs whose notification carried nothing newer.
    pub unchanged: Vec<String>,
    pub dispatched: Vec<Job>,
    /// Notifications or jobs that failed, with the reason.
    pub failures: Vec<(String, String)>,
}

impl FeedOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Parses a notification batch. Empty input is an empty batch.
pub fn parse_notifications(input: &str) -> Result<Vec<Notification>> {
    if input.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(input).map_err(|err| Error::InvalidEvent {
        message: err.to_string(),
    })
}

/// Decodes one notification. Deletions and keys outside the known prefixes yield `None`.
pub fn decode(notification: &Notification) -> Result<Option<Change>> {
    let Some(value) = &notification.value else {
        tracing::debug!(key = %notification.key, "ignoring deleted key");
        return Ok(None);
    };
    let invalid = |message: String| Error::InvalidEvent {
        message: format!("{}: {message}", notification.key),
    };
    let payload = STANDARD
        .decode(value.trim())
        .map_err(|err| invalid(format!("bad base64: {err}")))?;

    if let Some(vm) = notification.key.strip_prefix(NODE_PREFIX) {
        let document = VmDocument::parse(Path::new(&notification.key), &payload)
            .map_err(|err| invalid(err.to_string()))?;
        if document.name != vm {
            return Err(invalid(format!("document names VM `{}`", document.name)));
        }
        return Ok(Some(Change::Document(document)));
    }
    if let Some(vm) = notification.key.strip_prefix(SNAPSHOT_PREFIX) {
        let request: SnapshotRequest =
            serde_json::from_slice(&payload).map_err(|err| invalid(err.to_string()))?;
        if request.vm != vm {
            return Err(invalid(format!("request names VM `{}`", request.vm)));
        }
        return Ok(Some(Change::Snapshot {
            vm: request.vm,
            name: request.snapshot,
        }));
    }
    tracing::debug!(key = %notification.key, "ignoring unrelated key");
    Ok(None)
}

/// Stages the batch's documents and dispatches the resulting jobs on up to `config.workers`
/// threads.
pub fn handle_notifications(
    config: &AgentConfig,
    notifications: &[Notification],
    dispatcher: &dyn Dispatcher,
) -> OperationResult<FeedOutcome> {
    let mut events = Vec::new();
    let mut outcome = FeedOutcome::default();
    let mut documents: BTreeMap<String, VmDocument> = BTreeMap::new();
    let mut snapshots: BTreeSet<(String, String)> = BTreeSet::new();

    for notification in notifications {
        match decode(notification) {
            Ok(Some(Change::Document(document))) => {
                let newest = documents
                    .get(&document.name)
                    .is_none_or(|known| document.generation > known.generation);
                if newest {
                    documents.insert(document.name.clone(), document);
                }
            }
            Ok(Some(Change::Snapshot { vm, name })) => {
                snapshots.insert((vm, name));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(key = %notification.key, error = %err, "skipping notification");
                outcome.failures.push((notification.key.clone(), err.to_string()));
            }
        }
    }

    let mut jobs = Vec::new();
    for (vm, document) in documents {
        let store = ConfigStore::new(
            vm.clone(),
            config.active_document(&vm),
            config.staged_document(&vm),
        );
        match store.stage(&document) {
            Ok(StageOutcome::Staged { generation }) => {
                emit(
                    &mut events,
                    Event::ConfigStaged {
                        vm: vm.clone(),
                        generation,
                    },
                );
                outcome.staged.push((vm.clone(), generation));
                jobs.push(Job::Ensure { vm });
            }
            Ok(StageOutcome::Unchanged {
                generation,
                current,
            }) => {
                emit(
                    &mut events,
                    Event::ConfigUnchanged {
                        vm: vm.clone(),
                        generation,
                        current,
                    },
                );
                outcome.unchanged.push(vm);
            }
            Err(err) => {
                tracing::error!(vm = %vm, error = %err, "could not stage config");
                outcome.failures.push((vm, err.to_string()));
            }
        }
    }
    jobs.extend(
        snapshots
            .into_iter()
            .map(|(vm, name)| Job::Snapshot { vm, name }),
    );

    for (job, result) in run_jobs(&jobs, config.workers, dispatcher) {
        if let Err(err) = result {
            tracing::warn!(vm = %job.vm(), error = %err, "dispatched job failed");
            outcome.failures.push((job.vm().to_string(), err.to_string()));
        }
        outcome.dispatched.push(job);
    }
    Ok(OperationOutput::new(outcome).with_events(events))
}

fn run_jobs(jobs: &[Job], workers: usize, dispatcher: &dyn Dispatcher) -> Vec<(Job, Result<()>)> {
    if jobs.is_empty() {
        return Vec::new();
    }
    let (queue, pending) = mpsc::channel::<&Job>();
    for job in jobs {
        let _ = queue.send(job);
    }
    drop(queue);
    let pending = Mutex::new(pending);
    let (done, results) = mpsc::channel();

    thread::scope(|scope| {
        for _ in 0..workers.clamp(1, jobs.len()) {
            let done = done.clone();
            let pending = &pending;
            scope.spawn(move || {
                loop {
                    let next = pending.lock().unwrap_or_else(PoisonError::into_inner).recv();
                    let Ok(job) = next else { break };
                    let result = match job {
                        Job::Ensure { vm } => dispatcher.ensure(vm),
                        Job::Snapshot { vm, name } => dispatcher.snapshot(vm, name),
                    };
                    if done.send((job.clone(), result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done);
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::sample_document;
    use crate::core::hostlock::LockMode;
    use crate::core::testing::{FakeFabric, MemoryCluster, MemoryRegistry, TestHost};
    use tempfile::tempdir;

    fn notification(key: &str, payload: &[u8]) -> Notification {
        Notification {
            key: key.to_string(),
            value: Some(STANDARD.encode(payload)),
        }
    }

    fn document_notification(document: &VmDocument) -> Notification {
        notification(
            &format!("node/{}", document.name),
            &serde_json::to_vec(document).unwrap(),
        )
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Job>>,
    }

    impl Dispatcher for Recorder {
        fn ensure(&self, vm: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Job::Ensure { vm: vm.to_string() });
            Ok(())
        }

        fn snapshot(&self, vm: &str, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(Job::Snapshot {
                vm: vm.to_string(),
                name: name.to_string(),
            });
            Ok(())
        }
    }

    impl Dispatcher for TestHost {
        fn ensure(&self, vm: &str) -> Result<()> {
            self.agent(vm).ensure(LockMode::NonBlocking).map(drop)
        }

        fn snapshot(&self, vm: &str, name: &str) -> Result<()> {
            self.agent(vm).snapshot(name).map(drop)
        }
    }

    #[test]
    fn parses_consul_style_batches() {
        let input = r#"[{"Key":"node/web","Value":"e30=","Flags":0},{"Key":"node/gone","Value":null}]"#;
        let notifications = parse_notifications(input).unwrap();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].value.as_deref(), Some("e30="));
        assert_eq!(decode(&notifications[1]).unwrap(), None);

        assert!(parse_notifications("  \n").unwrap().is_empty());
        assert!(matches!(
            parse_notifications("{not json"),
            Err(Error::InvalidEvent { .. })
        ));
    }

    #[test]
    fn decodes_documents_and_snapshot_requests() {
        let document = sample_document("web", 3, "host1");
        assert_eq!(
            decode(&document_notification(&document)).unwrap(),
            Some(Change::Document(document.clone()))
        );

        let mismatched = notification("node/db", &serde_json::to_vec(&document).unwrap());
        assert!(matches!(decode(&mismatched), Err(Error::InvalidEvent { .. })));

        let request = notification("snapshot/web", br#"{"vm":"web","snapshot":"nightly"}"#);
        assert_eq!(
            decode(&request).unwrap(),
            Some(Change::Snapshot {
                vm: "web".to_string(),
                name: "nightly".to_string()
            })
        );
        assert_eq!(decode(&notification("other/web", b"{}")).unwrap(), None);
        let garbage = Notification {
            key: "node/web".to_string(),
            value: Some("%%%".to_string()),
        };
        assert!(matches!(decode(&garbage), Err(Error::InvalidEvent { .. })));
    }

    #[test]
    fn newest_generation_wins_and_stale_ones_are_skipped() {
        let dir = tempdir().unwrap();
        let cluster = MemoryCluster::new(&["rbd.ssd"]);
        let registry = MemoryRegistry::new("host1");
        let host = TestHost::new(dir.path(), "host1", &cluster, &registry, &FakeFabric::default());

        let batch = [
            document_notification(&sample_document("test", 4, "host1")),
            document_notification(&sample_document("test", 5, "host1")),
        ];
        let output = handle_notifications(&host.config, &batch, &host).unwrap();
        assert!(output.value.succeeded(), "{:?}", output.value.failures);
        assert_eq!(output.value.staged, vec![("test".to_string(), 5)]);
        assert_eq!(
            output.value.dispatched,
            vec![Job::Ensure {
                vm: "test".to_string()
            }]
        );
        assert_eq!(host.process.start_count(), 1);
        let store = ConfigStore::new(
            "test",
            host.config.active_document("test"),
            host.config.staged_document("test"),
        );
        assert_eq!(store.active_generation().unwrap(), Some(5));

        let stale = [document_notification(&sample_document("test", 4, "host1"))];
        let output = handle_notifications(&host.config, &stale, &host).unwrap();
        assert!(output.value.dispatched.is_empty());
        assert_eq!(output.value.unchanged, vec!["test".to_string()]);
        assert!(output.events.contains(&Event::ConfigUnchanged {
            vm: "test".to_string(),
            generation: 4,
            current: 5,
        }));
        assert_eq!(host.process.start_count(), 1);
    }

    #[test]
    fn bad_notifications_do_not_block_the_batch() {
        let dir = tempdir().unwrap();
        let mut config = crate::core::testing::test_config(dir.path(), "host1");
        config.workers = 4;
        let recorder = Recorder::default();
        let batch = [
            notification("node/broken", b"{"),
            document_notification(&sample_document("a", 1, "host1")),
            document_notification(&sample_document("b", 1, "host2")),
            notification("snapshot/a", br#"{"vm":"a","snapshot":"nightly"}"#),
            notification("snapshot/a", br#"{"vm":"a","snapshot":"nightly"}"#),
        ];

        let output = handle_notifications(&config, &batch, &recorder).unwrap();
        assert_eq!(output.value.failures.len(), 1);
        assert_eq!(output.value.failures[0].0, "node/broken");
        let mut calls = recorder.calls.into_inner().unwrap();
        calls.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        assert_eq!(
            calls,
            vec![
                Job::Ensure { vm: "a".to_string() },
                Job::Ensure { vm: "b".to_string() },
                Job::Snapshot {
                    vm: "a".to_string(),
                    name: "nightly".to_string()
                },
            ]
        );
        assert_eq!(output.value.dispatched.len(), 3);
    }
}
