//! Source side of a live migration: finds the destination, hands over locks and state, and falls
//! back through rescue, local continuation and destruction when the transfer fails.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use super::agent::{Agent, report_locks};
use super::document::VmDocument;
use super::events::{Event, emit};
use super::hostlock::LockMode;
use super::outcome::{OperationResult, OutgoingOutcome};
use super::process::MigrationPoller;
use super::registry::{freshest, inbound_service_name};
use super::rpc::RpcClient;
use super::timeout::Timeout;
use crate::error::{Error, Result};

const MAX_BACKOFF_EXPONENT: u32 = 10;

impl Agent {
    /// Pushes the running VM to the host named by the active document.
    pub fn outmigrate(&mut self) -> OperationResult<OutgoingOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        let outcome = self.outgoing_migration(&document)?;
        Ok(self.output(outcome))
    }

    pub(super) fn outgoing_migration(&mut self, document: &VmDocument) -> Result<OutgoingOutcome> {
        let vm = self.ctx.vm.clone();
        if !self.process.is_running()? {
            return Err(Error::InvalidCommand {
                vm,
                command: "outmigrate",
                message: "VM is not running on this host".to_string(),
            });
        }

        // The destination derives the same cookie only while the locks are still ours.
        let cookie = self.ctx.volumes(document).auth_cookie()?;
        let target = document.parameters.kvm_host.clone();
        let peer = self.discover(&target)?;
        tracing::info!(vm = %vm, target = %target, peer = %peer, "starting outgoing migration");
        let client = RpcClient::new(peer, cookie, self.ctx.tuning.rpc_timeout);

        let outcome = match self.transfer(document, &client) {
            Ok(()) => Ok(OutgoingOutcome::Migrated {
                destination: target.clone(),
            }),
            Err(err @ Error::ConfigChanged { .. }) => Err(err),
            Err(err) => {
                tracing::error!(vm = %vm, error = %err, "migration failed; starting rescue");
                Ok(self.rescue_cascade(document, &client, &target))
            }
        };
        self.process.release_migration_lock();
        let outcome = outcome?;
        emit(
            &mut self.events,
            Event::MigrationFinished {
                vm,
                outcome: outcome.to_string(),
            },
        );
        Ok(outcome)
    }

    /// Address of the inbound migration service announced by `target`.
    fn discover(&self, target: &str) -> Result<String> {
        let service = inbound_service_name(&self.ctx.vm);
        let mut timeout = Timeout::new(
            self.ctx.config.timeouts.discovery,
            self.ctx.tuning.discovery_interval,
            format!("`{service}` on {target}"),
        );
        loop {
            if self.ctx.store.has_new_config()? {
                return Err(Error::ConfigChanged {
                    vm: self.ctx.vm.clone(),
                });
            }
            let entries: Vec<_> = self
                .ctx
                .registry
                .lookup(&service)?
                .into_iter()
                .filter(|entry| entry.tags.iter().any(|tag| tag == target))
                .collect();
            if let Some(entry) = freshest(&entries) {
                return Ok(format!("{}:{}", entry.address, entry.port));
            }
            timeout.tick_or_fail()?;
        }
    }

    /// Takes the migration lock here and on the destination, backing off randomly while either
    /// side is busy.
    fn acquire_migration_locks(&mut self, client: &RpcClient) -> Result<()> {
        let tuning = self.ctx.tuning;
        for escalation in 0..=tuning.lock_escalations {
            if self.process.acquire_migration_lock()? {
                match client.acquire_migration_lock() {
                    Ok(true) => return Ok(()),
                    Ok(false) => self.process.release_migration_lock(),
                    Err(err) => {
                        self.process.release_migration_lock();
                        return Err(err);
                    }
                }
            }
            let slots = rand::thread_rng().gen_range(0..=1u32 << escalation.min(MAX_BACKOFF_EXPONENT));
            tracing::debug!(vm = %self.ctx.vm, escalation, slots, "migration lock busy; backing off");
            thread::sleep(tuning.lock_slot * slots);
        }
        Err(Error::migration(
            &self.ctx.vm,
            "could not acquire migration locks on both hosts",
        ))
    }

    fn transfer(&mut self, document: &VmDocument, client: &RpcClient) -> Result<()> {
        let vm = self.ctx.vm.clone();
        self.acquire_migration_locks(client)?;

        // Last point where a newer config can still abort cleanly.
        if self.ctx.store.has_new_config()? {
            if let Err(err) = client.cancel() {
                tracing::warn!(vm = %vm, error = %err, "could not cancel destination session");
            }
            return Err(Error::ConfigChanged { vm });
        }
        client.ping(Some(self.ctx.tuning.soft_extension))?;

        let changes = self.ctx.volumes(document).unlock_all(false)?;
        report_locks(&mut self.events, &vm, changes);
        client.acquire_ceph_locks()?;

        let heartbeat = Heartbeat::start(
            &vm,
            client.clone(),
            self.ctx.config.timeouts.heartbeat_interval,
            self.ctx.tuning.soft_extension,
        )?;
        heartbeat.propagate(&vm)?;

        let launch = self.process.running_config()?;
        let uri = client.prepare_incoming(&launch)?;
        heartbeat.propagate(&vm)?;
        self.process.migrate(&uri)?;

        let poller = MigrationPoller::new(
            &vm,
            self.process.as_mut(),
            "completed",
            self.ctx.config.timeouts.migration,
        )
        .with_intervals(self.ctx.tuning.migration_poll, self.ctx.tuning.migration_poll_max);
        for status in poller {
            let status = status?;
            emit(
                &mut self.events,
                Event::MigrationProgress {
                    vm: vm.clone(),
                    status,
                },
            );
            heartbeat.propagate(&vm)?;
        }

        self.process.destroy(false)?;
        emit(&mut self.events, Event::VmDestroyed { vm: vm.clone() });
        client.finish_incoming()?;
        heartbeat.stop();

        self.deregister_vm()?;
        self.process.cleanup()
    }

    /// Recovery after a failed transfer: let the destination take over, else keep running here,
    /// else destroy.
    fn rescue_cascade(
        &mut self,
        document: &VmDocument,
        client: &RpcClient,
        destination: &str,
    ) -> OutgoingOutcome {
        let vm = self.ctx.vm.clone();
        match client.rescue() {
            Ok(()) => {
                tracing::info!(vm = %vm, destination, "destination rescued the VM");
                if self.process.pid_valid() || self.process.is_running().unwrap_or(true) {
                    match self.process.destroy(false) {
                        Ok(()) => emit(&mut self.events, Event::VmDestroyed { vm: vm.clone() }),
                        Err(err) => tracing::error!(vm = %vm, error = %err, "destroy failed"),
                    }
                }
                if let Err(err) = self.deregister_vm() {
                    tracing::warn!(vm = %vm, error = %err, "could not deregister VM");
                }
                if let Err(err) = self.process.cleanup() {
                    tracing::warn!(vm = %vm, error = %err, "could not remove runtime files");
                }
                return OutgoingOutcome::RescuedRemote {
                    destination: destination.to_string(),
                };
            }
            Err(err) => tracing::warn!(vm = %vm, error = %err, "destination could not rescue"),
        }

        if let Err(err) = client.destroy() {
            tracing::warn!(vm = %vm, error = %err, "could not destroy destination");
        }
        if let Err(err) = self.process.cancel_migration() {
            tracing::warn!(vm = %vm, error = %err, "could not cancel migration");
        }

        if self.process.is_running().unwrap_or(false) {
            match self.ctx.volumes(document).lock_all() {
                Ok(changes) => {
                    report_locks(&mut self.events, &vm, changes);
                    tracing::info!(vm = %vm, "VM continues on this host");
                    return OutgoingOutcome::ContinuedLocal;
                }
                Err(err) => tracing::error!(vm = %vm, error = %err, "could not reclaim locks"),
            }
        }
        self.destroy_local(document);
        OutgoingOutcome::Destroyed
    }
}

/// Keeps the destination session alive from a background thread and latches the first failure.
struct Heartbeat {
    stop: Option<Sender<()>>,
    failure: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    fn start(vm: &str, client: RpcClient, interval: Duration, extend: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let failure = Arc::new(Mutex::new(None));
        let latched = Arc::clone(&failure);
        let handle = thread::Builder::new()
            .name(format!("heartbeat-{vm}"))
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(err) = client.ping(Some(extend)) {
                                let mut slot = latched.lock().unwrap_or_else(PoisonError::into_inner);
                                slot.get_or_insert_with(|| err.to_string());
                                break;
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|err| Error::io("Failed to spawn heartbeat thread", err))?;
        Ok(Self {
            stop: Some(stop),
            failure,
            handle: Some(handle),
        })
    }

    fn propagate(&self, vm: &str) -> Result<()> {
        let failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        match failure.as_ref() {
            Some(message) => Err(Error::migration(vm, format!("heartbeat failed: {message}"))),
            None => Ok(()),
        }
    }

    fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::document::sample_document;
    use crate::core::registry::{ServiceRegistration, ServiceRegistry};
    use crate::core::testing::{FakeFabric, MemoryCluster, MemoryRegistry, TestHost};
    use std::net::TcpListener;

    #[test]
    fn outmigrate_requires_a_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MemoryCluster::new(&["rbd.ssd"]);
        let registry = MemoryRegistry::new("host1");
        let host = TestHost::new(dir.path(), "host1", &cluster, &registry, &FakeFabric::default());
        host.stage(&sample_document("test", 1, "host2"));
        let mut agent = host.agent("test");
        agent.ensure(LockMode::NonBlocking).unwrap();

        assert!(matches!(
            agent.outmigrate(),
            Err(Error::InvalidCommand { command: "outmigrate", .. })
        ));
    }

    #[test]
    fn discovery_times_out_without_destination() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = MemoryCluster::new(&["rbd.ssd"]);
        let registry = MemoryRegistry::new("host1");
        let mut host =
            TestHost::new(dir.path(), "host1", &cluster, &registry, &FakeFabric::default());
        host.config.timeouts.discovery = Duration::from_millis(50);
        host.stage(&sample_document("test", 1, "host1"));
        let mut agent = host.agent("test");
        agent.ensure(LockMode::NonBlocking).unwrap();

        // An inbound service announced by an unrelated host is not a candidate.
        registry
            .for_node("host3")
            .register(&ServiceRegistration {
                id: "test-migration-inbound".to_string(),
                name: "test-migration-inbound".to_string(),
                address: "127.0.0.1".to_string(),
                port: 1,
                tags: vec!["host3".to_string()],
                check: None,
            })
            .unwrap();

        assert!(matches!(
            agent.discover("host2"),
            Err(Error::TimedOut { .. })
        ));
        assert!(host.process.guest_running());
    }

    #[test]
    fn heartbeat_latches_first_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let peer = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = RpcClient::new(peer, "c00kie", Duration::from_millis(100));

        let heartbeat = Heartbeat::start(
            "test",
            client,
            Duration::from_millis(5),
            Duration::from_secs(1),
        )
        .unwrap();
        let mut timeout = Timeout::new(Duration::from_secs(5), Duration::from_millis(5), "latch");
        while heartbeat.propagate("test").is_ok() {
            assert!(timeout.tick(), "heartbeat never failed");
        }
        match heartbeat.propagate("test") {
            Err(Error::Migration { message, .. }) => assert!(message.starts_with("heartbeat failed")),
            other => panic!("unexpected result: {other:?}"),
        }
        heartbeat.stop();
    }
}
