//! Destination side of a live migration: a short-lived RPC server driven by the source host.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use serde_json::{Value, json};

use super::agent::{Agent, report_locks};
use super::document::VmDocument;
use super::events::{Event, emit};
use super::hostlock::LockMode;
use super::outcome::{IncomingOutcome, OperationResult, SessionStatus};
use super::process::{LaunchConfig, adapt_incoming};
use super::registry::{HealthCheck, ServiceRegistration, inbound_service_name};
use super::rpc::{Request, Response, read_message, write_message};
use super::timeout::Timeout;
use crate::error::{Error, Result};

const INBOUND_CHECK_INTERVAL: Duration = Duration::from_secs(10);

struct Session {
    cookie: String,
    status: SessionStatus,
    /// Idle cutoff; pings push it out.
    timeout: Timeout,
    /// An authenticated call arrived. From then on a newer config no longer aborts the session.
    contacted: bool,
    calls: usize,
}

impl Agent {
    /// Waits for the source host to push the VM here.
    pub fn inmigrate(&mut self) -> OperationResult<IncomingOutcome> {
        self.events.clear();
        let _guard = self.lock_host(LockMode::Blocking)?;
        let document = self.ctx.store.load_active()?;
        let outcome = self.incoming_session(&document)?;
        Ok(self.output(outcome))
    }

    pub(super) fn incoming_session(&mut self, document: &VmDocument) -> Result<IncomingOutcome> {
        let vm = self.ctx.vm.clone();
        if self.process.is_running()? {
            return Err(Error::InvalidCommand {
                vm,
                command: "inmigrate",
                message: "VM is already running on this host".to_string(),
            });
        }

        let cookie = self.ctx.volumes(document).auth_cookie()?;
        let bind = self.ctx.config.qemu.migration_address.as_str();
        let listener = TcpListener::bind((bind, 0))
            .and_then(|listener| listener.set_nonblocking(true).map(|()| listener))
            .map_err(|err| Error::io(format!("Failed to listen on {bind}"), err))?;
        let port = listener
            .local_addr()
            .map_err(|err| Error::io("Failed to read listener address", err))?
            .port();

        let advertised = self.ctx.config.advertised_address().to_string();
        let service = inbound_service_name(&vm);
        self.ctx.registry.register(&ServiceRegistration {
            id: service.clone(),
            name: service.clone(),
            address: advertised.clone(),
            port,
            tags: vec![self.ctx.config.host.clone()],
            check: Some(HealthCheck::Tcp {
                target: format!("{advertised}:{port}"),
                interval: INBOUND_CHECK_INTERVAL,
            }),
        })?;
        emit(
            &mut self.events,
            Event::ServiceRegistered {
                service: service.clone(),
            },
        );
        tracing::info!(vm = %vm, port, "waiting for incoming migration");

        let mut session = Session {
            cookie,
            status: SessionStatus::Waiting,
            timeout: Timeout::new(
                self.ctx.config.timeouts.incoming,
                self.ctx.tuning.server_tick,
                format!("incoming migration of `{vm}`"),
            ),
            contacted: false,
            calls: 0,
        };
        let served = self.serve(document, &listener, &mut session);
        drop(listener);

        match self.ctx.registry.deregister(&service) {
            Ok(()) => emit(&mut self.events, Event::ServiceDeregistered { service }),
            Err(err) => tracing::warn!(vm = %vm, error = %err, "could not deregister inbound service"),
        }
        self.process.release_migration_lock();
        served?;

        emit(
            &mut self.events,
            Event::MigrationFinished {
                vm,
                outcome: session.status.to_string(),
            },
        );
        Ok(IncomingOutcome {
            status: session.status,
            calls: session.calls,
        })
    }

    fn serve(
        &mut self,
        document: &VmDocument,
        listener: &TcpListener,
        session: &mut Session,
    ) -> Result<()> {
        while !session.status.is_terminal() {
            if !session.contacted && self.ctx.store.has_new_config()? {
                tracing::info!(vm = %self.ctx.vm, "newer config staged before the source made contact");
                return Err(Error::ConfigChanged {
                    vm: self.ctx.vm.clone(),
                });
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    self.handle_connection(document, session, &stream, peer);
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => tracing::warn!(vm = %self.ctx.vm, error = %err, "accept failed"),
            }
            if !session.timeout.tick() {
                tracing::warn!(vm = %self.ctx.vm, status = %session.status, "incoming migration timed out");
                self.destroy_local(document);
                session.status = SessionStatus::Failed;
            }
        }
        Ok(())
    }

    fn handle_connection(
        &mut self,
        document: &VmDocument,
        session: &mut Session,
        stream: &TcpStream,
        peer: SocketAddr,
    ) {
        let rpc_timeout = Some(self.ctx.tuning.rpc_timeout);
        let prepared = stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(rpc_timeout))
            .and_then(|()| stream.set_write_timeout(rpc_timeout));
        if let Err(err) = prepared {
            tracing::warn!(vm = %self.ctx.vm, %peer, error = %err, "could not configure connection");
            return;
        }
        let request: Request = match read_message(stream) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(vm = %self.ctx.vm, %peer, error = %err, "unreadable request");
                return;
            }
        };

        let response = if request.cookie != session.cookie {
            tracing::warn!(vm = %self.ctx.vm, %peer, method = %request.method, "rejecting call with wrong cookie");
            Response::failed(&Error::Authentication {
                method: request.method.clone(),
            })
        } else {
            session.contacted = true;
            session.calls += 1;
            if session.status == SessionStatus::Waiting {
                session.status = SessionStatus::InProgress;
            }
            match self.dispatch(document, session, &request.method, &request.params) {
                Ok(result) => Response::ok(result),
                Err(err) => {
                    tracing::warn!(vm = %self.ctx.vm, method = %request.method, error = %err, "migration call failed");
                    Response::failed(&err)
                }
            }
        };
        if let Err(err) = write_message(stream, &response) {
            tracing::warn!(vm = %self.ctx.vm, %peer, error = %err, "could not send response");
        }
    }

    fn dispatch(
        &mut self,
        document: &VmDocument,
        session: &mut Session,
        method: &str,
        params: &Value,
    ) -> Result<Value> {
        tracing::debug!(vm = %self.ctx.vm, method, "serving migration call");
        match method {
            "ping" => {
                let extend = params
                    .get("timeout")
                    .and_then(Value::as_f64)
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .unwrap_or(self.ctx.tuning.soft_extension);
                session.timeout.extend(extend);
                Ok(json!("pong"))
            }
            "acquire_migration_lock" => Ok(json!(self.process.acquire_migration_lock()?)),
            "acquire_ceph_locks" => {
                let changes = self.ctx.volumes(document).lock_all()?;
                report_locks(&mut self.events, &self.ctx.vm, changes);
                Ok(Value::Null)
            }
            "prepare_incoming" => self.prepare_incoming(document, params),
            "finish_incoming" => {
                if !self.process.is_running()? {
                    return Err(Error::migration(
                        &self.ctx.vm,
                        "VM is not running after the transfer",
                    ));
                }
                self.register_vm()?;
                session.status = SessionStatus::Success;
                self.process.release_migration_lock();
                Ok(Value::Null)
            }
            "rescue" => self.rescue(document, session).map(|()| Value::Null),
            "cancel" => {
                self.destroy_local(document);
                session.status = SessionStatus::Cancelled;
                Ok(Value::Null)
            }
            "destroy" => {
                self.destroy_local(document);
                session.status = SessionStatus::Destroyed;
                Ok(Value::Null)
            }
            _ => Err(Error::InvalidCommand {
                vm: self.ctx.vm.clone(),
                command: "serve",
                message: format!("unknown method `{method}`"),
            }),
        }
    }

    fn prepare_incoming(&mut self, document: &VmDocument, params: &Value) -> Result<Value> {
        let launch: LaunchConfig =
            serde_json::from_value(params.get("launch").cloned().unwrap_or(Value::Null))
                .map_err(|err| {
                    Error::migration(&self.ctx.vm, format!("malformed launch config: {err}"))
                })?;
        let launch = adapt_incoming(&launch, &self.ctx.paths);
        let started = self
            .adopt_incoming_memory(document, &launch)
            .and_then(|()| self.process.start_incoming(&launch));
        match started {
            Ok(uri) => {
                emit(
                    &mut self.events,
                    Event::VmStarted {
                        vm: self.ctx.vm.clone(),
                        incoming: true,
                    },
                );
                Ok(json!({ "uri": uri }))
            }
            Err(err) => {
                match self.ctx.volumes(document).unlock_all(false) {
                    Ok(changes) => report_locks(&mut self.events, &self.ctx.vm, changes),
                    Err(unlock) => {
                        tracing::error!(vm = %self.ctx.vm, error = %unlock, "could not release locks")
                    }
                }
                Err(err)
            }
        }
    }

    /// The guest keeps the memory it was started with on the source; the local document follows.
    fn adopt_incoming_memory(&self, document: &VmDocument, launch: &LaunchConfig) -> Result<()> {
        let Some(memory) = launch.memory_mib() else {
            return Ok(());
        };
        if memory == document.parameters.memory {
            return Ok(());
        }
        tracing::info!(
            vm = %self.ctx.vm,
            incoming = memory,
            configured = document.parameters.memory,
            "adopting the incoming memory size"
        );
        let mut active = self.ctx.store.load_active()?;
        active.parameters.memory = memory;
        self.ctx.store.save_active(&active)
    }

    /// Takes the VM over after a failed transfer, if it already runs here.
    fn rescue(&mut self, document: &VmDocument, session: &mut Session) -> Result<()> {
        if !self.process.is_running()? {
            self.destroy_local(document);
            session.status = SessionStatus::Failed;
            return Err(Error::migration(
                &self.ctx.vm,
                "cannot rescue: VM is not running here",
            ));
        }
        match self.ctx.volumes(document).lock_all() {
            Ok(changes) => {
                report_locks(&mut self.events, &self.ctx.vm, changes);
                self.register_vm()?;
                session.status = SessionStatus::Success;
                tracing::info!(vm = %self.ctx.vm, "rescued VM after failed transfer");
                Ok(())
            }
            Err(err) => {
                self.destroy_local(document);
                session.status = SessionStatus::Destroyed;
                Err(err)
            }
        }
    }
}
