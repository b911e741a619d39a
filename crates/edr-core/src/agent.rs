//! Agent assembly: spool, probes, connection, sender and the reconnect
//! supervisor, wired from an [`AgentConfig`].
//!
//! Shutdown order is probes first (their final samples reach the spool),
//! then the sender (the in-flight send completes), then the supervisor,
//! then the connection.

use crate::connection::{
    run_reconnect_loop, ConnectionManager, ReconnectPolicy, TcpTransport, Transport,
};
use crate::host::collect_host_identity;
use crate::logging::{event_names, Stage};
use crate::normalize::Normalizer;
use crate::probe::{FileProbe, NetworkProbe, Probe, ProcessProbe};
use crate::runtime::{CollectorRuntime, StopReport};
use crate::sender::Sender;
use crate::signal::Shutdown;
use edr_common::HostIdentity;
use edr_config::{AgentConfig, ProbeSettings};
use edr_spool::{Spool, SpoolError};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Grace period used when an agent is dropped without an explicit shutdown.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("failed to open spool: {0}")]
    Spool(#[from] SpoolError),

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

impl From<AgentError> for edr_common::Error {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Spool(e) => e.into(),
            AgentError::Spawn { source, .. } => edr_common::Error::Io(source),
        }
    }
}

/// Probes enabled in `settings`. The file probe never reports anything
/// under `spool_dir`, so spool writes do not feed back into the spool.
pub fn default_probes(settings: &ProbeSettings, spool_dir: &Path) -> Vec<Box<dyn Probe>> {
    let mut probes: Vec<Box<dyn Probe>> = Vec::new();
    if settings.enable_process {
        probes.push(Box::new(ProcessProbe::new(settings)));
    }
    if settings.enable_network {
        probes.push(Box::new(NetworkProbe::new(settings)));
    }
    if settings.enable_file {
        probes.push(Box::new(FileProbe::new(settings).exclude(spool_dir)));
    }
    probes
}

pub struct Agent<T: Transport + 'static> {
    spool: Arc<Spool>,
    conn: Arc<ConnectionManager<T>>,
    runtime: Option<CollectorRuntime>,
    sender: Option<Sender>,
    supervisor: Option<thread::JoinHandle<()>>,
    supervisor_stop: Shutdown,
}

impl Agent<TcpTransport> {
    /// Start with the TCP transport and the probes enabled in `config`.
    pub fn start(config: &AgentConfig) -> Result<Self, AgentError> {
        let host = collect_host_identity(&config.collector.address());
        Self::start_with(
            config,
            TcpTransport::from_settings(&config.collector),
            host,
            default_probes(&config.probes, &config.spool.resolved_dir()),
        )
    }
}

impl<T: Transport + 'static> Agent<T> {
    pub fn start_with(
        config: &AgentConfig,
        transport: T,
        host: HostIdentity,
        probes: Vec<Box<dyn Probe>>,
    ) -> Result<Self, AgentError> {
        let spool = Arc::new(Spool::open(config.spool.resolved_dir())?);
        let normalizer = Arc::new(Normalizer::new(host.hostname.clone()));
        let hostname = host.hostname.clone();
        let conn = Arc::new(ConnectionManager::new(transport, host));

        // Anything started before a later step fails is stopped by Drop.
        let mut agent = Self {
            runtime: Some(CollectorRuntime::new(normalizer, Arc::clone(&spool))),
            spool,
            conn,
            sender: None,
            supervisor: None,
            supervisor_stop: Shutdown::new(),
        };

        agent.sender = Some(
            Sender::spawn(
                Arc::clone(&agent.spool),
                Arc::clone(&agent.conn),
                config.sender.drain_interval(),
            )
            .map_err(|source| AgentError::Spawn {
                what: "sender",
                source,
            })?,
        );

        agent.supervisor = {
            let conn = Arc::clone(&agent.conn);
            let stop = agent.supervisor_stop.clone();
            let policy = ReconnectPolicy::from_settings(&config.collector);
            Some(
                thread::Builder::new()
                    .name("edr-reconnect".to_string())
                    .spawn(move || run_reconnect_loop(&conn, &policy, &stop))
                    .map_err(|source| AgentError::Spawn {
                        what: "reconnect",
                        source,
                    })?,
            )
        };

        let mut probe_names = Vec::new();
        if let Some(runtime) = agent.runtime.as_mut() {
            for probe in probes {
                let name = probe.name();
                runtime.spawn(probe).map_err(|source| AgentError::Spawn {
                    what: name,
                    source,
                })?;
            }
            probe_names = runtime.probe_names();
        }

        info!(
            event = event_names::AGENT_STARTED,
            stage = %Stage::Init,
            hostname = %hostname,
            spool = %agent.spool.root().display(),
            collector = %config.collector.address(),
            probes = ?probe_names,
            "agent started"
        );

        Ok(agent)
    }

    pub fn spool(&self) -> &Arc<Spool> {
        &self.spool
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.conn
    }

    /// Orderly stop. Probes get `grace` to flush.
    pub fn shutdown(mut self, grace: Duration) -> StopReport {
        self.stop_all(grace)
    }

    fn stop_all(&mut self, grace: Duration) -> StopReport {
        let report = self
            .runtime
            .take()
            .map(|runtime| runtime.stop(grace))
            .unwrap_or_default();
        if let Some(sender) = self.sender.take() {
            sender.stop();
        }
        self.supervisor_stop.trigger();
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        self.conn.disconnect();

        info!(
            event = event_names::AGENT_STOPPED,
            stage = %Stage::Shutdown,
            stopped = ?report.stopped,
            late = ?report.late,
            pending = self.spool.pending_count().unwrap_or(0),
            "agent stopped"
        );
        report
    }
}

impl<T: Transport + 'static> Drop for Agent<T> {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            self.stop_all(DEFAULT_GRACE);
        }
    }
}
