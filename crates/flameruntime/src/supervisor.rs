//! The supervisor: owns the whole lifecycle of one workflow execution.
//!
//! resolve → allocate → launch → barrier → run → terminate → archive →
//! clean. Everything is serialized in one control task; node processes are
//! isolated and share only the directory, the control bus, and the runtime
//! database.

use crate::archive::ArchiveStore;
use crate::bridge::DebugBridge;
use crate::container::{ArchiveDocument, DatasetData};
use crate::directory::{DirectoryServer, DirectoryStore};
use crate::loader::{self, LoadedWorkflow};
use crate::ports::{PortAllocator, DEFAULT_PORT_CEILING, DEFAULT_PORT_START};
use crate::report::Report;
use flamecore::events::{
    status_routing_key, BroadcastSink, IggyBus, IggyBusConfig, StatusSink, StatusUpdate,
};
use flamecore::transport::{Collector, Endpoint, Publisher};
use flamecore::wire::{ping, ControlCommand, StatusFrame};
use flamecore::{Eui, FlameError, NodeState, Retention, TERMINATION_REQUEST};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Execution metadata passed on the command line as a JSON object.
#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub project: String,
    #[serde(default = "default_runtime_id")]
    pub runtime_id: i64,
    #[serde(default)]
    pub job_eui: String,
    #[serde(default)]
    pub workflow_eui: String,
    #[serde(default)]
    pub parameters_eui: String,
    #[serde(default)]
    pub workflow_commit_id: Option<String>,
    #[serde(default)]
    pub parameters_commit_id: Option<String>,
    #[serde(default)]
    pub job_description: String,
}

fn default_runtime_id() -> i64 {
    -1
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            project: String::new(),
            runtime_id: default_runtime_id(),
            job_eui: String::new(),
            workflow_eui: String::new(),
            parameters_eui: String::new(),
            workflow_commit_id: None,
            parameters_commit_id: None,
            job_description: String::new(),
        }
    }
}

impl Metadata {
    pub fn from_json_str(raw: &str) -> Result<Self, FlameError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// The archive file base name, derived from the job EUI with a fixed
    /// fallback for command-line runs.
    pub fn job_id(&self) -> String {
        let id = self.job_eui.replace("#/", "");
        if id.is_empty() {
            "output_data".to_string()
        } else {
            id
        }
    }
}

/// Everything the supervisor needs to run one workflow.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub workflow: PathBuf,
    pub parameters: PathBuf,
    /// Seconds; 0 means unbounded.
    pub max_execution_time: u64,
    pub status_check_interval: u64,
    /// Per-barrier-phase deadline in seconds.
    pub connection_wait: u64,
    /// Grace period between terminate and kill.
    pub wait_process_timeout: u64,
    pub metadata: Metadata,
    pub port_start: u16,
    pub port_ceiling: u16,
    /// Directory holding the workflow, `entropynodes/`, and the run outputs.
    pub run_dir: PathBuf,
}

impl ExecuteOptions {
    pub fn new(workflow: impl Into<PathBuf>, parameters: impl Into<PathBuf>) -> Self {
        Self {
            workflow: workflow.into(),
            parameters: parameters.into(),
            max_execution_time: 0,
            status_check_interval: 1,
            connection_wait: 60,
            wait_process_timeout: 3,
            metadata: Metadata::default(),
            port_start: DEFAULT_PORT_START,
            port_ceiling: DEFAULT_PORT_CEILING,
            run_dir: PathBuf::from("."),
        }
    }
}

/// Final result of one execution.
pub struct ExecutionOutcome {
    pub report: Report,
    /// True when the archive file could not be written; the run itself is
    /// still reported normally.
    pub archive_failed: bool,
}

struct TrackedNode {
    child: Child,
    pid: u32,
}

pub struct Supervisor {
    opts: ExecuteOptions,
    loaded: LoadedWorkflow,
    store: DirectoryStore,
    server: DirectoryServer,
    allocator: PortAllocator,
    archive: ArchiveStore,
    sinks: Vec<Arc<dyn StatusSink>>,
    local_status: Arc<BroadcastSink>,
    bridge: Option<DebugBridge>,
    routing_key: String,
    job_id: String,
    cancel: CancellationToken,
    node_status: BTreeMap<String, String>,
    children: HashMap<String, TrackedNode>,
    executor_input: Option<Collector>,
    executor_output: Option<Publisher>,
    port_input: u16,
    port_output: u16,
    connection_problem: bool,
}

impl Supervisor {
    pub async fn new(opts: ExecuteOptions) -> Result<Self, FlameError> {
        let schema_dir = opts.run_dir.join("entropynodes").join("schema");
        let loaded = loader::load(&opts.workflow, &opts.parameters, &schema_dir)?;

        let store = DirectoryStore::new();
        let server = DirectoryServer::bind(store.clone()).await?;
        let allocator = PortAllocator::new(store.clone(), opts.port_start, opts.port_ceiling);

        let db_path = opts.run_dir.join("runtimedata.sqlite");
        let archive = ArchiveStore::reset(&db_path)
            .map_err(|e| FlameError::Archive(e.to_string()))?;
        store.set("dataserver", &db_path.display().to_string());

        let job_id = opts.metadata.job_id();
        let routing_key = status_routing_key(opts.metadata.runtime_id, &job_id);

        let local_status = Arc::new(BroadcastSink::new(256));
        let mut sinks: Vec<Arc<dyn StatusSink>> = vec![local_status.clone()];
        match connect_exchange(IggyBusConfig::messaging("status_updates")).await {
            Some(bus) => sinks.push(Arc::new(bus)),
            None => tracing::info!("No status exchange configured"),
        }

        let bridge = match connect_exchange(IggyBusConfig::node_debug("output_debugging")).await {
            Some(bus) => Some(DebugBridge::spawn(
                Arc::new(bus),
                store.clone(),
                opts.metadata.runtime_id,
                &job_id,
            )),
            None => {
                tracing::info!("No debug exchange configured");
                None
            }
        };

        Ok(Self {
            opts,
            loaded,
            store,
            server,
            allocator,
            archive,
            sinks,
            local_status,
            bridge,
            routing_key,
            job_id,
            cancel: CancellationToken::new(),
            node_status: BTreeMap::new(),
            children: HashMap::new(),
            executor_input: None,
            executor_output: None,
            port_input: 0,
            port_output: 0,
            connection_problem: false,
        })
    }

    /// Token observed by the run loop; cancel it to request termination
    /// (wired to SIGINT/SIGTERM by the binary).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Coordinates of the directory server, as nodes receive them through
    /// `--entropy-playbook`.
    pub fn directory_address(&self) -> (String, u16) {
        (self.server.host().to_string(), self.server.port())
    }

    /// Local fan-out of every status update the supervisor publishes.
    pub fn status_events(&self) -> broadcast::Receiver<StatusUpdate> {
        self.local_status.subscribe()
    }

    pub fn directory(&self) -> &DirectoryStore {
        &self.store
    }

    /// Run the whole lifecycle to completion.
    pub async fn execute(mut self) -> Result<ExecutionOutcome, FlameError> {
        self.setup_control_bus().await?;
        self.resolve().await?;
        self.launch().await?;
        self.barrier().await?;
        let execution_timeout = self.run_loop().await;
        self.terminate().await;

        let archive_failed = match self.archive_outputs() {
            Ok(()) => false,
            Err(e) => {
                tracing::error!("Archive phase failed: {e}");
                true
            }
        };
        self.clean().await;

        let report = Report::build(
            std::mem::take(&mut self.node_status),
            execution_timeout,
            self.connection_problem,
        );
        tracing::info!(status = %report.status, "Execution finished");
        Ok(ExecutionOutcome {
            report,
            archive_failed,
        })
    }

    async fn status_update(&mut self, node: &str, msg: &str, style: &str) {
        tracing::debug!(node, msg, style, "Status update");
        self.node_status.insert(node.to_string(), msg.to_string());
        let update = StatusUpdate::new(node, msg, style);
        for sink in &self.sinks {
            sink.publish(&self.routing_key, &update).await;
        }
    }

    async fn set_state(&mut self, node: &str, state: NodeState) {
        let msg = state.to_string();
        let style = state.style();
        self.status_update(node, &msg, style).await;
    }

    /// Bind the private control bus: `executor_input` receives node status
    /// frames, `executor_output` broadcasts commands to all nodes.
    async fn setup_control_bus(&mut self) -> Result<(), FlameError> {
        self.port_input = self.allocator.reserve("executor_input").await?;
        let input = Collector::bind(&Endpoint::local(self.port_input)).await?;
        self.store.set("executor_input", &input.endpoint().to_string());
        self.executor_input = Some(input);

        self.port_output = self.allocator.reserve("executor_output").await?;
        let output = Publisher::bind(&Endpoint::local(self.port_output)).await?;
        self.store
            .set("executor_output", &output.endpoint().to_string());
        self.executor_output = Some(output);
        Ok(())
    }

    /// Resolve phase: one port and endpoint per output, archive tables for
    /// retained outputs, parameter-resolution rows, and the executor pid.
    async fn resolve(&mut self) -> Result<(), FlameError> {
        tracing::info!(graph = %self.loaded.workflow.to_graph_json(), "Resolving workflow");

        let nodes: Vec<(String, String)> = self
            .loaded
            .workflow
            .nodes()
            .iter()
            .map(|n| (n.name.clone(), n.class.clone()))
            .collect();
        for (name, class) in nodes {
            let outputs: Vec<(String, Retention)> = {
                let schema = self.loaded.registry.require(&class)?;
                schema
                    .output_names()
                    .map(|o| {
                        (
                            o.to_string(),
                            schema.retention(o).unwrap_or(Retention::Transient),
                        )
                    })
                    .collect()
            };
            for (output, retention) in outputs {
                let eui = Eui::new(&name, &output);
                if retention.is_retained() {
                    self.archive
                        .create_table(&eui)
                        .map_err(|e| FlameError::Archive(e.to_string()))?;
                }
                let port = self.allocator.reserve(&eui.to_string()).await?;
                self.store
                    .set(&eui.to_string(), &Endpoint::local(port).to_string());
            }
            self.node_status
                .insert(name.clone(), NodeState::Resolved.to_string());
        }

        for node in self.loaded.workflow.nodes() {
            let resolution = node.resolved_inputs().to_string();
            self.store.set(&format!("#{}", node.name), &resolution);
        }
        self.store
            .set("executor_pid", &std::process::id().to_string());
        Ok(())
    }

    /// Launch phase: spawn one process per node, each in its own process
    /// group, with stdout+stderr redirected to `entropylogs/<node>.log`.
    async fn launch(&mut self) -> Result<(), FlameError> {
        let log_dir = self.opts.run_dir.join("entropylogs");
        std::fs::create_dir_all(&log_dir)?;
        let playbook = self.server.playbook_arg();

        let nodes: Vec<_> = self.loaded.workflow.nodes().to_vec();
        for node in nodes {
            let schema = self.loaded.registry.require(&node.class)?.clone();
            let log = std::fs::File::create(log_dir.join(format!("{}.log", node.name)))?;

            let mut cmd = std::process::Command::new(&schema.command);
            cmd.arg(self.opts.run_dir.join(&schema.bin))
                .arg("--entropy-identity")
                .arg(&node.name)
                .arg("--entropy-playbook")
                .arg(&playbook)
                .stdout(std::process::Stdio::from(log.try_clone()?))
                .stderr(std::process::Stdio::from(log))
                .current_dir(node.host.cwd.as_deref().unwrap_or(&self.opts.run_dir));
            for (key, value) in &node.host.env {
                cmd.env(key, value);
            }
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                // own group, so terminate/kill reaches spawned descendants
                cmd.process_group(0);
            }

            let child = tokio::process::Command::from(cmd)
                .spawn()
                .map_err(|source| FlameError::Spawn {
                    node: node.name.clone(),
                    source,
                })?;
            let pid = child.id().unwrap_or(0);
            self.store.set(&format!("pid#{}", node.name), &pid.to_string());
            self.children
                .insert(node.name.clone(), TrackedNode { child, pid });

            self.set_state(&node.name, NodeState::Initialised).await;
            tracing::info!(node = %node.name, pid, "Node launched");
        }
        Ok(())
    }

    /// One barrier phase: wait until every node has reported `expected`,
    /// optionally pinging on `executor_output` each turn.
    async fn await_phase(&mut self, expected: &str, send_ping: bool) -> bool {
        let total = self.loaded.workflow.len();
        let deadline = Instant::now() + Duration::from_secs(self.opts.connection_wait);
        let mut reached: HashSet<String> = HashSet::new();

        loop {
            if reached.len() == total {
                return true;
            }
            if self.cancel.is_cancelled() || Instant::now() >= deadline {
                tracing::warn!(
                    expected,
                    reached = reached.len(),
                    total,
                    "Barrier phase incomplete"
                );
                return false;
            }
            if send_ping {
                if let Some(output) = &self.executor_output {
                    let _ = output.send(&ping());
                }
            }
            let frame = match &mut self.executor_input {
                Some(input) => input.recv_timeout(Duration::from_millis(200)).await,
                None => None,
            };
            if let Some(frame) = frame.and_then(|v| StatusFrame::from_value(&v)) {
                if self.node_status.get(&frame.eui) != Some(&frame.status) {
                    self.node_status.insert(frame.eui.clone(), frame.status.clone());
                }
                if frame.status == expected {
                    reached.insert(frame.eui);
                }
            }
        }
    }

    fn send_command(&self, command: ControlCommand) {
        if let Some(output) = &self.executor_output {
            if let Ok(value) = serde_json::to_value(command) {
                let _ = output.send(&value);
            }
        }
    }

    /// The four-phase startup barrier: connect → wait_flush → flush → start.
    /// Any phase missing its deadline flags a connection problem and moves
    /// straight to termination.
    async fn barrier(&mut self) -> Result<(), FlameError> {
        if !self.await_phase("connected", true).await {
            self.connection_problem = true;
            self.cancel.cancel();
            return Ok(());
        }

        self.send_command(ControlCommand::WaitFlush);
        if !self.await_phase("waiting_flush", false).await {
            self.connection_problem = true;
            self.cancel.cancel();
            return Ok(());
        }

        self.send_command(ControlCommand::Flush);
        if !self.await_phase("ready", false).await {
            self.connection_problem = true;
            self.cancel.cancel();
            return Ok(());
        }

        self.send_command(ControlCommand::Start);
        tracing::info!("Barrier complete, workflow started");
        Ok(())
    }

    /// Update the tracked set with every process that has exited.
    async fn reap_exited(&mut self) {
        let mut exited = Vec::new();
        for (name, tracked) in self.children.iter_mut() {
            if let Ok(Some(status)) = tracked.child.try_wait() {
                exited.push((name.clone(), status));
            }
        }
        for (name, status) in exited {
            self.children.remove(&name);
            let code = exit_code(&status);
            if is_success_code(code) {
                self.status_update(&name, "success", NodeState::Finished.style())
                    .await;
            } else {
                self.set_state(&name, NodeState::Error(code)).await;
            }
            tracing::info!(node = %name, code, "Node exited");
        }
    }

    /// Run phase: poll for process exits and node frames until all nodes
    /// are gone, termination is requested, or the time budget runs out.
    async fn run_loop(&mut self) -> bool {
        let step = Duration::from_secs(self.opts.status_check_interval.max(1));
        let budget = self.opts.max_execution_time;
        let mut remaining = budget as i64;

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            self.reap_exited().await;
            if self.children.is_empty() {
                return false;
            }
            if budget > 0 && remaining <= 0 {
                tracing::warn!("Execution time budget exhausted");
                return true;
            }

            let mut frames = Vec::new();
            if let Some(input) = &mut self.executor_input {
                while let Some(value) = input.try_recv() {
                    if let Some(frame) = StatusFrame::from_value(&value) {
                        frames.push(frame);
                    }
                }
            }
            for frame in frames {
                if frame.status == TERMINATION_REQUEST {
                    tracing::info!(node = %frame.eui, "Workflow termination requested");
                    self.cancel.cancel();
                } else {
                    self.node_status.insert(frame.eui, frame.status);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(step) => {}
            }
            remaining -= step.as_secs() as i64;
        }
    }

    #[cfg(unix)]
    fn signal_children(&self, sig: i32, only: Option<&HashSet<String>>) {
        for (name, tracked) in &self.children {
            if let Some(only) = only {
                if !only.contains(name) {
                    continue;
                }
            }
            if tracked.pid == 0 {
                continue;
            }
            // negative pid: the whole process group, descendants included
            unsafe {
                libc::kill(-(tracked.pid as i32), sig);
            }
        }
    }

    async fn wait_children(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            self.reap_exited().await;
            if self.children.is_empty() || Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Terminate phase: two-stage forced shutdown. Terminate the process
    /// groups, wait, then kill the survivors and wait again.
    async fn terminate(&mut self) {
        if self.children.is_empty() {
            return;
        }
        let grace = Duration::from_secs(self.opts.wait_process_timeout);

        #[cfg(unix)]
        {
            self.signal_children(libc::SIGTERM, None);
            self.wait_children(grace).await;

            if !self.children.is_empty() {
                let survivors: HashSet<String> = self.children.keys().cloned().collect();
                tracing::warn!(count = survivors.len(), "Killing surviving nodes");
                self.signal_children(libc::SIGKILL, Some(&survivors));
                self.wait_children(grace).await;
            }
        }
        #[cfg(not(unix))]
        {
            for tracked in self.children.values_mut() {
                let _ = tracked.child.start_kill();
            }
            self.wait_children(grace).await;
        }
    }

    /// Archive phase: group per node, dataset plus timestamp sidecar per
    /// retention-2 output, metadata attributes on the root.
    fn archive_outputs(&mut self) -> Result<(), FlameError> {
        let meta = &self.opts.metadata;
        let mut doc = ArchiveDocument::new();
        doc.set_attr("project", &meta.project);
        doc.set_attr("job_eui", &meta.job_eui);
        doc.set_attr("job_description", &meta.job_description);
        doc.set_attr("workflow_eui", &meta.workflow_eui);
        doc.set_attr("parameters_eui", &meta.parameters_eui);
        if let Some(commit) = &meta.workflow_commit_id {
            doc.set_attr("workflow_commit", commit);
        }
        if let Some(commit) = &meta.parameters_commit_id {
            doc.set_attr("parameters_commit", commit);
        }
        doc.set_attr("creation_timestamp", chrono::Local::now().to_rfc3339());

        for node in self.loaded.workflow.nodes() {
            let schema = self.loaded.registry.require(&node.class)?;
            let group = doc.group(&node.name);
            group.set_attr("type", &schema.name);
            group.set_attr("description", &schema.description);
            group.set_attr("bin", &schema.bin);

            for output in schema.output_names() {
                if schema.retention(output) != Some(Retention::Archive) {
                    continue;
                }
                let eui = Eui::new(&node.name, output);
                let rows = self
                    .archive
                    .rows(&eui)
                    .map_err(|e| FlameError::Archive(e.to_string()))?;
                let times: Vec<String> = rows.iter().map(|(t, _)| t.clone()).collect();
                let values: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|(_, v)| {
                        serde_json::from_str(v)
                            .unwrap_or_else(|_| serde_json::Value::String(v.clone()))
                    })
                    .collect();

                let mut attrs = BTreeMap::new();
                attrs.insert(
                    "description".to_string(),
                    schema.output_description(output).to_string(),
                );
                attrs.insert("units".to_string(), schema.output_units(output).to_string());
                group.add_dataset(output, DatasetData::from_json_rows(&values), attrs);
                group.add_dataset(
                    format!("{output}_time"),
                    DatasetData::Text(times),
                    BTreeMap::new(),
                );
            }
        }

        let path = self.opts.run_dir.join(format!("{}.hdf5", self.job_id));
        doc.write(&path)
            .map_err(|e| FlameError::Archive(e.to_string()))?;
        tracing::info!(path = %path.display(), "Archive written");
        Ok(())
    }

    /// Clean phase: drop every port lock, endpoint, pid and resolution row,
    /// then the control-bus entries, then close the control sockets.
    async fn clean(&mut self) {
        for node in self.loaded.workflow.nodes() {
            self.store.delete(&format!("pid#{}", node.name));
            if let Ok(schema) = self.loaded.registry.require(&node.class) {
                for output in schema.output_names() {
                    let eui = Eui::new(&node.name, output).to_string();
                    if let Some(address) = self.store.get(&eui) {
                        if let Ok(endpoint) = address.parse::<Endpoint>() {
                            self.allocator.release(endpoint.port);
                        }
                    }
                    self.store.delete(&eui);
                }
            }
            self.store.delete(&format!("#{}", node.name));
        }

        self.store.delete("dataserver");
        self.store.delete("executor_input");
        self.store.delete("executor_output");
        self.executor_input = None;
        self.executor_output = None;
        self.allocator.release(self.port_input);
        self.allocator.release(self.port_output);
        self.store.delete("executor_pid");

        if let Some(bridge) = self.bridge.take() {
            bridge.stop().await;
        }
    }
}

/// The broker is optional: bound the connection attempt so a missing
/// exchange never stalls startup.
async fn connect_exchange(config: IggyBusConfig) -> Option<IggyBus> {
    match tokio::time::timeout(Duration::from_secs(3), IggyBus::connect(config)).await {
        Ok(Ok(bus)) => Some(bus),
        Ok(Err(e)) => {
            tracing::debug!("Exchange unavailable: {e}");
            None
        }
        Err(_) => {
            tracing::debug!("Exchange connection timed out");
            None
        }
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

/// Exit code 0 is success; 15 stands in for graceful termination on
/// platforms without a terminate signal. Death by signal records as a
/// negative code and counts as an error.
fn is_success_code(code: i32) -> bool {
    matches!(code, 0 | 15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_job_id_fallback() {
        let meta = Metadata::from_json_str("{}").unwrap();
        assert_eq!(meta.runtime_id, -1);
        assert_eq!(meta.job_id(), "output_data");

        let meta = Metadata::from_json_str(
            r##"{"project": "p", "runtime_id": 3, "job_eui": "#/j42"}"##,
        )
        .unwrap();
        assert_eq!(meta.job_id(), "j42");
        assert_eq!(meta.runtime_id, 3);
    }

    #[test]
    fn success_codes() {
        assert!(is_success_code(0));
        assert!(is_success_code(15));
        assert!(!is_success_code(-15));
        assert!(!is_success_code(1));
        assert!(!is_success_code(-9));
    }
}
