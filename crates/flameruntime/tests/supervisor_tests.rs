// crates/flameruntime/tests/supervisor_tests.rs
//
// End-to-end runs of the supervisor lifecycle. Node OS processes are
// stand-in shell scripts; the wire protocol is spoken by in-process tasks
// built on the flamenode runtime.

use flamecore::Retention;
use flameruntime::{
    ArchiveDocument, DatasetData, DirectoryStore, ExecuteOptions, RunStatus, Supervisor,
};
use flamenode::{NodeIo, PlaybookAddress};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SOURCE: &str = r#"{
    "name": "Source",
    "description": "Publishes one value",
    "command": "sh",
    "bin": "entropynodes/bin/idle.sh",
    "inputs": [{"description": {}, "units": {}, "type": {}}],
    "outputs": [{
        "description": {"x": "the value"},
        "units": {"x": "a.u."},
        "retention": {"x": 1}
    }]
}"#;

const DOUBLER: &str = r#"{
    "name": "Doubler",
    "description": "Doubles a state input",
    "command": "sh",
    "bin": "entropynodes/bin/idle.sh",
    "inputs": [{
        "description": {"x": "value to double"},
        "units": {"x": "a.u."},
        "type": {"x": 1}
    }],
    "outputs": [{
        "description": {"y": "doubled value"},
        "units": {"y": "a.u."},
        "retention": {"y": 2}
    }]
}"#;

const SLEEPER: &str = r#"{
    "name": "Sleeper",
    "description": "Never speaks the protocol",
    "command": "sh",
    "bin": "entropynodes/bin/sleep.sh",
    "inputs": [{"description": {}, "units": {}, "type": {}}],
    "outputs": [{
        "description": {"o": "never published"},
        "units": {"o": ""},
        "retention": {"o": 0}
    }]
}"#;

const IDLE: &str = r#"{
    "name": "Idle",
    "description": "Runs until terminated",
    "command": "sh",
    "bin": "entropynodes/bin/idle.sh",
    "inputs": [{"description": {}, "units": {}, "type": {}}],
    "outputs": [{"description": {}, "units": {}, "retention": {}}]
}"#;

// exits 0 on SIGTERM, the way a well-behaved node does
const IDLE_SCRIPT: &str = "#!/bin/sh\ntrap 'exit 0' TERM\nwhile true; do sleep 0.1; done\n";
// dies by the signal instead
const SLEEP_SCRIPT: &str = "#!/bin/sh\nexec sleep 30\n";

fn write_fixture(
    dir: &Path,
    workflow: &str,
    parameters: &str,
    schemas: &[(&str, &str)],
) -> (PathBuf, PathBuf) {
    let schema_dir = dir.join("entropynodes/schema");
    std::fs::create_dir_all(&schema_dir).unwrap();
    for (class, body) in schemas {
        std::fs::write(schema_dir.join(format!("{class}.json")), body).unwrap();
    }
    let bin_dir = dir.join("entropynodes/bin");
    std::fs::create_dir_all(&bin_dir).unwrap();
    std::fs::write(bin_dir.join("idle.sh"), IDLE_SCRIPT).unwrap();
    std::fs::write(bin_dir.join("sleep.sh"), SLEEP_SCRIPT).unwrap();

    let workflow_path = dir.join("workflow.json");
    std::fs::write(&workflow_path, workflow).unwrap();
    let parameters_path = dir.join("parameters.json");
    std::fs::write(&parameters_path, parameters).unwrap();
    (workflow_path, parameters_path)
}

// tests run concurrently, so each gets its own slice of the port space
fn options(dir: &Path, workflow: PathBuf, parameters: PathBuf, port_start: u16) -> ExecuteOptions {
    let mut opts = ExecuteOptions::new(workflow, parameters);
    opts.run_dir = dir.to_path_buf();
    opts.port_start = port_start;
    opts.port_ceiling = port_start + 90;
    opts
}

async fn wait_for_keys(store: &DirectoryStore, keys: &[&str]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if keys.iter().all(|k| store.get(k).is_some()) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "directory keys {keys:?} never appeared"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn empty_workflow_reports_success() {
    let dir = tempfile::tempdir().unwrap();
    let (workflow, parameters) = write_fixture(
        dir.path(),
        r#"{"name": "empty", "nodes": []}"#,
        "{}",
        &[],
    );
    let mut opts = options(dir.path(), workflow, parameters, 25000);
    opts.connection_wait = 1;

    let supervisor = Supervisor::new(opts).await.unwrap();
    let store = supervisor.directory().clone();
    let outcome = supervisor.execute().await.unwrap();

    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(outcome.report.status_message, "");
    assert_eq!(outcome.report.nodes_success, 0);
    assert_eq!(outcome.report.nodes_error, 0);
    assert_eq!(outcome.report.nodes_count, 0);
    assert!(outcome.report.nodes.is_empty());
    assert!(!outcome.archive_failed);

    // archive exists with metadata attributes only
    let doc = ArchiveDocument::read(&dir.path().join("output_data.hdf5")).unwrap();
    assert!(doc.groups.is_empty());
    assert!(doc.attributes.contains_key("project"));
    assert!(doc.attributes.contains_key("job_eui"));
    assert!(!doc.attributes["creation_timestamp"].is_empty());

    // the clean phase leaves nothing behind
    assert!(store.keys().is_empty(), "leftover keys: {:?}", store.keys());
}

#[tokio::test]
async fn barrier_timeout_flags_connection_problem() {
    let dir = tempfile::tempdir().unwrap();
    let (workflow, parameters) = write_fixture(
        dir.path(),
        r#"{"name": "stuck", "nodes": [{"name": "A", "class": "Sleeper"}]}"#,
        "{}",
        &[("Sleeper", SLEEPER)],
    );
    let mut opts = options(dir.path(), workflow, parameters, 25100);
    opts.connection_wait = 2;
    opts.wait_process_timeout = 2;

    let supervisor = Supervisor::new(opts).await.unwrap();
    let store = supervisor.directory().clone();
    let outcome = supervisor.execute().await.unwrap();

    assert_eq!(
        outcome.report.status_message,
        "Connection between nodes timed out before being established."
    );
    assert!(matches!(
        outcome.report.status,
        RunStatus::Failure | RunStatus::PartiallySuccessful
    ));
    // the node never reached success
    assert_ne!(outcome.report.nodes["A"], "success");
    assert!(store.keys().is_empty(), "leftover keys: {:?}", store.keys());
}

#[tokio::test]
async fn zero_connection_wait_times_out_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let (workflow, parameters) = write_fixture(
        dir.path(),
        r#"{"name": "stuck", "nodes": [{"name": "A", "class": "Sleeper"}]}"#,
        "{}",
        &[("Sleeper", SLEEPER)],
    );
    let mut opts = options(dir.path(), workflow, parameters, 25200);
    opts.connection_wait = 0;
    opts.wait_process_timeout = 2;

    let outcome = Supervisor::new(opts).await.unwrap().execute().await.unwrap();
    assert_eq!(
        outcome.report.status_message,
        "Connection between nodes timed out before being established."
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_node_state_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let (workflow, parameters) = write_fixture(
        dir.path(),
        r#"{"name": "pipeline", "nodes": [
            {"name": "a", "class": "Source"},
            {"name": "b", "class": "Doubler"}
        ]}"#,
        r##"{"b": {"x": "#a/x"}}"##,
        &[("Source", SOURCE), ("Doubler", DOUBLER)],
    );
    let mut opts = options(dir.path(), workflow, parameters, 25300);
    opts.connection_wait = 30;

    let supervisor = Supervisor::new(opts).await.unwrap();
    let store = supervisor.directory().clone();
    let (host, port) = supervisor.directory_address();
    let playbook = PlaybookAddress {
        host,
        port,
        db: "0".to_string(),
    };

    let execution = tokio::spawn(supervisor.execute());
    wait_for_keys(&store, &["#a/x", "#b/y", "#a", "#b", "executor_output"]).await;

    let pa = playbook.clone();
    let node_a = tokio::spawn(async move {
        let mut io = NodeIo::connect("a", &pa).await.unwrap();
        io.outputs.define("x", "the value", "a.u.", Retention::Runtime);
        io.ready().await.unwrap();
        io.set("x", &json!(42)).unwrap();
        // keep the publisher alive while the state subscriber reads
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let pb = playbook.clone();
    let node_b = tokio::spawn(async move {
        let mut io = NodeIo::connect("b", &pb).await.unwrap();
        io.inputs.state("x", "value to double", "a.u.");
        io.outputs.define("y", "doubled value", "a.u.", Retention::Archive);
        io.ready().await.unwrap();
        let x = io.get("x").await.unwrap().as_i64().unwrap();
        io.set("y", &json!(x * 2)).unwrap();
        io.request_workflow_termination().await.unwrap();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(60), execution)
        .await
        .expect("execution hung")
        .unwrap()
        .unwrap();
    node_a.await.unwrap();
    node_b.await.unwrap();

    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(outcome.report.nodes_count, 2);
    assert_eq!(outcome.report.nodes["a"], "success");
    assert_eq!(outcome.report.nodes["b"], "success");

    let doc = ArchiveDocument::read(&dir.path().join("output_data.hdf5")).unwrap();
    let group = &doc.groups["b"];
    assert_eq!(group.attributes["type"], "Doubler");
    assert_eq!(group.datasets["y"].data, DatasetData::Int64(vec![84]));
    assert_eq!(group.datasets["y"].attributes["units"], "a.u.");
    assert_eq!(group.datasets["y_time"].data.len(), 1);
    // retention 1 stays in the runtime table, out of the archive
    assert!(!doc.groups["a"].datasets.contains_key("x"));

    assert!(store.keys().is_empty(), "leftover keys: {:?}", store.keys());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execution_timeout_terminates_the_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let (workflow, parameters) = write_fixture(
        dir.path(),
        r#"{"name": "forever", "nodes": [{"name": "c", "class": "Idle"}]}"#,
        "{}",
        &[("Idle", IDLE)],
    );
    let mut opts = options(dir.path(), workflow, parameters, 25400);
    opts.connection_wait = 30;
    opts.max_execution_time = 1;
    opts.wait_process_timeout = 2;

    let supervisor = Supervisor::new(opts).await.unwrap();
    let store = supervisor.directory().clone();
    let (host, port) = supervisor.directory_address();
    let playbook = PlaybookAddress {
        host,
        port,
        db: "0".to_string(),
    };

    let execution = tokio::spawn(supervisor.execute());
    wait_for_keys(&store, &["#c", "executor_output"]).await;

    let node_c = tokio::spawn(async move {
        let mut io = NodeIo::connect("c", &playbook).await.unwrap();
        io.ready().await.unwrap();
        // user code never finishes on its own
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let outcome = tokio::time::timeout(Duration::from_secs(60), execution)
        .await
        .expect("execution hung")
        .unwrap()
        .unwrap();
    node_c.abort();

    assert_eq!(outcome.report.status_message, "Execution timed out.");
    assert_eq!(outcome.report.nodes["c"], "success");
    assert_eq!(outcome.report.status, RunStatus::PartiallySuccessful);
    assert!(store.keys().is_empty(), "leftover keys: {:?}", store.keys());
}
