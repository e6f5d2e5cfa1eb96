//! The in-node runtime: directory discovery, input/output wiring, and the
//! four-phase startup barrier. User code runs only after `ready` returns.

use crate::inputs::Inputs;
use crate::outputs::Outputs;
use crate::playbook::{parse_node_args, PlaybookAddress};
use flamecore::transport::{Emitter, Endpoint, SubscribeMode, Subscriber};
use flamecore::wire::{is_ping, ControlCommand, StatusFrame};
use flamecore::{DirectoryClient, DirectoryError, FlameError, TERMINATION_REQUEST};
use std::time::Duration;

pub struct NodeIo {
    identity: String,
    directory: DirectoryClient,
    pub inputs: Inputs,
    pub outputs: Outputs,
    control_rx: Option<Subscriber>,
    control_tx: Option<Emitter>,
}

impl NodeIo {
    /// Connect to the directory server named in the playbook address.
    pub async fn connect(identity: &str, playbook: &PlaybookAddress) -> Result<Self, FlameError> {
        let directory = DirectoryClient::connect(&playbook.host, playbook.port).await?;
        Ok(Self {
            identity: identity.to_string(),
            directory,
            inputs: Inputs::new(),
            outputs: Outputs::new(),
            control_rx: None,
            control_tx: None,
        })
    }

    /// Connect using the process arguments of the node contract.
    pub async fn from_env() -> Result<Self, FlameError> {
        let (identity, playbook) = parse_node_args(std::env::args())?;
        Self::connect(&identity, &playbook).await
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    async fn send_status(&mut self, status: &str) -> Result<(), FlameError> {
        let frame = StatusFrame::new(&self.identity, status);
        if let Some(tx) = &mut self.control_tx {
            tx.send(&frame).await?;
        }
        Ok(())
    }

    async fn control_endpoint(&self, key: &str) -> Result<Endpoint, FlameError> {
        let address = self
            .directory
            .get(key)
            .await?
            .ok_or_else(|| DirectoryError::Protocol(format!("no '{key}' registered")))?;
        Ok(address.parse()?)
    }

    /// Wait for one specific supervisor command, ignoring pings and any
    /// earlier commands.
    async fn wait_command(&mut self, expected: ControlCommand) -> Result<(), FlameError> {
        let rx = self
            .control_rx
            .as_mut()
            .ok_or_else(|| DirectoryError::Protocol("control bus not connected".to_string()))?;
        loop {
            let value = rx
                .recv()
                .await
                .ok_or(FlameError::Transport(flamecore::TransportError::Closed))?;
            if ControlCommand::from_value(&value) == Some(expected) {
                return Ok(());
            }
        }
    }

    /// Participate in the startup barrier: bind outputs, connect inputs,
    /// then drive connect → wait_flush → flush → start. Returns once the
    /// supervisor releases the workflow.
    pub async fn ready(&mut self) -> Result<(), FlameError> {
        self.outputs.bind(&self.directory, &self.identity).await?;
        self.inputs.connect(&self.directory, &self.identity).await?;

        let input_endpoint = self.control_endpoint("executor_input").await?;
        self.control_tx = Some(Emitter::connect(&input_endpoint).await?);
        let output_endpoint = self.control_endpoint("executor_output").await?;
        self.control_rx =
            Some(Subscriber::connect(&output_endpoint, SubscribeMode::Queue).await?);

        // connect phase: ping every output, poll every input, report
        // connected once the supervisor ping and every input ping have been
        // seen. Keep pinging until wait_flush arrives: peers may still be
        // waiting for a first ping on the outputs of this node.
        let mut supervisor_seen = false;
        let mut connected_sent = false;
        let mut wait_flush_seen = false;
        'connect: loop {
            self.outputs.ping_all();
            if let Some(rx) = &mut self.control_rx {
                while let Some(value) = rx.try_recv() {
                    if is_ping(&value) {
                        supervisor_seen = true;
                    } else if ControlCommand::from_value(&value)
                        == Some(ControlCommand::WaitFlush)
                    {
                        wait_flush_seen = true;
                    }
                }
            }
            let inputs_ready = self.inputs.poll_pings();
            if !connected_sent && supervisor_seen && inputs_ready {
                self.send_status("connected").await?;
                connected_sent = true;
            }
            if connected_sent && wait_flush_seen {
                break 'connect;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.send_status("waiting_flush").await?;

        self.wait_command(ControlCommand::Flush).await?;
        self.inputs.flush();
        self.send_status("ready").await?;

        self.wait_command(ControlCommand::Start).await?;
        self.send_status("running").await?;
        tracing::debug!(node = %self.identity, "Barrier complete");
        Ok(())
    }

    /// Read one input value.
    pub async fn get(&mut self, input: &str) -> Result<serde_json::Value, FlameError> {
        self.inputs.get(input).await
    }

    /// Publish one output value (and persist it when retained).
    pub fn set(&mut self, output: &str, value: &serde_json::Value) -> Result<(), FlameError> {
        let identity = self.identity.clone();
        self.outputs.set(&identity, output, value)
    }

    /// Ask the supervisor to wind down the whole workflow.
    pub async fn request_workflow_termination(&mut self) -> Result<(), FlameError> {
        self.send_status(TERMINATION_REQUEST).await
    }

    /// Report a free-form status on the control bus.
    pub async fn update_status(&mut self, status: &str) -> Result<(), FlameError> {
        self.send_status(status).await
    }
}
