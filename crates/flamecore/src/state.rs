use std::fmt;

/// Status frame sent by a node that wants the whole workflow to stop.
pub const TERMINATION_REQUEST: &str = "requests workflow termination";

/// Lifecycle state of a node as tracked by the supervisor.
///
/// Transitions are driven by protocol frames from the node plus process-exit
/// observations. The `nodes` map of the final report holds the rendered
/// string form of the last state seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Initialised,
    Resolved,
    Connected,
    WaitingFlush,
    Ready,
    Running,
    Success,
    Error(i32),
    Finished,
}

impl NodeState {
    /// Style tag carried on the status bus next to the message.
    pub fn style(&self) -> &'static str {
        match self {
            NodeState::Initialised => "initialised",
            NodeState::Resolved => "resolved",
            NodeState::Connected => "connected",
            NodeState::WaitingFlush => "waiting_flush",
            NodeState::Ready => "ready",
            NodeState::Running => "running",
            NodeState::Success | NodeState::Finished => "finished",
            NodeState::Error(_) => "error",
        }
    }

    /// Parse a status string as reported over the control bus.
    pub fn parse(s: &str) -> Option<NodeState> {
        match s {
            "initialised" => Some(NodeState::Initialised),
            "resolved" => Some(NodeState::Resolved),
            "connected" => Some(NodeState::Connected),
            "waiting_flush" => Some(NodeState::WaitingFlush),
            "ready" => Some(NodeState::Ready),
            "running" => Some(NodeState::Running),
            "success" => Some(NodeState::Success),
            "finished" => Some(NodeState::Finished),
            other => {
                let code = other.strip_prefix("error, exit code ")?;
                code.parse().ok().map(NodeState::Error)
            }
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Initialised => write!(f, "initialised"),
            NodeState::Resolved => write!(f, "resolved"),
            NodeState::Connected => write!(f, "connected"),
            NodeState::WaitingFlush => write!(f, "waiting_flush"),
            NodeState::Ready => write!(f, "ready"),
            NodeState::Running => write!(f, "running"),
            NodeState::Success => write!(f, "success"),
            NodeState::Error(code) => write!(f, "error, exit code {}", code),
            NodeState::Finished => write!(f, "finished"),
        }
    }
}
