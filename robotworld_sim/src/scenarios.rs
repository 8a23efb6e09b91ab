//! Protocol scenarios for the simulation harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// Echo round trip between every pair of ring neighbours
    Echo,

    /// Populate request mirrored as a Peer robot on the remote world
    MirrorPopulate,

    /// Start/Stop requests drive the remote robot to its goal
    StartStop,

    /// Snapshot a world as code and rebuild it on a fresh world
    Reconcile,

    /// Partition causes read timeouts, healing restores service
    SplitBrain,

    /// Lossy, jittery link: every request ends in exactly one answer
    LossyLink,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Echo,
            ScenarioId::MirrorPopulate,
            ScenarioId::StartStop,
            ScenarioId::Reconcile,
            ScenarioId::SplitBrain,
            ScenarioId::LossyLink,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Echo => "echo",
            ScenarioId::MirrorPopulate => "mirror_populate",
            ScenarioId::StartStop => "start_stop",
            ScenarioId::Reconcile => "reconcile",
            ScenarioId::SplitBrain => "split_brain",
            ScenarioId::LossyLink => "lossy_link",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Echo => "EchoRequest to the ring neighbour comes back verbatim",
            ScenarioId::MirrorPopulate => "PopulateRequest creates Peer/PeerGoal on the remote world",
            ScenarioId::StartStop => "StartRequest makes the remote robot act until it reaches its goal",
            ScenarioId::Reconcile => "as_code snapshot replays into an identical fresh world",
            ScenarioId::SplitBrain => "Partitioned requests time out, healed link answers again",
            ScenarioId::LossyLink => "30% loss plus jitter, every request answered or timed out once",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "echo" => Ok(ScenarioId::Echo),
            "mirror_populate" | "mirrorpopulate" | "populate" => Ok(ScenarioId::MirrorPopulate),
            "start_stop" | "startstop" => Ok(ScenarioId::StartStop),
            "reconcile" => Ok(ScenarioId::Reconcile),
            "split_brain" | "splitbrain" => Ok(ScenarioId::SplitBrain),
            "lossy_link" | "lossylink" => Ok(ScenarioId::LossyLink),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
