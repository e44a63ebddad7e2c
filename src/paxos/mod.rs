//! Multi-Paxos consensus core
//!
//! Transport agnostic: every role consumes `Envelope`s and returns the
//! envelopes it wants sent. Timeouts are fed in as `PhaseTimeout` messages
//! by whoever owns the clock.

mod acceptor;
mod instance;
mod learner;
mod node;
mod proposer;
mod store;

pub use acceptor::{Acceptor, AcceptorState};
pub use instance::{InstanceState, PaxosInstance};
pub use learner::{Delivered, Learner, LearnerState};
pub use node::PaxosNode;
pub use proposer::{minimum_quorum, Proposer, ProposerState};
pub use store::{AcceptorInstance, AcceptorInstanceStore, InMemoryAcceptorInstanceStore, PaxosInstanceStore};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type MemberId = u64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaxosError {
    #[error("{role} has not joined the cluster")]
    NotJoined { role: &'static str },

    #[error("Member {0} is not part of the cluster")]
    UnknownMember(MemberId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type PaxosResult<T> = std::result::Result<T, PaxosError>;

/// Consensus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaxosConfig {
    /// Failed acceptors the cluster must tolerate
    pub allowed_failures: usize,
    /// Instances one proposer may drive at the same time
    pub max_concurrent_instances: usize,
    /// Delivered instances kept around to answer learn requests
    pub delivered_history: usize,
}

impl Default for PaxosConfig {
    fn default() -> Self {
        Self {
            allowed_failures: 1,
            max_concurrent_instances: 10,
            delivered_history: 1000,
        }
    }
}

impl PaxosConfig {
    pub fn allowed_failures(mut self, failures: usize) -> Self {
        self.allowed_failures = failures;
        self
    }

    pub fn max_concurrent_instances(mut self, max: usize) -> Self {
        self.max_concurrent_instances = max;
        self
    }

    pub fn delivered_history(mut self, history: usize) -> Self {
        self.delivered_history = history;
        self
    }

    pub fn validate(&self) -> PaxosResult<()> {
        if self.max_concurrent_instances == 0 {
            return Err(PaxosError::InvalidConfig(
                "max_concurrent_instances must be at least 1".into(),
            ));
        }
        if self.delivered_history == 0 {
            return Err(PaxosError::InvalidConfig("delivered_history must be at least 1".into()));
        }
        Ok(())
    }
}

/// Position in the replicated log
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub fn id(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Proposal number, ordered by round first and member second
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub round: u64,
    pub member: MemberId,
}

impl Ballot {
    pub const fn initial(member: MemberId) -> Self {
        Self { round: 1, member }
    }

    /// Smallest ballot of `member` above both `self` and `seen`
    pub fn bump(self, seen: Ballot, member: MemberId) -> Self {
        Self {
            round: self.round.max(seen.round) + 1,
            member,
        }
    }
}

impl Ord for Ballot {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.round, self.member).cmp(&(other.round, other.member))
    }
}

impl PartialOrd for Ballot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Opaque broadcast value
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Payload(pub Vec<u8>);

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage {
    /// Client value handed to the local proposer
    Propose { value: Payload },
    Prepare { instance: InstanceId, ballot: Ballot },
    Promise {
        instance: InstanceId,
        ballot: Ballot,
        accepted: Option<(Ballot, Payload)>,
    },
    RejectPrepare {
        instance: InstanceId,
        ballot: Ballot,
        promised: Ballot,
    },
    Accept {
        instance: InstanceId,
        ballot: Ballot,
        value: Payload,
    },
    Accepted { instance: InstanceId, ballot: Ballot },
    RejectAccept {
        instance: InstanceId,
        ballot: Ballot,
        promised: Ballot,
    },
    /// Closed instance announced to learners
    Learn { instance: InstanceId, value: Payload },
    LearnRequest { instance: InstanceId },
    LearnFailed { instance: InstanceId },
    /// Highest instance learned by the sender
    CatchUp { last_learned: InstanceId },
    /// Local: a phase of `instance` took too long
    PhaseTimeout { instance: InstanceId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MemberId,
    pub to: MemberId,
    pub message: PaxosMessage,
}

impl Envelope {
    pub fn new(from: MemberId, to: MemberId, message: PaxosMessage) -> Self {
        Self { from, to, message }
    }
}

pub(crate) fn to_all(from: MemberId, targets: &[MemberId], message: &PaxosMessage) -> Vec<Envelope> {
    targets
        .iter()
        .map(|to| Envelope::new(from, *to, message.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ballot_order() {
        let a = Ballot { round: 1, member: 3 };
        let b = Ballot { round: 2, member: 1 };
        assert!(a < b);
        assert!(Ballot::initial(2) > Ballot::initial(1));
        assert_eq!(a.bump(b, 3), Ballot { round: 3, member: 3 });
    }

    #[test]
    fn test_config_validation() {
        assert!(PaxosConfig::default().validate().is_ok());
        assert!(PaxosConfig::default().max_concurrent_instances(0).validate().is_err());
        let parsed: PaxosConfig = serde_json::from_str(r#"{"allowed_failures": 2}"#).unwrap();
        assert_eq!(parsed.allowed_failures, 2);
        assert_eq!(parsed.max_concurrent_instances, 10);
    }
}
