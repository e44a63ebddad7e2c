//! Proposer/learner view of one log instance

use std::collections::{BTreeMap, BTreeSet};

use super::{Ballot, InstanceId, MemberId, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Empty,
    P1Pending,
    P1Ready,
    P2Pending,
    Closed,
    Delivered,
}

#[derive(Debug, Clone)]
pub struct PaxosInstance {
    id: InstanceId,
    state: InstanceState,
    ballot: Option<Ballot>,
    acceptors: Vec<MemberId>,
    promises: BTreeMap<MemberId, Option<(Ballot, Payload)>>,
    accepts: BTreeSet<MemberId>,
    /// Highest ballot an acceptor reported when rejecting us
    highest_seen: Option<Ballot>,
    value: Option<Payload>,
}

impl PaxosInstance {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            state: InstanceState::Empty,
            ballot: None,
            acceptors: Vec::new(),
            promises: BTreeMap::new(),
            accepts: BTreeSet::new(),
            highest_seen: None,
            value: None,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn ballot(&self) -> Option<Ballot> {
        self.ballot
    }

    pub fn acceptors(&self) -> &[MemberId] {
        &self.acceptors
    }

    pub fn value(&self) -> Option<&Payload> {
        self.value.as_ref()
    }

    pub fn highest_seen(&self) -> Option<Ballot> {
        self.highest_seen
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            InstanceState::P1Pending | InstanceState::P1Ready | InstanceState::P2Pending
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, InstanceState::Closed | InstanceState::Delivered)
    }

    /// Start phase 1 with `ballot`
    pub fn propose(&mut self, ballot: Ballot, acceptors: Vec<MemberId>) {
        self.state = InstanceState::P1Pending;
        self.ballot = Some(ballot);
        self.acceptors = acceptors;
        self.promises.clear();
        self.accepts.clear();
    }

    pub fn promise(&mut self, from: MemberId, accepted: Option<(Ballot, Payload)>) {
        if self.state == InstanceState::P1Pending {
            self.promises.insert(from, accepted);
        }
    }

    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }

    /// Value accepted under the highest ballot among the promises, if any.
    /// A proposer must propose it instead of its own.
    pub fn adopted_value(&self) -> Option<&Payload> {
        self.promises
            .values()
            .flatten()
            .max_by_key(|(ballot, _)| *ballot)
            .map(|(_, value)| value)
    }

    pub fn ready(&mut self, value: Payload) {
        self.state = InstanceState::P1Ready;
        self.value = Some(value);
    }

    /// Enter phase 2 with the value chosen in `ready`
    pub fn pending(&mut self) {
        self.state = InstanceState::P2Pending;
        self.accepts.clear();
    }

    pub fn accepted(&mut self, from: MemberId) {
        if self.state == InstanceState::P2Pending {
            self.accepts.insert(from);
        }
    }

    pub fn accept_count(&self) -> usize {
        self.accepts.len()
    }

    pub fn rejected(&mut self, promised: Ballot) {
        if self.highest_seen.map_or(true, |seen| promised > seen) {
            self.highest_seen = Some(promised);
        }
    }

    pub fn closed(&mut self, value: Payload) {
        self.state = InstanceState::Closed;
        self.value = Some(value);
    }

    pub fn delivered(&mut self) {
        self.state = InstanceState::Delivered;
    }
}
