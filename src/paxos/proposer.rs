//! Proposer role

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use super::{
    to_all, Ballot, Envelope, InstanceId, InstanceState, MemberId, PaxosConfig, PaxosError, PaxosInstanceStore,
    PaxosMessage, PaxosResult, Payload,
};

/// Votes needed out of `acceptors`: `n - f` when `n >= 2f + 1`, otherwise all of them
pub fn minimum_quorum(acceptors: usize, allowed_failures: usize) -> usize {
    if acceptors >= 2 * allowed_failures + 1 {
        acceptors - allowed_failures
    } else {
        acceptors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposerState {
    Start,
    Proposer,
    Leaving,
}

pub struct Proposer {
    me: MemberId,
    state: ProposerState,
    config: PaxosConfig,
    acceptors: Vec<MemberId>,
    learners: Vec<MemberId>,
    instances: PaxosInstanceStore,
    pending_values: VecDeque<Payload>,
    booked: BTreeMap<InstanceId, Payload>,
    next_instance_id: u64,
    last_known_learned: Option<InstanceId>,
}

impl Proposer {
    pub fn new(me: MemberId, members: Vec<MemberId>, config: PaxosConfig) -> Self {
        Self {
            me,
            state: ProposerState::Start,
            instances: PaxosInstanceStore::new(config.delivered_history),
            config,
            acceptors: members.clone(),
            learners: members,
            pending_values: VecDeque::new(),
            booked: BTreeMap::new(),
            next_instance_id: 0,
            last_known_learned: None,
        }
    }

    pub fn state(&self) -> ProposerState {
        self.state
    }

    pub fn quorum(&self) -> usize {
        minimum_quorum(self.acceptors.len(), self.config.allowed_failures)
    }

    pub fn pending_len(&self) -> usize {
        self.pending_values.len()
    }

    pub fn booked_instances(&self) -> Vec<InstanceId> {
        self.booked.keys().copied().collect()
    }

    pub fn join(&mut self) {
        debug!(member = self.me, from = ?self.state, "proposer joined");
        self.state = ProposerState::Proposer;
    }

    pub fn leave(&mut self) {
        debug!(member = self.me, pending = self.pending_values.len(), "proposer leaving");
        self.pending_values.clear();
        self.booked.clear();
        self.next_instance_id = 0;
        self.last_known_learned = None;
        self.instances.leave();
        self.state = ProposerState::Leaving;
    }

    pub fn handle(&mut self, from: MemberId, message: PaxosMessage) -> PaxosResult<Vec<Envelope>> {
        match self.state {
            ProposerState::Start | ProposerState::Leaving => match message {
                PaxosMessage::Propose { .. } => Err(PaxosError::NotJoined { role: "proposer" }),
                _ => Ok(Vec::new()),
            },
            ProposerState::Proposer => Ok(self.handle_active(from, message)),
        }
    }

    fn handle_active(&mut self, from: MemberId, message: PaxosMessage) -> Vec<Envelope> {
        match message {
            PaxosMessage::Propose { value } => {
                self.pending_values.push_back(value);
                self.drain_pending()
            }
            PaxosMessage::Promise {
                instance,
                ballot,
                accepted,
            } => self.on_promise(from, instance, ballot, accepted),
            PaxosMessage::Accepted { instance, ballot } => self.on_accepted(from, instance, ballot),
            PaxosMessage::RejectPrepare {
                instance,
                ballot,
                promised,
            } => self.on_reject(instance, ballot, promised, InstanceState::P1Pending),
            PaxosMessage::RejectAccept {
                instance,
                ballot,
                promised,
            } => self.on_reject(instance, ballot, promised, InstanceState::P2Pending),
            PaxosMessage::PhaseTimeout { instance } => {
                let open = self.instances.get(instance).is_some_and(|i| i.is_open());
                if open {
                    debug!(member = self.me, %instance, "phase timed out, retrying with a higher ballot");
                    self.restart(instance)
                } else {
                    Vec::new()
                }
            }
            PaxosMessage::Learn { instance, value } => self.on_learned(instance, value),
            _ => Vec::new(),
        }
    }

    fn new_instance_id(&mut self) -> InstanceId {
        if let Some(learned) = self.last_known_learned {
            if learned.0 >= self.next_instance_id {
                self.next_instance_id = learned.0 + 1;
            }
        }
        let id = InstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        id
    }

    fn drain_pending(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while self.booked.len() < self.config.max_concurrent_instances {
            let Some(value) = self.pending_values.pop_front() else {
                break;
            };
            let id = self.new_instance_id();
            let ballot = Ballot::initial(self.me);
            self.instances
                .get_paxos_instance(id)
                .propose(ballot, self.acceptors.clone());
            self.booked.insert(id, value);
            out.extend(to_all(self.me, &self.acceptors, &PaxosMessage::Prepare { instance: id, ballot }));
        }
        out
    }

    /// Phase 1 again with a ballot above anything seen for `id`
    fn restart(&mut self, id: InstanceId) -> Vec<Envelope> {
        let Some(instance) = self.instances.get_mut(id) else {
            return Vec::new();
        };
        let current = instance.ballot().unwrap_or(Ballot::initial(self.me));
        let ballot = current.bump(instance.highest_seen().unwrap_or(current), self.me);
        instance.propose(ballot, self.acceptors.clone());
        to_all(self.me, &self.acceptors, &PaxosMessage::Prepare { instance: id, ballot })
    }

    fn on_reject(&mut self, id: InstanceId, ballot: Ballot, promised: Ballot, phase: InstanceState) -> Vec<Envelope> {
        let Some(instance) = self.instances.get_mut(id) else {
            return Vec::new();
        };
        if instance.state() != phase || instance.ballot() != Some(ballot) {
            return Vec::new();
        }
        instance.rejected(promised);
        debug!(member = self.me, %id, ?promised, ?phase, "rejected, retrying with a higher ballot");
        self.restart(id)
    }

    fn on_promise(
        &mut self,
        from: MemberId,
        id: InstanceId,
        ballot: Ballot,
        accepted: Option<(Ballot, Payload)>,
    ) -> Vec<Envelope> {
        let quorum = self.quorum();
        let Some(instance) = self.instances.get_mut(id) else {
            return Vec::new();
        };
        if instance.state() != InstanceState::P1Pending || instance.ballot() != Some(ballot) {
            return Vec::new();
        }
        instance.promise(from, accepted);
        if instance.promise_count() < quorum {
            return Vec::new();
        }
        let Some(booked) = self.booked.get(&id).cloned() else {
            return Vec::new();
        };
        let value = match instance.adopted_value().cloned() {
            Some(adopted) if adopted != booked => {
                // our value has to wait for another instance
                self.pending_values.push_front(booked);
                self.booked.insert(id, adopted.clone());
                adopted
            }
            _ => booked,
        };
        instance.ready(value.clone());
        instance.pending();
        let acceptors = instance.acceptors().to_vec();

        let mut out = to_all(self.me, &acceptors, &PaxosMessage::Accept { instance: id, ballot, value });
        out.extend(self.drain_pending());
        out
    }

    fn on_accepted(&mut self, from: MemberId, id: InstanceId, ballot: Ballot) -> Vec<Envelope> {
        let quorum = self.quorum();
        let Some(instance) = self.instances.get_mut(id) else {
            return Vec::new();
        };
        if instance.state() != InstanceState::P2Pending || instance.ballot() != Some(ballot) {
            return Vec::new();
        }
        instance.accepted(from);
        if instance.accept_count() < quorum {
            return Vec::new();
        }
        let Some(value) = instance.value().cloned() else {
            return Vec::new();
        };
        instance.closed(value.clone());
        self.booked.remove(&id);

        let mut out = to_all(self.me, &self.learners, &PaxosMessage::Learn { instance: id, value });
        out.extend(self.drain_pending());
        out
    }

    fn on_learned(&mut self, id: InstanceId, value: Payload) -> Vec<Envelope> {
        if self.last_known_learned.map_or(true, |known| id > known) {
            self.last_known_learned = Some(id);
        }
        if let Some(booked) = self.booked.remove(&id) {
            if booked != value {
                debug!(member = self.me, %id, "instance decided another value, re-proposing ours");
                self.pending_values.push_front(booked);
            }
        }
        self.instances.remove(id);
        self.drain_pending()
    }
}
