//! Learner role: in-order delivery of closed instances

use std::collections::{BTreeSet, VecDeque};

use tracing::debug;

use super::{to_all, Envelope, InstanceId, InstanceState, MemberId, PaxosConfig, PaxosInstanceStore, PaxosMessage, Payload};

/// A value handed to the application, in log order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub instance: InstanceId,
    pub value: Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnerState {
    Start,
    Learner,
    Leaving,
}

pub struct Learner {
    me: MemberId,
    state: LearnerState,
    others: Vec<MemberId>,
    instances: PaxosInstanceStore,
    next_to_deliver: InstanceId,
    last_learned: Option<InstanceId>,
    last_known_learned: Option<InstanceId>,
    requested: BTreeSet<InstanceId>,
    ready: VecDeque<Delivered>,
}

impl Learner {
    pub fn new(me: MemberId, members: &[MemberId], config: &PaxosConfig) -> Self {
        Self {
            me,
            state: LearnerState::Start,
            others: members.iter().copied().filter(|m| *m != me).collect(),
            instances: PaxosInstanceStore::new(config.delivered_history),
            next_to_deliver: InstanceId(0),
            last_learned: None,
            last_known_learned: None,
            requested: BTreeSet::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn state(&self) -> LearnerState {
        self.state
    }

    pub fn last_delivered(&self) -> Option<InstanceId> {
        self.next_to_deliver.0.checked_sub(1).map(InstanceId)
    }

    pub fn last_learned(&self) -> Option<InstanceId> {
        self.last_learned
    }

    pub fn last_known_learned_in_cluster(&self) -> Option<InstanceId> {
        self.last_known_learned
    }

    pub fn has_delivered_all_known_instances(&self) -> bool {
        self.last_delivered() == self.last_known_learned
    }

    pub fn drain_delivered(&mut self) -> Vec<Delivered> {
        self.ready.drain(..).collect()
    }

    /// Tell `to` how far this learner got
    pub fn catch_up(&self, to: MemberId) -> Option<Envelope> {
        self.last_learned
            .map(|last_learned| Envelope::new(self.me, to, PaxosMessage::CatchUp { last_learned }))
    }

    pub fn join(&mut self) {
        debug!(member = self.me, from = ?self.state, "learner joined");
        self.state = LearnerState::Learner;
    }

    pub fn leave(&mut self) {
        debug!(member = self.me, last_delivered = ?self.last_delivered(), "learner leaving");
        self.instances.leave();
        self.next_to_deliver = InstanceId(0);
        self.last_learned = None;
        self.last_known_learned = None;
        self.requested.clear();
        self.ready.clear();
        self.state = LearnerState::Leaving;
    }

    pub fn handle(&mut self, from: MemberId, message: PaxosMessage) -> Vec<Envelope> {
        match self.state {
            LearnerState::Start | LearnerState::Leaving => Vec::new(),
            LearnerState::Learner => self.handle_active(from, message),
        }
    }

    fn handle_active(&mut self, from: MemberId, message: PaxosMessage) -> Vec<Envelope> {
        match message {
            PaxosMessage::Learn { instance, value } => self.on_learn(instance, value),
            PaxosMessage::LearnRequest { instance } => {
                let reply = match self.instances.get(instance).filter(|i| i.is_closed()).and_then(|i| i.value()) {
                    Some(value) => PaxosMessage::Learn {
                        instance,
                        value: value.clone(),
                    },
                    None => PaxosMessage::LearnFailed { instance },
                };
                vec![Envelope::new(self.me, from, reply)]
            }
            PaxosMessage::LearnFailed { instance } => {
                debug!(member = self.me, %instance, from, "peer could not answer learn request");
                Vec::new()
            }
            PaxosMessage::CatchUp { last_learned } => {
                self.known(last_learned);
                self.missing()
                    .into_iter()
                    .map(|instance| {
                        self.requested.insert(instance);
                        Envelope::new(self.me, from, PaxosMessage::LearnRequest { instance })
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn known(&mut self, instance: InstanceId) {
        if self.last_known_learned.map_or(true, |known| instance > known) {
            self.last_known_learned = Some(instance);
        }
    }

    fn on_learn(&mut self, id: InstanceId, value: Payload) -> Vec<Envelope> {
        if id < self.next_to_deliver {
            return Vec::new();
        }
        let instance = self.instances.get_paxos_instance(id);
        if !instance.is_closed() {
            instance.closed(value);
        }
        self.requested.remove(&id);
        if self.last_learned.map_or(true, |learned| id > learned) {
            self.last_learned = Some(id);
        }
        self.known(id);
        self.deliver();

        let gaps: Vec<InstanceId> = self
            .missing()
            .into_iter()
            .filter(|instance| !self.requested.contains(instance))
            .collect();
        let mut out = Vec::new();
        for instance in gaps {
            debug!(member = self.me, %instance, "requesting missing instance");
            self.requested.insert(instance);
            out.extend(to_all(self.me, &self.others, &PaxosMessage::LearnRequest { instance }));
        }
        out
    }

    fn deliver(&mut self) {
        while let Some(value) = self
            .instances
            .get(self.next_to_deliver)
            .filter(|i| i.state() == InstanceState::Closed)
            .and_then(|i| i.value().cloned())
        {
            let instance = self.next_to_deliver;
            self.instances.delivered(instance);
            self.ready.push_back(Delivered { instance, value });
            self.next_to_deliver = instance.next();
        }
    }

    /// Undelivered instances up to the highest one known in the cluster
    fn missing(&self) -> Vec<InstanceId> {
        let Some(known) = self.last_known_learned else {
            return Vec::new();
        };
        (self.next_to_deliver.0..=known.0)
            .map(InstanceId)
            .filter(|id| !self.instances.get(*id).is_some_and(|i| i.is_closed()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn learner() -> Learner {
        let mut learner = Learner::new(1, &[1, 2, 3], &PaxosConfig::default());
        learner.join();
        learner
    }

    fn learn(id: u64, value: &str) -> PaxosMessage {
        PaxosMessage::Learn { instance: InstanceId(id), value: Payload::from(value) }
    }

    #[test]
    fn test_delivers_in_order_and_requests_gaps() {
        let mut learner = learner();
        let out = learner.handle(2, learn(1, "b"));
        assert!(learner.drain_delivered().is_empty());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|e| e.message == PaxosMessage::LearnRequest { instance: InstanceId(0) }));

        // the gap is only requested once
        assert!(learner.handle(3, learn(2, "c")).is_empty());

        learner.handle(3, learn(0, "a"));
        let delivered: Vec<Payload> = learner.drain_delivered().into_iter().map(|d| d.value).collect();
        assert_eq!(delivered, vec![Payload::from("a"), Payload::from("b"), Payload::from("c")]);
        assert_eq!(learner.last_delivered(), Some(InstanceId(2)));
        assert!(learner.has_delivered_all_known_instances());

        // duplicates of delivered instances are ignored
        assert!(learner.handle(2, learn(1, "b")).is_empty());
        assert!(learner.drain_delivered().is_empty());
    }

    #[test]
    fn test_answers_learn_requests() {
        let mut learner = learner();
        learner.handle(2, learn(0, "a"));
        let out = learner.handle(3, PaxosMessage::LearnRequest { instance: InstanceId(0) });
        assert_eq!(out, vec![Envelope::new(1, 3, learn(0, "a"))]);

        let out = learner.handle(3, PaxosMessage::LearnRequest { instance: InstanceId(4) });
        assert_eq!(out[0].message, PaxosMessage::LearnFailed { instance: InstanceId(4) });
    }

    #[test]
    fn test_catch_up_requests_everything_missing() {
        let mut learner = learner();
        let out = learner.handle(2, PaxosMessage::CatchUp { last_learned: InstanceId(2) });
        let requested: Vec<InstanceId> = out
            .iter()
            .map(|e| match e.message {
                PaxosMessage::LearnRequest { instance } => instance,
                ref other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(requested, vec![InstanceId(0), InstanceId(1), InstanceId(2)]);
        assert!(out.iter().all(|e| e.to == 2));
        assert!(!learner.has_delivered_all_known_instances());
    }
}
