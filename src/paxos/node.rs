//! One cluster member running all three roles

use tracing::debug;

use super::{
    Acceptor, AcceptorInstanceStore, Delivered, Envelope, InMemoryAcceptorInstanceStore, InstanceId, Learner,
    MemberId, PaxosConfig, PaxosError, PaxosMessage, PaxosResult, Payload, Proposer,
};

pub struct PaxosNode<S: AcceptorInstanceStore = InMemoryAcceptorInstanceStore> {
    me: MemberId,
    members: Vec<MemberId>,
    proposer: Proposer,
    acceptor: Acceptor<S>,
    learner: Learner,
}

impl PaxosNode<InMemoryAcceptorInstanceStore> {
    pub fn new(me: MemberId, members: Vec<MemberId>, config: PaxosConfig) -> PaxosResult<Self> {
        let store = InMemoryAcceptorInstanceStore::new(config.delivered_history);
        Self::with_store(me, members, config, store)
    }
}

impl<S: AcceptorInstanceStore> PaxosNode<S> {
    pub fn with_store(me: MemberId, members: Vec<MemberId>, config: PaxosConfig, store: S) -> PaxosResult<Self> {
        config.validate()?;
        if !members.contains(&me) {
            return Err(PaxosError::UnknownMember(me));
        }
        Ok(Self {
            me,
            learner: Learner::new(me, &members, &config),
            proposer: Proposer::new(me, members.clone(), config),
            acceptor: Acceptor::new(me, store),
            members,
        })
    }

    pub fn me(&self) -> MemberId {
        self.me
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn proposer(&self) -> &Proposer {
        &self.proposer
    }

    pub fn acceptor(&self) -> &Acceptor<S> {
        &self.acceptor
    }

    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    pub fn join(&mut self) {
        self.acceptor.join();
        self.learner.join();
        self.proposer.join();
    }

    pub fn leave(&mut self) {
        self.proposer.leave();
        self.learner.leave();
        self.acceptor.leave();
    }

    /// Hand `value` to the local proposer
    pub fn broadcast(&mut self, value: Payload) -> PaxosResult<Vec<Envelope>> {
        self.proposer.handle(self.me, PaxosMessage::Propose { value })
    }

    pub fn timeout(&mut self, instance: InstanceId) -> PaxosResult<Vec<Envelope>> {
        self.proposer.handle(self.me, PaxosMessage::PhaseTimeout { instance })
    }

    pub fn catch_up(&self, to: MemberId) -> Option<Envelope> {
        self.learner.catch_up(to)
    }

    /// Values delivered since the last call, in log order
    pub fn take_delivered(&mut self) -> Vec<Delivered> {
        self.learner.drain_delivered()
    }

    pub fn receive(&mut self, envelope: Envelope) -> PaxosResult<Vec<Envelope>> {
        if envelope.to != self.me {
            return Err(PaxosError::UnknownMember(envelope.to));
        }
        let from = envelope.from;
        match envelope.message {
            message @ (PaxosMessage::Prepare { .. } | PaxosMessage::Accept { .. }) => {
                Ok(self.acceptor.handle(from, message))
            }
            message @ PaxosMessage::Learn { .. } => {
                let before = self.learner.last_delivered();
                let mut out = self.learner.handle(from, message.clone());
                out.extend(self.proposer.handle(from, message)?);
                match self.learner.last_delivered() {
                    Some(delivered) if Some(delivered) != before => {
                        debug!(member = self.me, %delivered, "delivered up to instance");
                        self.acceptor.last_delivered(delivered);
                    }
                    _ => {}
                }
                Ok(out)
            }
            message @ (PaxosMessage::LearnRequest { .. }
            | PaxosMessage::LearnFailed { .. }
            | PaxosMessage::CatchUp { .. }) => Ok(self.learner.handle(from, message)),
            message => self.proposer.handle(from, message),
        }
    }
}
