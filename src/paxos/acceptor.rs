//! Acceptor role

use tracing::debug;

use super::{AcceptorInstanceStore, Envelope, MemberId, PaxosMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    Start,
    Acceptor,
    Leaving,
}

pub struct Acceptor<S: AcceptorInstanceStore> {
    me: MemberId,
    state: AcceptorState,
    store: S,
}

impl<S: AcceptorInstanceStore> Acceptor<S> {
    pub fn new(me: MemberId, store: S) -> Self {
        Self {
            me,
            state: AcceptorState::Start,
            store,
        }
    }

    pub fn state(&self) -> AcceptorState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn join(&mut self) {
        debug!(member = self.me, from = ?self.state, "acceptor joined");
        self.state = AcceptorState::Acceptor;
    }

    pub fn leave(&mut self) {
        debug!(member = self.me, "acceptor leaving");
        self.store.clear();
        self.state = AcceptorState::Leaving;
    }

    pub fn last_delivered(&mut self, instance: super::InstanceId) {
        self.store.last_delivered(instance);
    }

    pub fn handle(&mut self, from: MemberId, message: PaxosMessage) -> Vec<Envelope> {
        match self.state {
            AcceptorState::Start | AcceptorState::Leaving => Vec::new(),
            AcceptorState::Acceptor => self.handle_active(from, message),
        }
    }

    fn handle_active(&mut self, from: MemberId, message: PaxosMessage) -> Vec<Envelope> {
        match message {
            PaxosMessage::Prepare { instance, ballot } => {
                let Some(current) = self.store.acceptor_instance(instance) else {
                    debug!(member = self.me, %instance, "prepare for pruned instance ignored");
                    return Vec::new();
                };
                let reply = match current.promised {
                    Some(promised) if ballot < promised => PaxosMessage::RejectPrepare {
                        instance,
                        ballot,
                        promised,
                    },
                    _ => {
                        self.store.promise(instance, ballot);
                        PaxosMessage::Promise {
                            instance,
                            ballot,
                            accepted: current.accepted,
                        }
                    }
                };
                vec![Envelope::new(self.me, from, reply)]
            }
            PaxosMessage::Accept { instance, ballot, value } => {
                let Some(current) = self.store.acceptor_instance(instance) else {
                    debug!(member = self.me, %instance, "accept for pruned instance ignored");
                    return Vec::new();
                };
                let reply = match current.promised {
                    Some(promised) if ballot < promised => PaxosMessage::RejectAccept {
                        instance,
                        ballot,
                        promised,
                    },
                    _ => {
                        self.store.accept(instance, ballot, value);
                        PaxosMessage::Accepted { instance, ballot }
                    }
                };
                vec![Envelope::new(self.me, from, reply)]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::{Ballot, InMemoryAcceptorInstanceStore, InstanceId, Payload};

    fn acceptor() -> Acceptor<InMemoryAcceptorInstanceStore> {
        let mut acceptor = Acceptor::new(1, InMemoryAcceptorInstanceStore::new(100));
        acceptor.join();
        acceptor
    }

    #[test]
    fn test_promise_then_reject_lower_ballot() {
        let mut acceptor = acceptor();
        let high = Ballot { round: 2, member: 3 };
        let low = Ballot { round: 1, member: 2 };

        let out = acceptor.handle(3, PaxosMessage::Prepare { instance: InstanceId(0), ballot: high });
        assert_eq!(
            out[0].message,
            PaxosMessage::Promise { instance: InstanceId(0), ballot: high, accepted: None }
        );

        let out = acceptor.handle(2, PaxosMessage::Prepare { instance: InstanceId(0), ballot: low });
        assert_eq!(out[0].to, 2);
        assert_eq!(
            out[0].message,
            PaxosMessage::RejectPrepare { instance: InstanceId(0), ballot: low, promised: high }
        );

        let out = acceptor.handle(
            2,
            PaxosMessage::Accept { instance: InstanceId(0), ballot: low, value: Payload::from("x") },
        );
        assert!(matches!(out[0].message, PaxosMessage::RejectAccept { .. }));
    }

    #[test]
    fn test_promise_reports_accepted_value() {
        let mut acceptor = acceptor();
        let first = Ballot::initial(2);
        acceptor.handle(2, PaxosMessage::Accept { instance: InstanceId(7), ballot: first, value: Payload::from("a") });

        let second = first.bump(first, 3);
        let out = acceptor.handle(3, PaxosMessage::Prepare { instance: InstanceId(7), ballot: second });
        assert_eq!(
            out[0].message,
            PaxosMessage::Promise {
                instance: InstanceId(7),
                ballot: second,
                accepted: Some((first, Payload::from("a"))),
            }
        );
    }

    #[test]
    fn test_silent_before_join_and_after_leave() {
        let mut acceptor = Acceptor::new(1, InMemoryAcceptorInstanceStore::new(10));
        let prepare = PaxosMessage::Prepare { instance: InstanceId(0), ballot: Ballot::initial(2) };
        assert!(acceptor.handle(2, prepare.clone()).is_empty());

        acceptor.join();
        assert_eq!(acceptor.handle(2, prepare.clone()).len(), 1);
        acceptor.leave();
        assert_eq!(acceptor.state(), AcceptorState::Leaving);
        assert!(acceptor.handle(2, prepare).is_empty());
        assert!(acceptor.store().is_empty());
    }
}
