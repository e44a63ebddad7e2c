//! Instance bookkeeping for proposers, learners and acceptors

use std::collections::{BTreeMap, VecDeque};

use super::{Ballot, InstanceId, PaxosInstance, Payload};

/// Lazily created `PaxosInstance`s plus a bounded window of delivered ones
#[derive(Debug)]
pub struct PaxosInstanceStore {
    instances: BTreeMap<InstanceId, PaxosInstance>,
    delivered: VecDeque<InstanceId>,
    history: usize,
}

impl PaxosInstanceStore {
    pub fn new(history: usize) -> Self {
        Self {
            instances: BTreeMap::new(),
            delivered: VecDeque::new(),
            history,
        }
    }

    pub fn get_paxos_instance(&mut self, id: InstanceId) -> &mut PaxosInstance {
        self.instances.entry(id).or_insert_with(|| PaxosInstance::new(id))
    }

    pub fn get(&self, id: InstanceId) -> Option<&PaxosInstance> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut PaxosInstance> {
        self.instances.get_mut(&id)
    }

    pub fn remove(&mut self, id: InstanceId) -> Option<PaxosInstance> {
        self.instances.remove(&id)
    }

    /// Mark `id` delivered; instances falling out of the window are forgotten
    pub fn delivered(&mut self, id: InstanceId) {
        self.get_paxos_instance(id).delivered();
        self.delivered.push_back(id);
        while self.delivered.len() > self.history {
            if let Some(oldest) = self.delivered.pop_front() {
                self.instances.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn leave(&mut self) {
        self.instances.clear();
        self.delivered.clear();
    }
}

/// What one acceptor remembers about one instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptorInstance {
    pub promised: Option<Ballot>,
    pub accepted: Option<(Ballot, Payload)>,
}

pub trait AcceptorInstanceStore: Send {
    /// `None` once the instance has been pruned
    fn acceptor_instance(&self, id: InstanceId) -> Option<AcceptorInstance>;

    fn promise(&mut self, id: InstanceId, ballot: Ballot);

    /// Accepting also promises `ballot`
    fn accept(&mut self, id: InstanceId, ballot: Ballot, value: Payload);

    fn last_delivered(&mut self, id: InstanceId);

    fn clear(&mut self);
}

/// Acceptor memory that prunes instances well below the last delivered one
#[derive(Debug)]
pub struct InMemoryAcceptorInstanceStore {
    instances: BTreeMap<InstanceId, AcceptorInstance>,
    pruned_below: InstanceId,
    history: u64,
}

impl InMemoryAcceptorInstanceStore {
    pub fn new(history: usize) -> Self {
        Self {
            instances: BTreeMap::new(),
            pruned_below: InstanceId(0),
            history: history as u64,
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl AcceptorInstanceStore for InMemoryAcceptorInstanceStore {
    fn acceptor_instance(&self, id: InstanceId) -> Option<AcceptorInstance> {
        if id < self.pruned_below {
            return None;
        }
        Some(self.instances.get(&id).cloned().unwrap_or_default())
    }

    fn promise(&mut self, id: InstanceId, ballot: Ballot) {
        self.instances.entry(id).or_default().promised = Some(ballot);
    }

    fn accept(&mut self, id: InstanceId, ballot: Ballot, value: Payload) {
        let instance = self.instances.entry(id).or_default();
        instance.promised = Some(ballot);
        instance.accepted = Some((ballot, value));
    }

    fn last_delivered(&mut self, id: InstanceId) {
        let bound = InstanceId(id.0.saturating_sub(self.history));
        if bound > self.pruned_below {
            self.instances = self.instances.split_off(&bound);
            self.pruned_below = bound;
        }
    }

    fn clear(&mut self) {
        self.instances.clear();
        self.pruned_below = InstanceId(0);
    }
}
