//! Mock consensus and ownership for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::cluster::{Consensus, ConsensusError, OwnershipOracle, UpdateProcessStateCommand};
use crate::state::ProcessState;
use crate::sync::lock;
use crate::task::{DatabaseTopology, EtlConfiguration};

type StateKey = (String, String, String);

fn key(database: &str, configuration: &str, transformation: &str) -> StateKey {
    (
        database.to_lowercase(),
        configuration.to_lowercase(),
        transformation.to_lowercase(),
    )
}

/// Mock implementation of [`Consensus`].
///
/// Commands are applied as soon as the leader accepts them, so waiting for
/// an index returned by `send_to_leader` always succeeds.
#[derive(Debug, Default)]
pub struct MockConsensus {
    states: Mutex<HashMap<StateKey, ProcessState>>,
    commands: Mutex<Vec<UpdateProcessStateCommand>>,
    applied_index: AtomicU64,
    transient_failures: AtomicU32,
    rejecting: AtomicBool,
}

impl MockConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepted commands, in log order.
    pub fn commands(&self) -> Vec<UpdateProcessStateCommand> {
        lock(&self.commands).clone()
    }

    /// Etags of accepted commands, in log order.
    pub fn committed_etags(&self) -> Vec<u64> {
        lock(&self.commands)
            .iter()
            .map(|c| c.last_processed_etag)
            .collect()
    }

    pub fn state(&self, database: &str, configuration: &str, transformation: &str) -> ProcessState {
        self.process_state(database, configuration, transformation)
    }

    pub fn set_state(&self, database: &str, state: ProcessState) {
        let key = key(database, &state.configuration_name, &state.transformation_name);
        lock(&self.states).insert(key, state);
    }

    /// Administrator reset: the task starts over from etag zero.
    pub fn reset_state(&self, database: &str, configuration: &str, transformation: &str) {
        lock(&self.states).remove(&key(database, configuration, transformation));
    }

    /// Fail the next `count` submissions with a transient error.
    pub fn fail_transiently(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consensus for MockConsensus {
    fn process_state(&self, database: &str, configuration: &str, transformation: &str) -> ProcessState {
        lock(&self.states)
            .get(&key(database, configuration, transformation))
            .cloned()
            .unwrap_or_else(|| ProcessState::new(configuration, transformation))
    }

    async fn send_to_leader(
        &self,
        command: UpdateProcessStateCommand,
    ) -> Result<(u64, ProcessState), ConsensusError> {
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConsensusError::Transient("no leader elected".to_string()));
        }
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(ConsensusError::Rejected("simulated rejection".to_string()));
        }

        let state = {
            let mut states = lock(&self.states);
            let state = states
                .entry(key(
                    &command.database,
                    &command.configuration_name,
                    &command.transformation_name,
                ))
                .or_insert_with(|| {
                    ProcessState::new(&command.configuration_name, &command.transformation_name)
                });
            command.apply(state);
            state.clone()
        };
        lock(&self.commands).push(command);
        let index = self.applied_index.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((index, state))
    }

    async fn wait_for_index_applied(&self, index: u64, _timeout: Duration) -> Result<(), ConsensusError> {
        if index <= self.applied_index() {
            Ok(())
        } else {
            Err(ConsensusError::Timeout { index })
        }
    }
}

/// Mock implementation of [`OwnershipOracle`].
///
/// Every task belongs to the default owner unless overridden per configuration.
#[derive(Debug, Default)]
pub struct MockOwnership {
    default_owner: Mutex<Option<String>>,
    owners: Mutex<HashMap<String, Option<String>>>,
}

impl MockOwnership {
    /// Every task is owned by `node_tag`.
    pub fn node(node_tag: &str) -> Self {
        Self {
            default_owner: Mutex::new(Some(node_tag.to_string())),
            owners: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_owner(&self, configuration: &str, owner: Option<&str>) {
        lock(&self.owners).insert(configuration.to_lowercase(), owner.map(str::to_string));
    }

    pub fn set_default_owner(&self, owner: Option<&str>) {
        *lock(&self.default_owner) = owner.map(str::to_string);
    }
}

impl OwnershipOracle for MockOwnership {
    fn whose_task_is_it(
        &self,
        topology: &DatabaseTopology,
        configuration: &EtlConfiguration,
        _state: &ProcessState,
    ) -> Option<String> {
        let owner = match lock(&self.owners).get(&configuration.name.to_lowercase()) {
            Some(owner) => owner.clone(),
            None => lock(&self.default_owner).clone(),
        };
        owner.filter(|tag| topology.members.is_empty() || topology.contains(tag))
    }
}
