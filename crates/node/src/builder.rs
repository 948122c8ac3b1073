//! Construction of a [`NodeStateMachine`] from its configuration and
//! collaborators.

use crate::{EpochManager, NodeStateMachine};
use concord_bft::{BftConfig, ConfigError, ReplicaContext};
use concord_core::{CommandSource, LedgerExecutor, PersistenceError, SafetyStateStore};
use concord_types::{KeyPair, LedgerHeader, ValidatorId, ValidatorSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Errors from building a node.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to load safety state: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Static configuration of one replica.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub validator_id: ValidatorId,
    /// Ledger header the first epoch starts from.
    pub genesis_ledger: LedgerHeader,
    /// Validators of the first epoch.
    pub validators: ValidatorSet,
    pub bft: BftConfig,
}

/// Builder for constructing a [`NodeStateMachine`].
///
/// Required fields:
/// - `config` - Identity, genesis and consensus parameters
/// - `signing_key` - Key for votes, timeouts and proposals
/// - `ledger` - Ledger executor for `prepare` and `commit`
/// - `commands` - Source of command batches for proposals
/// - `safety_store` - Durable store for the safety state
///
/// A safety state found in the store is reloaded, so a restarted replica
/// never votes twice in a view.
#[derive(Default)]
pub struct NodeBuilder {
    config: Option<NodeConfig>,
    signing_key: Option<KeyPair>,
    ledger: Option<Arc<dyn LedgerExecutor>>,
    commands: Option<Arc<dyn CommandSource>>,
    safety_store: Option<Arc<dyn SafetyStateStore>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn signing_key(mut self, key: KeyPair) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn LedgerExecutor>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn commands(mut self, commands: Arc<dyn CommandSource>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn safety_store(mut self, store: Arc<dyn SafetyStateStore>) -> Self {
        self.safety_store = Some(store);
        self
    }

    /// Build the node state machine.
    ///
    /// # Errors
    ///
    /// Returns an error if a required field is missing, the consensus
    /// parameters are invalid, or the safety store cannot be read.
    pub fn build(self) -> Result<NodeStateMachine, NodeError> {
        let config = self.config.ok_or(NodeError::Missing("config"))?;
        let key = self.signing_key.ok_or(NodeError::Missing("signing_key"))?;
        let ledger = self.ledger.ok_or(NodeError::Missing("ledger"))?;
        let commands = self.commands.ok_or(NodeError::Missing("commands"))?;
        let safety_store = self
            .safety_store
            .ok_or(NodeError::Missing("safety_store"))?;

        config.bft.validate()?;
        let recovered = safety_store.load()?;
        if let Some(state) = &recovered {
            info!(
                validator = %config.validator_id,
                epoch = state.epoch.0,
                last_voted_view = state.last_voted_view.0,
                "Recovered safety state"
            );
        }

        let ctx = ReplicaContext {
            self_id: config.validator_id,
            key,
            ledger,
            commands,
            safety_store,
            config: config.bft,
        };
        let epochs = EpochManager::new(ctx, config.genesis_ledger, config.validators, recovered)?;
        Ok(NodeStateMachine::new(epochs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{config as bft_config, EpochLedger, MemSafetyStore, TestCommands};
    use concord_core::{Action, ConsensusMessage};
    use concord_types::test_utils::{genesis_ledger, genesis_qc, validator_set};
    use concord_types::{EpochId, SafetyState, View};
    use std::time::Duration;

    fn builder(store: Arc<MemSafetyStore>) -> NodeBuilder {
        let (validators, keys) = validator_set(&[1, 1, 1, 1]);
        NodeBuilder::new()
            .config(NodeConfig {
                validator_id: ValidatorId(2),
                genesis_ledger: genesis_ledger(EpochId(0)),
                validators: validators.clone(),
                bft: bft_config(),
            })
            .signing_key(keys[2].clone())
            .ledger(Arc::new(EpochLedger::new(100, validators)))
            .commands(Arc::new(TestCommands))
            .safety_store(store)
    }

    #[test]
    fn test_missing_fields_reported() {
        let err = NodeBuilder::new().build().unwrap_err();
        assert!(matches!(err, NodeError::Missing("config")));

        let (validators, _) = validator_set(&[1]);
        let err = NodeBuilder::new()
            .config(NodeConfig {
                validator_id: ValidatorId(0),
                genesis_ledger: genesis_ledger(EpochId(0)),
                validators,
                bft: bft_config(),
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, NodeError::Missing("signing_key")));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(MemSafetyStore::default());
        let mut b = builder(store);
        if let Some(config) = b.config.as_mut() {
            config.bft.base_timeout = Duration::ZERO;
        }
        assert!(matches!(b.build(), Err(NodeError::Config(_))));
    }

    #[test]
    fn test_recovered_state_prevents_revote() {
        let store = Arc::new(MemSafetyStore::default());
        let mut state = SafetyState::new(EpochId(0), genesis_qc(EpochId(0)));
        state.last_voted_view = View(1);
        *store.saved.lock() = Some(state);

        let mut node = builder(store).build().unwrap();
        node.start();
        let actions = node.on_local_timer_fire(EpochId(0), View(1));
        assert!(!actions.iter().any(|a| matches!(
            a,
            Action::Broadcast {
                message: ConsensusMessage::Timeout(_)
            }
        )));
        assert_eq!(node.stats().safety_refusals, 1);
    }
}
