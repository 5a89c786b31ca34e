//! An [`Executor`] running messages on revm's mainnet EVM.

use crate::{BlockContext, ExecutionOutcome, ExecutionStatus, Executor, Message};
use alloy_primitives::U256;
use forksim_fork::{DatabaseError, StateDb};
use revm::{
    ExecuteCommitEvm, MainBuilder, MainContext,
    context::{
        BlockEnv, CfgEnv, Context, TxEnv,
        result::{EVMError, ExecutionResult, Output},
    },
    primitives::{TxKind, hardfork::SpecId},
};

/// Executes messages with revm, committing the resulting state into the [`StateDb`].
///
/// Messages without a nonce skip the nonce check, and messages with a zero gas price skip the
/// base fee check, like `eth_call` does.
#[derive(Clone, Debug)]
pub struct RevmExecutor {
    spec: SpecId,
}

impl Default for RevmExecutor {
    fn default() -> Self {
        Self::new(SpecId::PRAGUE)
    }
}

impl RevmExecutor {
    pub fn new(spec: SpecId) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> SpecId {
        self.spec
    }

    fn block_env(block: &BlockContext) -> BlockEnv {
        BlockEnv {
            number: U256::from(block.number),
            timestamp: U256::from(block.timestamp),
            beneficiary: block.coinbase,
            gas_limit: block.gas_limit,
            basefee: block.base_fee,
            prevrandao: Some(block.prevrandao),
            difficulty: U256::ZERO,
            ..Default::default()
        }
    }

    fn cfg_env(&self, block: &BlockContext, msg: &Message) -> CfgEnv {
        let mut cfg = CfgEnv::new_with_spec(self.spec).with_chain_id(block.chain_id);
        cfg.disable_nonce_check = msg.nonce.is_none();
        cfg.disable_base_fee = msg.gas_price == 0;
        cfg
    }

    fn tx_env(block: &BlockContext, msg: &Message) -> TxEnv {
        TxEnv {
            caller: msg.from,
            kind: msg.to.map_or(TxKind::Create, TxKind::Call),
            value: msg.value,
            data: msg.input.clone(),
            gas_limit: msg.gas_limit,
            gas_price: msg.gas_price,
            nonce: msg.nonce.unwrap_or_default(),
            chain_id: Some(block.chain_id),
            ..Default::default()
        }
    }
}

impl Executor for RevmExecutor {
    type Error = EVMError<DatabaseError>;

    fn execute(
        &mut self,
        db: &mut StateDb,
        block: &BlockContext,
        msg: &Message,
    ) -> Result<ExecutionOutcome, Self::Error> {
        let mut evm = Context::mainnet()
            .with_db(db)
            .with_block(Self::block_env(block))
            .with_cfg(self.cfg_env(block, msg))
            .build_mainnet();
        let result = evm.transact_commit(Self::tx_env(block, msg))?;
        trace!(target: "vm", spec = ?self.spec, success = result.is_success(), "revm transaction committed");
        Ok(outcome(result))
    }
}

fn outcome(result: ExecutionResult) -> ExecutionOutcome {
    match result {
        ExecutionResult::Success { gas_used, gas_refunded, logs, output, .. } => {
            let (output, created_address) = match output {
                Output::Call(data) => (data, None),
                Output::Create(data, address) => (data, address),
            };
            ExecutionOutcome {
                status: ExecutionStatus::Success,
                gas_used,
                gas_refunded,
                output,
                logs,
                created_address,
            }
        }
        ExecutionResult::Revert { gas_used, output } => {
            ExecutionOutcome { status: ExecutionStatus::Revert, gas_used, output, ..Default::default() }
        }
        ExecutionResult::Halt { reason, gas_used } => ExecutionOutcome {
            status: ExecutionStatus::Halt(format!("{reason:?}")),
            gas_used,
            ..Default::default()
        },
    }
}
