//! Messages, block environments and receipts.

use alloy_primitives::{Address, B256, Bytes, Log, U256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Gas limit of a block when none is known.
pub const MAX_GAS_LIMIT: u64 = i64::MAX as u64;

/// A message to execute: a call, or a contract creation if `to` is unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    /// Gas available to the message, `0` for the block gas limit.
    pub gas_limit: u64,
    pub gas_price: u128,
    /// Nonce of the message. [`Vm::apply`](crate::Vm::apply) fills in the sender's nonce if
    /// unset, [`Vm::call`](crate::Vm::call) leaves it to the executor.
    pub nonce: Option<u64>,
}

impl Message {
    /// A call of `to` with `input`.
    pub fn call(from: Address, to: Address, input: impl Into<Bytes>) -> Self {
        Self { from, to: Some(to), input: input.into(), ..Default::default() }
    }

    /// A creation running `init_code`.
    pub fn create(from: Address, init_code: impl Into<Bytes>) -> Self {
        Self { from, to: None, input: init_code.into(), ..Default::default() }
    }

    pub fn with_value(mut self, value: U256) -> Self {
        self.value = value;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn is_create(&self) -> bool {
        self.to.is_none()
    }
}

/// The block messages are executed in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: u64,
    pub coinbase: Address,
    pub gas_limit: u64,
    pub base_fee: u64,
    pub prevrandao: B256,
    pub chain_id: u64,
}

impl Default for BlockContext {
    fn default() -> Self {
        Self {
            number: 0,
            timestamp: now(),
            coinbase: Address::ZERO,
            gas_limit: MAX_GAS_LIMIT,
            base_fee: 0,
            prevrandao: B256::ZERO,
            chain_id: 1,
        }
    }
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

/// How an execution ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ExecutionStatus {
    #[default]
    Success,
    /// Reverted, the output carries the revert data.
    Revert,
    /// Halted, e.g. out of gas or an invalid opcode.
    Halt(String),
}

/// What an [`Executor`](crate::Executor) reports back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub gas_used: u64,
    pub gas_refunded: u64,
    pub output: Bytes,
    pub logs: Vec<Log>,
    pub created_address: Option<Address>,
}

/// The result of a message applied by a [`Vm`](crate::Vm).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Receipt {
    pub status: ExecutionStatus,
    pub gas_used: u64,
    pub gas_refund: u64,
    /// Gas the message needs to succeed: the gas used before refunds.
    pub gas_limit: u64,
    pub output: Bytes,
    pub logs: Vec<Log>,
    /// Address of the created contract, for creations only.
    pub contract_address: Option<Address>,
}

impl Receipt {
    pub(crate) fn new(msg: &Message, outcome: ExecutionOutcome) -> Self {
        Self {
            status: outcome.status,
            gas_used: outcome.gas_used,
            gas_refund: outcome.gas_refunded,
            gas_limit: outcome.gas_used.saturating_add(outcome.gas_refunded),
            output: outcome.output,
            logs: outcome.logs,
            contract_address: if msg.is_create() { outcome.created_address } else { None },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
