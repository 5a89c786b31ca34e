use crate::{init_tracing, utils::MockNode};
use alloy_primitives::{Address, B256, Bytes, U256, address, bytes};
use forksim_fork::{AccountRecord, RpcSource, StateDb, StateSnapshot};
use forksim_vm::{BlockContext, ExecutionStatus, Message, RevmExecutor, Vm, VmError};
use revm::primitives::KECCAK_EMPTY;
use similar_asserts::assert_eq;
use std::sync::Arc;

const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");
const STORE: Address = address!("0x0000000000000000000000000000000000005707");
const REVERTER: Address = address!("0x0000000000000000000000000000000000000bad");

/// Stores the first calldata word at slot 0 and returns it.
fn store_runtime() -> Bytes {
    bytes!("0x6000358060005560005260206000f3")
}

/// Deploys [`store_runtime`].
fn store_init_code() -> Bytes {
    bytes!("0x600f600c600039600f6000f36000358060005560005260206000f3")
}

/// `revert(0, 0)`
fn revert_runtime() -> Bytes {
    bytes!("0x60006000fd")
}

fn word(value: u8) -> B256 {
    B256::with_last_byte(value)
}

fn input(value: u8) -> Bytes {
    word(value).to_vec().into()
}

fn block() -> BlockContext {
    BlockContext { number: 1, gas_limit: 30_000_000, ..Default::default() }
}

fn seeded() -> Vm<RevmExecutor> {
    let mut state = StateSnapshot::default();
    state.accounts.insert(ALICE, AccountRecord::new(0, U256::from(1_000_000), KECCAK_EMPTY));
    Vm::new(StateDb::new().with_state(state), RevmExecutor::default(), block())
}

#[test]
fn deploys_and_calls_contract() {
    init_tracing();
    let mut vm = seeded();

    let receipt = vm.apply(&Message::create(ALICE, store_init_code())).unwrap();
    assert!(receipt.is_success(), "{receipt:?}");
    let created = ALICE.create(0);
    assert_eq!(receipt.contract_address, Some(created));
    assert_eq!(vm.code(created).unwrap(), store_runtime());
    assert_eq!(vm.nonce(ALICE).unwrap(), 1);

    let receipt = vm.apply(&Message::call(ALICE, created, input(0x2a))).unwrap();
    assert!(receipt.is_success(), "{receipt:?}");
    assert_eq!(receipt.output, input(0x2a));
    assert!(receipt.gas_used > 21_000);
    assert_eq!(vm.storage_at(created, B256::ZERO).unwrap(), word(0x2a));
    assert_eq!(vm.nonce(ALICE).unwrap(), 2);

    let receipt = vm.call(&Message::call(ALICE, created, input(0x07))).unwrap();
    assert_eq!(receipt.output, input(0x07));
    assert_eq!(vm.storage_at(created, B256::ZERO).unwrap(), word(0x2a));
    assert_eq!(vm.nonce(ALICE).unwrap(), 2);
}

#[test]
fn transfers_value() {
    let mut vm = seeded();
    let bob = Address::with_last_byte(0xb0);

    let receipt = vm.apply(&Message::call(ALICE, bob, Bytes::new()).with_value(U256::from(10))).unwrap();
    assert!(receipt.is_success());
    assert_eq!(receipt.gas_used, 21_000);
    assert_eq!(vm.balance(bob).unwrap(), U256::from(10));
    assert_eq!(vm.balance(ALICE).unwrap(), U256::from(999_990));
}

#[test]
fn revert_keeps_nonce_bump() {
    let mut vm = seeded();
    vm.set_code(REVERTER, revert_runtime()).unwrap();

    let receipt = vm.apply(&Message::call(ALICE, REVERTER, Bytes::new())).unwrap();
    assert_eq!(receipt.status, ExecutionStatus::Revert);
    assert_eq!(vm.nonce(ALICE).unwrap(), 1);
}

#[test]
fn invalid_transaction_leaves_no_trace() {
    let mut vm = seeded();
    let before = vm.snapshot();

    let msg = Message::call(ALICE, STORE, Bytes::new()).with_value(U256::from(2_000_000));
    let err = vm.apply(&msg).unwrap_err();
    assert!(matches!(err, VmError::Execution(_)), "{err}");
    assert_eq!(vm.snapshot(), before);

    let err = vm.apply(&Message::call(ALICE, STORE, Bytes::new()).with_nonce(3)).unwrap_err();
    assert!(matches!(err, VmError::Execution(_)), "{err}");
    assert_eq!(vm.snapshot(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn executes_against_forked_state() {
    init_tracing();
    let node = MockNode::new(1)
        .with_account(ALICE, 5, U256::from(1_000_000), Bytes::new())
        .with_account(STORE, 1, U256::ZERO, store_runtime())
        .with_storage(STORE, U256::ZERO, word(0x22));
    let db = StateDb::with_source(Arc::new(RpcSource::new(node.clone(), 100)));
    let mut vm = Vm::new(db, RevmExecutor::default(), block());

    let receipt = vm.apply(&Message::call(ALICE, STORE, input(0x33))).unwrap();
    assert!(receipt.is_success(), "{receipt:?}");
    assert_eq!(vm.storage_at(STORE, B256::ZERO).unwrap(), word(0x33));
    assert_eq!(vm.nonce(ALICE).unwrap(), 6);

    let origin = vm.db().origin();
    assert_eq!(origin.accounts[&ALICE].nonce, 5);
    assert_eq!(origin.accounts[&STORE].slot(&B256::ZERO), Some(word(0x22)));
}
