use crate::{
    init_tracing,
    utils::{CountingSource, MockTransport},
};
use alloy_primitives::{Address, B256, Bytes, U256, address, bytes, keccak256};
use forksim_fork::{
    AccountRecord, DatabaseError, FetchError, MemorySource, RpcSource, StateDb, StateSnapshot,
};
use revm::database_interface::DatabaseRef;
use similar_asserts::assert_eq;
use std::sync::Arc;

const ALICE: Address = address!("0x00000000000000000000000000000000000a11ce");
const TOKEN: Address = address!("0x0000000000000000000000000000000000007070");

fn token_code() -> Bytes {
    bytes!("0x60806040526004361060")
}

fn transport() -> MockTransport {
    MockTransport::new(1)
        .with_account(ALICE, 7, U256::from(1_000), Bytes::new())
        .with_account(TOKEN, 1, U256::ZERO, token_code())
        .with_storage(TOKEN, U256::from(0), B256::with_last_byte(0x11))
        .with_storage(TOKEN, U256::from(1), B256::with_last_byte(0x22))
        .with_block_hash(99, B256::with_last_byte(0x99))
}

fn rpc_db(transport: &MockTransport) -> StateDb {
    StateDb::with_source(Arc::new(RpcSource::new(transport.clone(), 100)))
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_reads_do_not_refetch() {
    init_tracing();
    let transport = transport();
    let db = rpc_db(&transport);

    for _ in 0..3 {
        let info = db.basic_ref(TOKEN).unwrap().unwrap();
        assert_eq!(info.nonce, 1);
        assert_eq!(db.storage_ref(TOKEN, U256::from(1)).unwrap(), U256::from(0x22));
        assert_eq!(db.block_hash_ref(99).unwrap(), B256::with_last_byte(0x99));
    }
    assert_eq!(transport.calls("eth_getCode"), 1);
    assert_eq!(transport.calls("eth_getStorageAt"), 1);
    assert_eq!(transport.calls("eth_getBlockByNumber"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_are_recorded_as_origin() {
    let transport = transport();
    let db = rpc_db(&transport);

    db.basic_ref(ALICE).unwrap();
    db.storage_ref(TOKEN, U256::from(0)).unwrap();
    db.block_hash_ref(99).unwrap();

    let mut token = AccountRecord::new(1, U256::ZERO, keccak256(token_code()));
    token.insert_slot(B256::ZERO, B256::with_last_byte(0x11));
    let mut expected = StateSnapshot::default();
    expected.accounts.insert(ALICE, AccountRecord::new(7, U256::from(1_000), revm::primitives::KECCAK_EMPTY));
    expected.accounts.insert(TOKEN, token);
    expected.contracts.insert(keccak256(token_code()), token_code());
    expected.header_hashes.insert(99, B256::with_last_byte(0x99));
    assert_eq!(db.origin(), expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn code_is_served_by_hash_and_address() {
    let transport = transport();
    let db = rpc_db(&transport);

    let info = db.basic_ref(TOKEN).unwrap().unwrap();
    assert_eq!(db.code_by_hash_ref(info.code_hash).unwrap().original_bytes(), token_code());
    assert_eq!(db.code(TOKEN).unwrap(), token_code());
    assert_eq!(db.code_size(TOKEN).unwrap(), token_code().len());
    assert_eq!(transport.batches(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_shadow_origin() {
    let transport = transport();
    let db = rpc_db(&transport);

    db.basic_ref(TOKEN).unwrap();
    db.set_storage(TOKEN, U256::from(1), U256::from(5));
    assert_eq!(db.storage_ref(TOKEN, U256::from(1)).unwrap(), U256::from(5));
    assert_eq!(transport.calls("eth_getStorageAt"), 0);
    assert!(db.origin().accounts[&TOKEN].storage.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn restored_overlay_is_served_from_origin() {
    let source = Arc::new(CountingSource::new({
        let mut snapshot = StateSnapshot::default();
        let mut account = AccountRecord::new(1, U256::from(10), revm::primitives::KECCAK_EMPTY);
        account.insert_slot(B256::ZERO, B256::with_last_byte(1));
        snapshot.accounts.insert(ALICE, account);
        snapshot
    }));
    let db = StateDb::with_source(Arc::clone(&source) as _);
    let empty = db.overlay();

    assert_eq!(db.storage_ref(ALICE, U256::ZERO).unwrap(), U256::from(1));
    let reads = source.reads();
    assert_eq!(reads, 2);

    db.restore(empty);
    assert_eq!(db.basic_ref(ALICE).unwrap().unwrap().balance, U256::from(10));
    assert_eq!(db.storage_ref(ALICE, U256::ZERO).unwrap(), U256::from(1));
    assert_eq!(source.reads(), reads);
}

#[tokio::test(flavor = "multi_thread")]
async fn prefetch_materializes_accounts() {
    let transport = transport();
    let db = rpc_db(&transport);

    db.prefetch([ALICE, TOKEN, ALICE]).await.unwrap();
    assert_eq!(transport.calls("eth_getBalance"), 2);

    db.set_storage(ALICE, U256::from(3), U256::from(3));
    assert_eq!(db.basic_ref(TOKEN).unwrap().unwrap().code_hash, keccak256(token_code()));
    assert_eq!(transport.batches(), 2);
    assert_eq!(db.origin().accounts.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_errors_surface() {
    let transport = transport().failing("eth_getStorageAt");
    let db = rpc_db(&transport);

    let err = db.storage_ref(TOKEN, U256::from(1)).unwrap_err();
    assert!(matches!(
        err,
        DatabaseError::Fetch(FetchError::Rpc { method: "eth_getStorageAt", .. })
    ));
    // The account itself was fetched fine.
    assert_eq!(db.basic_ref(TOKEN).unwrap().unwrap().nonce, 1);
    assert!(db.storage_ref(TOKEN, U256::from(1)).is_err());
    assert_eq!(transport.calls("eth_getStorageAt"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_source_falls_back_to_rpc() {
    let transport = transport();
    let mut loaded = StateSnapshot::default();
    loaded.accounts.insert(ALICE, AccountRecord::new(7, U256::from(1_000), revm::primitives::KECCAK_EMPTY));
    let source = MemorySource::new(loaded)
        .with_fallback(Arc::new(RpcSource::new(transport.clone(), 100)));
    let db = StateDb::with_source(Arc::new(source));

    assert_eq!(db.basic_ref(ALICE).unwrap().unwrap().nonce, 7);
    assert_eq!(transport.batches(), 0);
    assert_eq!(db.basic_ref(TOKEN).unwrap().unwrap().nonce, 1);
    assert_eq!(transport.batches(), 1);
    assert_eq!(db.identity().await.unwrap().map(|id| id.chain_id), Some(1));
}

#[test]
fn blocking_reads_outside_runtime() {
    let transport = transport();
    let db = rpc_db(&transport);

    assert_eq!(db.basic_ref(ALICE).unwrap().unwrap().nonce, 7);
    assert_eq!(db.storage_ref(TOKEN, U256::from(0)).unwrap(), U256::from(0x11));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reads_from_threads() {
    let transport = transport().with_delay(std::time::Duration::from_millis(20));
    let db = Arc::new(rpc_db(&transport));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = Arc::clone(&db);
            tokio::task::spawn_blocking(move || {
                db.storage_ref(TOKEN, U256::from(1)).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), U256::from(0x22));
    }
    assert_eq!(transport.calls("eth_getTransactionCount"), 1);
    assert_eq!(transport.calls("eth_getStorageAt"), 1);
}
