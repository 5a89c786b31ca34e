use crate::utils::MockTransport;
use alloy_primitives::{Address, B256, Bytes, U256, address, b256, bytes, keccak256};
use forksim_fork::{AccountRecord, FetchError, RpcSource, SourceId, StateSource};
use revm::primitives::KECCAK_EMPTY;
use similar_asserts::assert_eq;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

const ACCOUNT: Address = address!("0x000000000000000000000000000000000000aaaa");
const CONTRACT: Address = address!("0x000000000000000000000000000000000000c0de");

fn code() -> Bytes {
    bytes!("0x6080604052348015600f57600080fd5b50")
}

fn ten_ether() -> U256 {
    U256::from(10_000_000_000_000_000_000u128)
}

fn transport() -> MockTransport {
    MockTransport::new(1)
        .with_account(ACCOUNT, 3, ten_ether(), Bytes::new())
        .with_account(CONTRACT, 1, U256::ZERO, code())
        .with_storage(CONTRACT, U256::from(1), B256::with_last_byte(0xaa))
        .with_block_hash(
            100,
            b256!("0x2222222222222222222222222222222222222222222222222222222222222222"),
        )
}

#[tokio::test(flavor = "multi_thread")]
async fn account_is_fetched_in_one_batch() {
    let transport = transport();
    let source = RpcSource::new(transport.clone(), 100);

    let account = source.account(ACCOUNT).await.unwrap();
    assert_eq!(
        account,
        AccountRecord { nonce: 3, balance: ten_ether(), code_hash: KECCAK_EMPTY, storage: None }
    );
    assert_eq!(transport.batches(), 1);
    assert_eq!(transport.calls("eth_getTransactionCount"), 1);
    assert_eq!(transport.calls("eth_getBalance"), 1);
    assert_eq!(transport.calls("eth_getCode"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_reads_share_one_call() {
    let transport = transport().with_delay(Duration::from_millis(50));
    let source = RpcSource::new(transport.clone(), 100);

    let reads = (0..32).map(|_| {
        let source = source.clone();
        tokio::spawn(async move { source.account(ACCOUNT).await })
    });
    let results = futures::future::join_all(reads).await;

    assert_eq!(transport.batches(), 1);
    for res in results {
        assert_eq!(res.unwrap().unwrap().nonce, 3);
    }

    let slots = (0..8).map(|_| source.storage(CONTRACT, B256::with_last_byte(1)));
    let values = futures::future::join_all(slots).await;
    assert!(values.iter().all(|value| *value == Ok(B256::with_last_byte(0xaa))));
    assert_eq!(transport.calls("eth_getStorageAt"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn resolved_keys_are_not_fetched_again() {
    let transport = transport();
    let source = RpcSource::new(transport.clone(), 100);

    for _ in 0..3 {
        source.account(ACCOUNT).await.unwrap();
        source.storage(CONTRACT, B256::with_last_byte(1)).await.unwrap();
        source.header_hash(100).await.unwrap();
    }
    assert_eq!(transport.batches(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_account_fetch_is_memoized() {
    let transport = transport().failing("eth_getBalance");
    let source = RpcSource::new(transport.clone(), 100);

    let first = source.account(ACCOUNT).await.unwrap_err();
    assert!(matches!(first, FetchError::Rpc { method: "eth_getBalance", .. }), "{first}");
    let second = source.account(ACCOUNT).await.unwrap_err();
    assert_eq!(first, second);
    assert_eq!(transport.batches(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn code_is_seeded_by_account_fetch() {
    let transport = transport();
    let source = RpcSource::new(transport.clone(), 100);

    let account = source.account(CONTRACT).await.unwrap();
    assert_eq!(account.code_hash, keccak256(code()));
    assert_eq!(source.code(account.code_hash).await.unwrap(), code());
    assert_eq!(transport.batches(), 1);
}

#[tokio::test(flavor = "multi_thread")]
#[should_panic(expected = "requested before any account referencing it")]
async fn code_of_unknown_hash_panics() {
    let source = RpcSource::new(transport(), 100);
    let _ = source.code(keccak256(code())).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn header_hashes() {
    let transport = transport();
    let source = RpcSource::new(transport.clone(), 100);

    assert_eq!(source.header_hash(100).await.unwrap()[0], 0x22);
    assert_eq!(source.header_hash(101).await.unwrap(), B256::ZERO);
    assert_eq!(transport.calls("eth_getBlockByNumber"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_fetch_fails_and_is_memoized() {
    let transport = transport().hanging();
    let token = CancellationToken::new();
    let source = RpcSource::new(transport.clone(), 100).with_cancellation(token.clone());

    let pending = {
        let source = source.clone();
        tokio::spawn(async move { source.account(ACCOUNT).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();

    assert_eq!(pending.await.unwrap(), Err(FetchError::Cancelled));
    assert_eq!(source.account(ACCOUNT).await, Err(FetchError::Cancelled));
    assert_eq!(source.storage(ACCOUNT, B256::ZERO).await, Err(FetchError::Cancelled));
    assert_eq!(transport.calls("eth_getTransactionCount"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_waiters_do_not_strand_fetch() {
    let transport = transport().with_delay(Duration::from_millis(50));
    let source = RpcSource::new(transport.clone(), 100);

    let waiter = {
        let source = source.clone();
        tokio::spawn(async move { source.account(ACCOUNT).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    waiter.abort();

    assert_eq!(source.account(ACCOUNT).await.unwrap().nonce, 3);
    assert_eq!(transport.batches(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn identity_resolves_chain_id_once() {
    let transport = transport();
    let source = RpcSource::new(transport.clone(), 100);

    assert_eq!(source.identity().await.unwrap(), Some(SourceId::new(1, 100)));
    assert_eq!(source.identity().await.unwrap(), Some(SourceId::new(1, 100)));
    assert_eq!(transport.calls("eth_chainId"), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn latest_block_number() {
    let transport = transport().with_latest(0x1234);
    assert_eq!(RpcSource::latest_block_number(&transport).await.unwrap(), 0x1234);

    let shared: Arc<MockTransport> = Arc::new(transport);
    let source = RpcSource::from_arc(shared, 7);
    assert_eq!(source.block_number(), 7);
}
