//! The batched JSON-RPC seam the remote source is built on.

use crate::error::{FetchError, FetchResult};
use alloy_rpc_client::RpcClient;
use alloy_transport::TransportError;
use serde_json::Value;
use std::sync::Arc;

/// A single element of a batched call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcCall {
    pub method: &'static str,
    pub params: Value,
}

impl RpcCall {
    pub fn new(method: &'static str, params: Value) -> Self {
        Self { method, params }
    }
}

/// Sends several calls in one round-trip.
///
/// The outer result fails if the batch as a whole could not be delivered, the inner results
/// are positional and answer the calls in order. Decoding into concrete types is left to the
/// caller.
#[async_trait::async_trait]
pub trait BatchTransport: Send + Sync + 'static {
    async fn batch(&self, calls: Vec<RpcCall>) -> FetchResult<Vec<FetchResult<Value>>>;
}

#[async_trait::async_trait]
impl<T: BatchTransport + ?Sized> BatchTransport for Arc<T> {
    async fn batch(&self, calls: Vec<RpcCall>) -> FetchResult<Vec<FetchResult<Value>>> {
        (**self).batch(calls).await
    }
}

#[async_trait::async_trait]
impl BatchTransport for RpcClient {
    async fn batch(&self, calls: Vec<RpcCall>) -> FetchResult<Vec<FetchResult<Value>>> {
        let Some(first) = calls.first() else { return Ok(Vec::new()) };
        let batch_method = first.method;

        let mut batch = self.new_batch();
        let mut waiters = Vec::with_capacity(calls.len());
        for call in calls {
            let waiter = batch
                .add_call::<_, Value>(call.method, &call.params)
                .map_err(|err| transport_err(call.method, err))?;
            waiters.push((call.method, waiter));
        }

        trace!(target: "fork::rpc", len = waiters.len(), "sending batch");
        batch.send().await.map_err(|err| transport_err(batch_method, err))?;

        let mut results = Vec::with_capacity(waiters.len());
        for (method, waiter) in waiters {
            results.push(waiter.await.map_err(|err| transport_err(method, err)));
        }
        Ok(results)
    }
}

fn transport_err(method: &'static str, err: TransportError) -> FetchError {
    FetchError::rpc(method, err)
}
