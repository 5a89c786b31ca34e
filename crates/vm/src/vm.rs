//! The execution session.

use crate::{BlockContext, Executor, Message, Receipt, VmError};
use alloy_primitives::{Address, B256, Bytes, U256};
use forksim_fork::{Overlay, SnapshotStore, StateDb};
use revm::database_interface::DatabaseRef;

/// A copy of a session's state, see [`Vm::snapshot`].
#[derive(Clone, Debug, PartialEq)]
pub struct VmSnapshot {
    overlay: Overlay,
}

/// Executes messages against a [`StateDb`].
#[derive(Debug)]
pub struct Vm<E> {
    db: StateDb,
    executor: E,
    block: BlockContext,
    store: Option<SnapshotStore>,
}

impl<E: Executor> Vm<E> {
    pub fn new(db: StateDb, executor: E, block: BlockContext) -> Self {
        Self { db, executor, block, store: None }
    }

    /// Sets the store [`Vm::persist_to_store`] writes to.
    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn db(&self) -> &StateDb {
        &self.db
    }

    pub fn block(&self) -> &BlockContext {
        &self.block
    }

    pub fn set_block(&mut self, block: BlockContext) {
        self.block = block;
    }

    pub fn store(&self) -> Option<&SnapshotStore> {
        self.store.as_ref()
    }

    pub fn into_parts(self) -> (StateDb, E) {
        (self.db, self.executor)
    }

    /// Executes `msg` and keeps its state changes.
    ///
    /// If the executor fails, the state is left as it was.
    pub fn apply(&mut self, msg: &Message) -> Result<Receipt, VmError> {
        let mut msg = msg.clone();
        if msg.nonce.is_none() {
            msg.nonce = Some(self.nonce(msg.from)?);
        }
        self.execute(msg)
    }

    /// Executes `msg` and discards its state changes.
    pub fn call(&mut self, msg: &Message) -> Result<Receipt, VmError> {
        let snapshot = self.snapshot();
        let res = self.execute(msg.clone());
        self.rollback(&snapshot);
        res
    }

    fn execute(&mut self, mut msg: Message) -> Result<Receipt, VmError> {
        if msg.gas_limit == 0 || msg.gas_limit > self.block.gas_limit {
            msg.gas_limit = self.block.gas_limit;
        }

        let before = self.snapshot();
        let outcome = match self.executor.execute(&mut self.db, &self.block, &msg) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.rollback(&before);
                warn!(target: "vm", from = %msg.from, to = ?msg.to, %err, "execution failed");
                return Err(VmError::execution(err));
            }
        };

        let receipt = Receipt::new(&msg, outcome);
        debug!(
            target: "vm",
            from = %msg.from,
            to = ?msg.to,
            status = ?receipt.status,
            gas_used = receipt.gas_used,
            "executed message"
        );
        Ok(receipt)
    }

    /// Takes a snapshot of the current state.
    ///
    /// Any number of snapshots can be held, and each can be rolled back to repeatedly.
    pub fn snapshot(&self) -> VmSnapshot {
        VmSnapshot { overlay: self.db.overlay() }
    }

    /// Restores the state of `snapshot`.
    ///
    /// State read since the snapshot was taken is not fetched again.
    pub fn rollback(&mut self, snapshot: &VmSnapshot) {
        trace!(target: "vm", accounts = snapshot.overlay.accounts.len(), "rolling back");
        self.db.restore(snapshot.overlay.clone());
    }

    pub fn balance(&self, address: Address) -> Result<U256, VmError> {
        Ok(self.db.basic_ref(address)?.map(|info| info.balance).unwrap_or_default())
    }

    pub fn nonce(&self, address: Address) -> Result<u64, VmError> {
        Ok(self.db.basic_ref(address)?.map(|info| info.nonce).unwrap_or_default())
    }

    pub fn code(&self, address: Address) -> Result<Bytes, VmError> {
        Ok(self.db.code(address)?)
    }

    pub fn storage_at(&self, address: Address, slot: B256) -> Result<B256, VmError> {
        let value = self.db.storage_ref(address, U256::from_be_bytes(slot.0))?;
        Ok(B256::from(value))
    }

    pub fn set_balance(&mut self, address: Address, balance: U256) -> Result<(), VmError> {
        let mut info = self.db.basic_ref(address)?.unwrap_or_default();
        info.balance = balance;
        self.db.set_account_info(address, info);
        Ok(())
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) -> Result<(), VmError> {
        let mut info = self.db.basic_ref(address)?.unwrap_or_default();
        info.nonce = nonce;
        self.db.set_account_info(address, info);
        Ok(())
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) -> Result<(), VmError> {
        self.db.basic_ref(address)?;
        self.db.set_code(address, code);
        Ok(())
    }

    pub fn set_storage_at(&mut self, address: Address, slot: B256, value: B256) -> Result<(), VmError> {
        self.db.basic_ref(address)?;
        self.db.set_storage(address, U256::from_be_bytes(slot.0), U256::from_be_bytes(value.0));
        Ok(())
    }

    /// Merges everything read from the source into `store`, under the source's identity.
    ///
    /// Returns whether the file was written. Nothing is written without a source or when the
    /// source has no identity.
    pub fn persist(&self, store: &SnapshotStore) -> Result<bool, VmError> {
        let Some(id) = self.db.identity_blocking()? else {
            debug!(target: "vm", "source has no identity, not persisting");
            return Ok(false);
        };
        let origin = self.db.origin();
        let written = store.persist(id, &origin)?;
        debug!(target: "vm", %id, accounts = origin.accounts.len(), written, "persisted origin reads");
        Ok(written)
    }

    /// Like [`Vm::persist`] with the store set by [`Vm::with_store`], if any.
    pub fn persist_to_store(&self) -> Result<bool, VmError> {
        match &self.store {
            Some(store) => self.persist(store),
            None => Ok(false),
        }
    }
}
