use crate::{BlockContext, ExecutionOutcome, Message};
use forksim_fork::StateDb;

/// An execution engine.
///
/// Executes `msg` against `db`, writing every state change into the database's overlay.
/// [`RevmExecutor`](crate::RevmExecutor) runs a revm transaction and commits its state through
/// [`DatabaseCommit`](revm::database_interface::DatabaseCommit).
pub trait Executor {
    type Error: std::error::Error + Send + Sync + 'static;

    fn execute(
        &mut self,
        db: &mut StateDb,
        block: &BlockContext,
        msg: &Message,
    ) -> Result<ExecutionOutcome, Self::Error>;
}

impl<E: Executor + ?Sized> Executor for &mut E {
    type Error = E::Error;

    fn execute(
        &mut self,
        db: &mut StateDb,
        block: &BlockContext,
        msg: &Message,
    ) -> Result<ExecutionOutcome, Self::Error> {
        (**self).execute(db, block, msg)
    }
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    type Error = E::Error;

    fn execute(
        &mut self,
        db: &mut StateDb,
        block: &BlockContext,
        msg: &Message,
    ) -> Result<ExecutionOutcome, Self::Error> {
        (**self).execute(db, block, msg)
    }
}
