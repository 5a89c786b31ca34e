//! # forksim-vm
//!
//! Execution sessions over forked chain state.
//!
//! A [`Vm`] applies [`Message`]s to a [`StateDb`](forksim_fork::StateDb) through an
//! [`Executor`], usually the revm-backed [`RevmExecutor`], and can snapshot and roll back its
//! state without fetching anything twice.
//! [`VmBuilder`] wires a session up from a [`ForkConfig`](forksim_config::ForkConfig).

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

#[macro_use]
extern crate tracing;

mod builder;
pub use builder::VmBuilder;

mod error;
pub use error::VmError;

mod evm;
pub use evm::RevmExecutor;

mod executor;
pub use executor::Executor;

pub mod message;
pub use message::{BlockContext, ExecutionOutcome, ExecutionStatus, Message, Receipt};

mod vm;
pub use vm::{Vm, VmSnapshot};
