//! Multi-stage transactional bulk import.
//!
//! A request carries records for any subset of the registered domains.
//! [`ImportCoordinator::import`] checks the request, validates each domain,
//! groups the resulting rows into transactional units by dependency order
//! and commits them stage-group by stage-group. Blocks commit first, then
//! addresses, tokens and transactions, then everything referencing
//! transactions.
//!
//! If a later group fails after an earlier one committed, the blocks of the
//! call are flagged `refetch_needed` so they are imported again.

pub mod coordinator;
pub mod domain;
pub mod error;
pub mod executor;
pub mod options;
pub mod request;
pub mod result;
pub mod runner;
pub mod side_effects;
pub mod stage;
pub mod unit;
pub mod validators;

pub use coordinator::ImportCoordinator;
pub use domain::{DomainKey, RunnerDescriptor};
pub use error::{ImportError, StoreError, UnitFailure};
pub use executor::TransactionExecutor;
pub use request::{ConflictPolicy, DomainOptions, ImportRequest, MergeStrategy, RawRecord};
pub use result::ImportResult;
pub use side_effects::{
    BroadcastSink, ChannelBroadcaster, LogNotifier, NotificationSink, SideEffects, SinkError,
};
pub use stage::{RegistryError, StageGraph};
pub use unit::{ImportPlan, Operation, PlanSummary, Timestamps, TransactionalUnit};
pub use validators::{Validator, ValidatorRegistry};
