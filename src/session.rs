//! Session bookkeeping: pending operations and subscription routing

pub mod subscription;
pub mod tracker;

pub use subscription::{PublishCallback, SubscriptionRouter};
pub use tracker::{OperationKind, OperationTracker, PendingSummary};
