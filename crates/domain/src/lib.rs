//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod leader;
mod lease;
mod record;
mod work_item;

pub use leader::{LeaderRecord, LeaderRecordInput, LeaderRole};
pub use lease::{LeaseMetadata, LeaseRecord, LeaseRecordInput};
pub use record::{StoredRecord, deadline_after, next_version};
pub use work_item::{FailureKind, TaskFailure, WorkItem, WorkItemInput, WorkItemStatus};
