//! The mirror pipeline.
//!
//! ```text
//! change feed -> Follower -> Dispatch -> Stager -> staged/<path> + ingestion queue
//!                                 \-> staging queue -> stage worker -> Stager
//!
//! deny list -> Pruner -> prune queue -> delete worker
//! data/     -> CatalogBuilder (catalog.json), Inventory (all-versions.json)
//! ```
//!
//! Every component is a one-shot run over injected backends, queues and
//! policy snapshots; scheduling is somebody else's job.

pub mod catalog;
pub mod classify;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod follow;
pub mod inventory;
pub mod layout;
pub mod prune;
pub mod stage;
pub mod worker;

pub use crate::catalog::{Catalog, CatalogBuilder, CatalogEntry, CatalogReport};
pub use crate::classify::{Classification, Policy, Rejection};
pub use crate::cursor::Cursor;
pub use crate::dispatch::{Dispatch, QueueDispatch};
pub use crate::follow::{FollowReport, Follower, StopReason};
pub use crate::inventory::{Inventory, InventoryReport, VersionsIndex};
pub use crate::prune::{ChangeHook, PruneReport, PruneTask, Pruner, QueueHook};
pub use crate::stage::{Outcome, StageRequest, Stager};
pub use crate::worker::{Verdict, WorkerReport, drain};
