//! State mirror core: keeps a queryable JSON mirror of a transactional
//! object store consistent with the store's committed versions.
//!
//! Write path: payload → [`Projector`] → staged row → merge at commit.
//! Restore path: payload → [`Projector`] → durable mirror row.
//! Delete path: primary version delete → trigger ([`trigger::decide`]).
//!
//! Storage goes through the port traits in [`ports`]; this crate has no
//! database driver. `state_mirror_postgres` implements the ports for
//! PostgreSQL and [`memory`] implements them in process.

pub mod batch;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod ports;
pub mod schema;
pub mod transform;
pub mod trigger;
pub mod types;

pub use batch::{BatchLimits, RowBatcher};
pub use config::{MergeLockMode, MirrorConfig, PrimaryLayout};
pub use coordinator::{MirrorCoordinator, MirrorSession};
pub use error::MirrorError;
pub use ports::{Backend, MergePlan, MirrorBackend, Result, SchemaBackend, StoreExtension};
pub use schema::{SchemaManager, SchemaReport};
pub use transform::{JsonStateTransformer, ProjectionHook, Projector, StateTransformer};
pub use types::{
    AuxRefresh, HistoryMode, MergeReport, MirrorRelation, MirrorRow, Projection, SqlIdent,
    MIRROR_COLUMNS,
};
