//! PostgreSQL adapter for state_mirror_core.
//!
//! [`PgMirrorStore`] implements `MirrorBackend` and `SchemaBackend` on a
//! borrowed `PgConnection`, so a [`MirrorCoordinator`] over it plugs into a
//! primary store that runs its transactions on the same connection.
//!
//! ```ignore
//! let store = Arc::new(PgMirrorStore::from_config(&config));
//! let mirror = MirrorCoordinator::new(store, config)?;
//! let mut tx = pool.begin().await?;
//! let mut session = mirror.on_session_open(&mut *tx).await?;
//! ```
//!
//! [`MirrorCoordinator`]: state_mirror_core::MirrorCoordinator

pub mod sql;
pub mod store;

pub use store::PgMirrorStore;

/// Coordinator wired to the Postgres adapter.
pub type PgMirrorCoordinator = state_mirror_core::MirrorCoordinator<PgMirrorStore>;
