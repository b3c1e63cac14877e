// Core infrastructure modules — the sync daemon's six components plus the
// shared model, storage seams, and wire/snapshot formats they sit on.
pub mod change_tracker; // C2: local change-data-capture
pub mod clock; // Vector clock / Lamport clock identity
pub mod discovery; // C4: peer discovery and liveness
pub mod model; // Shared data model
pub mod monitoring; // Health/status surface and metrics collector
pub mod partition; // C6: partition detection and recovery
pub mod security; // C3: authentication, sessions, encryption
pub mod snapshot; // Bulk snapshot file format
pub mod store; // Relational store and trait impls
pub mod sync_engine; // C5: peer sync engine
pub mod traits; // Storage seam traits
pub mod wire; // TCP wire framing

pub use change_tracker::ChangeTracker;
pub use clock::ClockIdentity;
pub use discovery::{PeerDiscovery, ReachabilityChange};
pub use monitoring::MetricsCollector;
pub use partition::{PartitionDetector, RecoveryMetrics};
pub use security::SecurityManager;
pub use store::SyncStore;
pub use sync_engine::SyncEngine;
pub use traits::{ChangeStore, DiscoveryStore, MetricsInterface, RecoveryStore, SecurityStore};
