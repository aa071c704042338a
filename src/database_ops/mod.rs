pub mod checkpoint;
pub mod memory;
pub mod postgres;
pub mod resolver;
pub mod rows;
pub mod store;
pub mod writer;

pub use checkpoint::{CheckpointBackend, CheckpointStore};
pub use memory::MemoryStore;
pub use postgres::PgLeaderboardStore;
pub use resolver::{EntityCache, EntityResolver};
pub use rows::CheckpointState;
pub use store::LeaderboardStore;
pub use writer::{BatchWriter, ResolvedBatch, WriteStats};
