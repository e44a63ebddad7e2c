// Sekejap Indexing - online index population and lifecycle engine
// plus the Multi-Paxos core used for cluster coordination

pub mod error;
pub mod types;
pub mod store;
pub mod index;
pub mod proxy;
pub mod populate;
pub mod map;
pub mod reservation;
pub mod service;
pub mod paxos;

// Re-export main types
pub use error::{IndexError, IndexPopulationFailure, Result};
pub use types::{
    EntityId, EntityType, EntityUpdates, IndexDescriptor, IndexEntryUpdate, IndexId, IndexState, IndexUpdateMode,
    PopulationProgress, PropertyKeyId, SchemaDescriptor, TokenId,
};
pub use store::{IndexStoreView, MemoryStoreView};
pub use index::{IndexProvider, MemoryIndexProvider};
pub use proxy::{ContractCheckingIndexProxy, FlippableIndexProxy, IndexProxy};
pub use populate::{IndexPopulationJob, MultipleIndexPopulator, PopulationConfig};
pub use map::{IndexMap, IndexUpdaterMap};
pub use service::IndexingService;
pub use paxos::{PaxosConfig, PaxosNode};
