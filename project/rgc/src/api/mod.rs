pub mod backoff;
pub mod memstore;
pub mod store;

pub use backoff::RetryPolicy;
pub use memstore::{MemoryStore, StoreOp};
pub use store::{ObjectStore, StoreError};
