pub mod batch;
pub mod client;
pub mod error;
pub mod pubsub;
pub mod retry;

pub use batch::{Batch, BatchOp, Precondition};
pub use client::StoreClient;
pub use error::StoreError;
pub use pubsub::{subscribe, Subscription};
pub use retry::RetryPolicy;
