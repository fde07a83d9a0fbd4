mod manager;
mod normalize;

pub use manager::{AllocationOutcome, ResourceManager, SystemTotals};
pub use normalize::{parse_cpu, parse_memory, ResourceParseError};
