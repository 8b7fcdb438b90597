pub mod file_lifecycle;
pub mod metrics;
pub mod orphan_sweeper;
pub mod quota_manager;

pub use file_lifecycle::*;
pub use metrics::*;
pub use orphan_sweeper::*;
pub use quota_manager::*;
