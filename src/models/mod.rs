pub mod update;
pub mod workload;

pub use update::*;
pub use workload::*;
