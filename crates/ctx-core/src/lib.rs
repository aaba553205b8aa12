pub mod master_context;
pub mod memory_contracts;
pub mod ports;

pub use master_context::{ContextEntry, ContextSection, MasterContext};
pub use memory_contracts::*;
pub use ports::*;
