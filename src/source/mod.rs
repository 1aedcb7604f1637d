pub mod assembler;
pub mod identity;
pub mod scanner;
pub mod tailer;

pub use identity::{FileIdentity, IdentitySet};
pub use scanner::{ScanError, ScanReport, Scanner, TailerRegistry};
pub use tailer::{Tailer, TailerError};
