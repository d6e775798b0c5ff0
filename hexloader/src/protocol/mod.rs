//! Protocol implementations.

pub mod session;
pub mod stk500;

// Re-export common types
pub use session::{FailureReason, Phase, ProgrammingSession, SessionConfig};
pub use stk500::{Command, DeviceParams, MemoryKind, Signature};
