//! Connection state machine.
//!
//! - [`state`]: session states and the status snapshot callers see
//! - [`reducer`]: the pure transition function
//! - [`driver`]: one task per agent applying transitions and their effects
//! - [`manager`]: the control surface (`start`, `stop`, `get_status`, ...)

mod driver;
mod locks;
mod manager;
mod reducer;
mod registry;
mod state;

pub use driver::{CleanupReport, LifecycleNotification};
pub use locks::{CooldownBook, InitLocks};
pub use manager::{SessionManager, reset_agent};
pub use reducer::{Effect, ReduceContext, SessionEvent, reduce};
pub use registry::{SessionHandle, SessionRegistry};
pub use state::{AttemptCounters, PairingCode, Session, SessionState, SessionStatus};
