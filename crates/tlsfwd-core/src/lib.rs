//! tlsfwd-core: Shared library for the TLS forwarding relay.
//!
//! Provides the error type, the upgrade mode, the transport-agnostic session
//! I/O capability, the upgrade hook trait, and the pairing registry that
//! records which session socket forwards to which.

pub mod error;
pub mod mode;
pub mod registry;
pub mod transport;
pub mod upgrade;

// Re-export commonly used items at crate root.
pub use error::{FwdError, FwdResult};
pub use mode::UpgradeMode;
pub use registry::{PairingRegistry, SocketId};
pub use transport::{split_session, BoxedIo, SessionIo, SessionReader, SessionWriter};
pub use upgrade::{Passthrough, UpgradeFuture, UpgradeHook};
