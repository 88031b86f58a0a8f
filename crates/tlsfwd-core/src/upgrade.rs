//! Transport upgrade hook.
//!
//! Invoked exactly once per accepted pairing, on the single leg selected by
//! the static [`UpgradeMode`]. Whatever comes back must honour the same
//! read / write / close contract as the raw socket it replaced.

use crate::error::FwdResult;
use crate::mode::UpgradeMode;
use crate::transport::BoxedIo;
use std::future::Future;
use std::pin::Pin;

/// Future returned by [`UpgradeHook::upgrade`].
pub type UpgradeFuture<'a> = Pin<Box<dyn Future<Output = FwdResult<BoxedIo>> + Send + 'a>>;

/// Capability that wraps a raw leg in a (possibly encrypted) transport.
///
/// Implementations report failure as [`FwdError::Upgrade`](crate::FwdError::Upgrade);
/// the caller then abandons the pairing and closes both legs.
pub trait UpgradeHook: Send + Sync {
    /// Upgrade `io`, which is the outbound leg for
    /// [`UpgradeMode::UpgradeOutbound`] and the inbound leg otherwise.
    fn upgrade(&self, io: BoxedIo, mode: UpgradeMode) -> UpgradeFuture<'_>;
}

/// Hook that hands the leg back untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl UpgradeHook for Passthrough {
    fn upgrade(&self, io: BoxedIo, _mode: UpgradeMode) -> UpgradeFuture<'_> {
        Box::pin(async move { Ok(io) })
    }
}
