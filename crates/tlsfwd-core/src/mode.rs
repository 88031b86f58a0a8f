//! Upgrade mode: which leg of a pairing receives the transport upgrade.

use crate::error::FwdError;
use std::fmt;
use std::str::FromStr;

/// Statically configured choice of the leg handed to the upgrade hook.
///
/// Exactly one leg per pairing is upgraded; there is no per-connection
/// negotiation and no dual-upgrade mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeMode {
    /// Upgrade the outbound (server-side) leg: the relay acts as TLS client
    /// towards the destination. CLI literal `start-tls`.
    UpgradeOutbound,
    /// Upgrade the inbound (client-side) leg: the relay acts as TLS server
    /// towards the connecting client. CLI literal `recv-tls`.
    UpgradeInbound,
}

impl UpgradeMode {
    /// The literal used on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeMode::UpgradeOutbound => "start-tls",
            UpgradeMode::UpgradeInbound => "recv-tls",
        }
    }

    /// Whether the outbound leg is the one to upgrade.
    pub fn upgrades_outbound(&self) -> bool {
        matches!(self, UpgradeMode::UpgradeOutbound)
    }
}

impl fmt::Display for UpgradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpgradeMode {
    type Err = FwdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start-tls" => Ok(UpgradeMode::UpgradeOutbound),
            "recv-tls" => Ok(UpgradeMode::UpgradeInbound),
            other => Err(FwdError::InvalidMode(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_literals() {
        assert_eq!("start-tls".parse::<UpgradeMode>().unwrap(), UpgradeMode::UpgradeOutbound);
        assert_eq!("recv-tls".parse::<UpgradeMode>().unwrap(), UpgradeMode::UpgradeInbound);
    }

    #[test]
    fn reject_unknown_mode() {
        let err = "both".parse::<UpgradeMode>().unwrap_err();
        assert!(matches!(err, FwdError::InvalidMode(ref m) if m == "both"));
        assert!("START-TLS".parse::<UpgradeMode>().is_err());
        assert!("".parse::<UpgradeMode>().is_err());
    }

    #[test]
    fn display_matches_cli_literal() {
        for mode in [UpgradeMode::UpgradeOutbound, UpgradeMode::UpgradeInbound] {
            assert_eq!(mode.to_string().parse::<UpgradeMode>().unwrap(), mode);
        }
        assert!(UpgradeMode::UpgradeOutbound.upgrades_outbound());
        assert!(!UpgradeMode::UpgradeInbound.upgrades_outbound());
    }
}
