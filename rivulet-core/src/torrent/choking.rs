//! Upload slot decisions.

use std::net::SocketAddr;

/// What to tell a peer after its interest changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeDecision {
    Unchoke,
    Choke,
    Unchanged,
}

/// Decides whether interested peers may download from us.
pub trait ChokePolicy: Send + Sync {
    /// Peer sent `interested`.
    fn on_interested(&self, peer: SocketAddr) -> ChokeDecision;

    /// Peer sent `not interested`.
    fn on_not_interested(&self, peer: SocketAddr) -> ChokeDecision;
}

/// Unchokes every interested peer and never chokes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysUnchoke;

impl ChokePolicy for AlwaysUnchoke {
    fn on_interested(&self, _peer: SocketAddr) -> ChokeDecision {
        ChokeDecision::Unchoke
    }

    fn on_not_interested(&self, _peer: SocketAddr) -> ChokeDecision {
        ChokeDecision::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_always_unchoke() {
        let peer = SocketAddr::from(([10, 0, 0, 1], 6881));
        assert_eq!(AlwaysUnchoke.on_interested(peer), ChokeDecision::Unchoke);
        assert_eq!(AlwaysUnchoke.on_not_interested(peer), ChokeDecision::Unchanged);
    }
}
