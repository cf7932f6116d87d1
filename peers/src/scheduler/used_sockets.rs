use rustc_hash::FxHashMap;

use transport::peer_addr::PeerAddr;

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SocketUse {
    Connecting,
    Connected,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ClaimOutcome {
    /// The address is free; it is now claimed and the attempt may proceed.
    Claimed,
    /// Another attempt is currently connecting to this address; retry shortly.
    Deferred,
    /// A live connection to this address already exists; the attempt is pointless.
    Moot,
}

/// Guards against two simultaneous connection attempts targeting the same remote socket.
///
/// Entries must be inserted and removed together with the friend-state transition they gate,
///  under the same lock - a claimed address with no matching in-flight attempt leaks the
///  address until a sweep.
#[derive(Default)]
pub struct UsedSocketTable {
    entries: FxHashMap<PeerAddr, SocketUse>,
}

impl UsedSocketTable {
    pub fn try_claim(&mut self, addr: PeerAddr) -> ClaimOutcome {
        match self.entries.get(&addr) {
            None => {
                self.entries.insert(addr, SocketUse::Connecting);
                ClaimOutcome::Claimed
            }
            Some(SocketUse::Connecting) => ClaimOutcome::Deferred,
            Some(SocketUse::Connected) => ClaimOutcome::Moot,
        }
    }

    pub fn mark_connected(&mut self, addr: PeerAddr) {
        self.entries.insert(addr, SocketUse::Connected);
    }

    pub fn release(&mut self, addr: PeerAddr) {
        self.entries.remove(&addr);
    }

    pub fn usage(&self, addr: PeerAddr) -> Option<SocketUse> {
        self.entries.get(&addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_claim() {
        let mut table = UsedSocketTable::default();
        let addr: PeerAddr = "203.0.113.5:1680".parse().unwrap();

        assert_eq!(table.try_claim(addr), ClaimOutcome::Claimed);
        assert_eq!(table.try_claim(addr), ClaimOutcome::Deferred);
        assert_eq!(table.usage(addr), Some(SocketUse::Connecting));

        table.mark_connected(addr);
        assert_eq!(table.try_claim(addr), ClaimOutcome::Moot);

        table.release(addr);
        assert_eq!(table.try_claim(addr), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_claims_are_per_address() {
        let mut table = UsedSocketTable::default();
        assert_eq!(table.try_claim("203.0.113.5:1680".parse().unwrap()), ClaimOutcome::Claimed);
        assert_eq!(table.try_claim("203.0.113.5:1681".parse().unwrap()), ClaimOutcome::Claimed);
        assert_eq!(table.try_claim("203.0.113.6:1680".parse().unwrap()), ClaimOutcome::Claimed);
    }
}
