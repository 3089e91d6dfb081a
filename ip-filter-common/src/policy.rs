use core::net::Ipv4Addr;

use crate::frame::FrameView;
use crate::parse::{ParseError, parse_ethernet, parse_ipv4_source};
use crate::POLICY_DENY;

/// Prefix length of every key built by the datapath.
pub const HOST_PREFIX_LEN: u32 = 32;

/// Query key for the policy LPM trie.
///
/// Same layout as the kernel's `bpf_lpm_trie_key` followed by four data
/// bytes: prefix length in host order, address in network order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PolicyKey {
    pub prefix_len: u32,
    pub addr: [u8; 4],
}

impl PolicyKey {
    pub fn address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.addr)
    }
}

#[inline(always)]
pub fn build_key(address: Ipv4Addr) -> PolicyKey {
    PolicyKey {
        prefix_len: HOST_PREFIX_LEN,
        addr: address.octets(),
    }
}

/// Read side of the policy table.
///
/// `lookup` returns the policy byte of the longest stored prefix covering
/// `key.addr`, or `None`. An empty table answers `None`.
pub trait PolicyLookup {
    fn lookup(&self, key: &PolicyKey) -> Option<u8>;
}

impl<T: PolicyLookup + ?Sized> PolicyLookup for &T {
    #[inline(always)]
    fn lookup(&self, key: &PolicyKey) -> Option<u8> {
        (**self).lookup(key)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Decision {
    Pass,
    Drop,
}

#[inline(always)]
pub fn decide(policy: Option<u8>) -> Decision {
    match policy {
        Some(POLICY_DENY) => Decision::Drop,
        Some(_) | None => Decision::Pass,
    }
}

/// Why a frame got its verdict.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Incomplete,
    UnsupportedProtocol(u16),
    NoPolicyMatch(Ipv4Addr),
    Matched { source: Ipv4Addr, policy: u8 },
}

impl Outcome {
    pub fn decision(&self) -> Decision {
        match *self {
            Outcome::Incomplete | Outcome::UnsupportedProtocol(_) => Decision::Pass,
            Outcome::NoPolicyMatch(_) => decide(None),
            Outcome::Matched { policy, .. } => decide(Some(policy)),
        }
    }
}

impl From<ParseError> for Outcome {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Incomplete => Outcome::Incomplete,
            ParseError::UnsupportedProtocol(ether_type) => Outcome::UnsupportedProtocol(ether_type),
        }
    }
}

/// Run one frame through the parser and a single table query.
///
/// Every path is a fixed sequence of guard clauses; nothing loops over the
/// frame and nothing is written.
#[inline(always)]
pub fn inspect<F: FrameView, T: PolicyLookup>(frame: &F, table: &T) -> Outcome {
    let eth = match parse_ethernet(frame) {
        Ok(eth) => eth,
        Err(err) => return err.into(),
    };
    if !eth.is_ipv4() {
        return ParseError::UnsupportedProtocol(eth.ether_type).into();
    }
    let source = match parse_ipv4_source(frame) {
        Ok(source) => source,
        Err(err) => return err.into(),
    };

    match table.lookup(&build_key(source)) {
        Some(policy) => Outcome::Matched { source, policy },
        None => Outcome::NoPolicyMatch(source),
    }
}

#[inline(always)]
pub fn classify<F: FrameView, T: PolicyLookup>(frame: &F, table: &T) -> Decision {
    inspect(frame, table).decision()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SliceFrame;
    use crate::parse::{ETH_HDR_LEN, ETH_P_IPV4, IPV4_MIN_HEADER_LEN};
    use proptest::prelude::*;

    /// Linear-scan table; enough to pin down the LPM contract in tests.
    struct ScanTable<'a> {
        entries: &'a [(Ipv4Addr, u32, u8)],
    }

    impl PolicyLookup for ScanTable<'_> {
        fn lookup(&self, key: &PolicyKey) -> Option<u8> {
            let addr = u32::from(key.address());
            self.entries
                .iter()
                .filter(|(net, len, _)| {
                    let mask = if *len == 0 { 0 } else { u32::MAX << (32 - len) };
                    addr & mask == u32::from(*net) & mask && *len <= key.prefix_len
                })
                .max_by_key(|(_, len, _)| *len)
                .map(|(_, _, policy)| *policy)
        }
    }

    const EMPTY: ScanTable<'static> = ScanTable { entries: &[] };

    fn frame_from(src: Ipv4Addr) -> Vec<u8> {
        let mut buf = vec![0u8; ETH_HDR_LEN + IPV4_MIN_HEADER_LEN];
        buf[12..14].copy_from_slice(&ETH_P_IPV4.to_be_bytes());
        buf[14] = 0x45;
        buf[26..30].copy_from_slice(&src.octets());
        buf
    }

    fn verdict(buf: &[u8], table: &ScanTable<'_>) -> Decision {
        classify(&SliceFrame::new(buf), table)
    }

    #[test]
    fn decide_maps_policy_bytes() {
        assert_eq!(decide(None), Decision::Pass);
        assert_eq!(decide(Some(0)), Decision::Drop);
        assert_eq!(decide(Some(1)), Decision::Pass);
        assert_eq!(decide(Some(0xff)), Decision::Pass);
    }

    #[test]
    fn build_key_is_host_granular() {
        let key = build_key(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(key.prefix_len, 32);
        assert_eq!(key.addr, [10, 1, 2, 3]);
    }

    #[test]
    fn policy_key_matches_kernel_layout() {
        assert_eq!(core::mem::size_of::<PolicyKey>(), 8);
        assert_eq!(core::mem::align_of::<PolicyKey>(), 4);
    }

    #[test]
    fn covering_deny_prefix_drops() {
        let table = ScanTable {
            entries: &[(Ipv4Addr::new(10, 0, 0, 0), 8, 0)],
        };
        let buf = frame_from(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(verdict(&buf, &table), Decision::Drop);
    }

    #[test]
    fn longest_prefix_wins() {
        let table = ScanTable {
            entries: &[
                (Ipv4Addr::new(10, 0, 0, 0), 8, 0),
                (Ipv4Addr::new(10, 1, 0, 0), 16, 1),
            ],
        };
        let buf = frame_from(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(verdict(&buf, &table), Decision::Pass);
        let buf = frame_from(Ipv4Addr::new(10, 2, 2, 3));
        assert_eq!(verdict(&buf, &table), Decision::Drop);
    }

    #[test]
    fn uncovered_address_passes() {
        let table = ScanTable {
            entries: &[(Ipv4Addr::new(10, 0, 0, 0), 8, 0)],
        };
        let buf = frame_from(Ipv4Addr::new(192, 0, 2, 1));
        let outcome = inspect(&SliceFrame::new(&buf), &table);
        assert_eq!(outcome, Outcome::NoPolicyMatch(Ipv4Addr::new(192, 0, 2, 1)));
        assert_eq!(outcome.decision(), Decision::Pass);
    }

    #[test]
    fn empty_table_passes_everything() {
        let buf = frame_from(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(verdict(&buf, &EMPTY), Decision::Pass);
    }

    #[test]
    fn outcome_reports_reason() {
        let table = ScanTable {
            entries: &[(Ipv4Addr::new(203, 0, 113, 0), 24, 0)],
        };
        assert_eq!(
            inspect(&SliceFrame::new(&[0u8; 10]), &table),
            Outcome::Incomplete
        );

        let mut arp = frame_from(Ipv4Addr::new(203, 0, 113, 7));
        arp[12..14].copy_from_slice(&0x0806u16.to_be_bytes());
        assert_eq!(
            inspect(&SliceFrame::new(&arp), &table),
            Outcome::UnsupportedProtocol(0x0806)
        );

        let buf = frame_from(Ipv4Addr::new(203, 0, 113, 7));
        let outcome = inspect(&SliceFrame::new(&buf), &table);
        assert_eq!(
            outcome,
            Outcome::Matched {
                source: Ipv4Addr::new(203, 0, 113, 7),
                policy: 0
            }
        );
    }

    #[test]
    fn lookup_through_reference() {
        let table = ScanTable {
            entries: &[(Ipv4Addr::new(0, 0, 0, 0), 0, 0)],
        };
        let by_ref = &table;
        let buf = frame_from(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(classify(&SliceFrame::new(&buf), &by_ref), Decision::Drop);
    }

    const DENY_ALL: ScanTable<'static> = ScanTable {
        entries: &[(Ipv4Addr::UNSPECIFIED, 0, 0)],
    };

    proptest! {
        #[test]
        fn short_frames_pass(buf in proptest::collection::vec(any::<u8>(), 0..ETH_HDR_LEN)) {
            prop_assert_eq!(verdict(&buf, &DENY_ALL), Decision::Pass);
        }

        #[test]
        fn non_ipv4_frames_pass(
            ether_type in any::<u16>().prop_filter("not ipv4", |t| *t != ETH_P_IPV4),
            payload in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let mut buf = vec![0u8; ETH_HDR_LEN];
            buf[12..14].copy_from_slice(&ether_type.to_be_bytes());
            buf.extend_from_slice(&payload);
            prop_assert_eq!(verdict(&buf, &DENY_ALL), Decision::Pass);
        }

        #[test]
        fn truncated_ipv4_header_passes(extra in 0..IPV4_MIN_HEADER_LEN) {
            let mut buf = vec![0u8; ETH_HDR_LEN + extra];
            buf[12..14].copy_from_slice(&ETH_P_IPV4.to_be_bytes());
            prop_assert_eq!(verdict(&buf, &DENY_ALL), Decision::Pass);
        }

        #[test]
        fn full_ipv4_header_reaches_table(src in any::<u32>(), tail in 0usize..64) {
            let mut buf = frame_from(Ipv4Addr::from(src));
            buf.resize(buf.len() + tail, 0);
            prop_assert_eq!(verdict(&buf, &DENY_ALL), Decision::Drop);
        }

        #[test]
        fn verdict_is_repeatable(buf in proptest::collection::vec(any::<u8>(), 0..64)) {
            let table = ScanTable {
                entries: &[(Ipv4Addr::new(10, 0, 0, 0), 8, 0)],
            };
            prop_assert_eq!(verdict(&buf, &table), verdict(&buf, &table));
        }

        #[test]
        fn build_key_round_trips(raw in any::<u32>()) {
            let addr = Ipv4Addr::from(raw);
            prop_assert_eq!(build_key(addr).address(), addr);
        }
    }
}
