#![cfg_attr(not(test), no_std)]

// Decision core shared between the XDP program and the userspace agent.
// Keep this crate `no_std` and allocation-free so the bpf target can link it.

pub mod frame;
pub mod parse;
pub mod policy;

pub use frame::{FrameView, SliceFrame};
pub use parse::{EthernetHeader, ParseError, parse_ethernet, parse_ipv4_source};
pub use policy::{Decision, Outcome, PolicyKey, PolicyLookup, build_key, classify, decide, inspect};

/// Name of the XDP program symbol inside the bpf object.
pub const PROGRAM_NAME: &str = "ip_filter";
/// Name of the LPM trie holding source-prefix policies.
pub const POLICY_MAP_NAME: &str = "ip_map";
/// Default capacity of [`POLICY_MAP_NAME`].
pub const POLICY_MAP_ENTRIES: u32 = 500_000;

/// Policy byte written for prefixes that must be dropped.
pub const POLICY_DENY: u8 = 0;
/// Policy byte written for prefixes that are explicitly allowed.
pub const POLICY_ALLOW: u8 = 1;
