// Policy map and its adapter to the decision core.
//
// Key layout: { u32 prefixlen; u8 addr[4] } with the address in network
// order. Value: one policy byte, 0 = drop, anything else = pass.
// The agent owns the contents; this program only ever reads them.

use aya_ebpf::bindings::BPF_F_NO_PREALLOC;
use aya_ebpf::macros::map;
use aya_ebpf::maps::{LpmTrie, lpm_trie::Key};
use ip_filter_common::{POLICY_MAP_ENTRIES, PolicyKey, PolicyLookup};

#[map(name = "ip_map")]
static IP_MAP: LpmTrie<[u8; 4], u8> =
    LpmTrie::<[u8; 4], u8>::with_max_entries(POLICY_MAP_ENTRIES, BPF_F_NO_PREALLOC);

/// Read-only handle on `ip_map` handed to the core.
pub struct KernelTable;

impl PolicyLookup for KernelTable {
    #[inline(always)]
    fn lookup(&self, key: &PolicyKey) -> Option<u8> {
        IP_MAP.get(&Key::new(key.prefix_len, key.addr)).copied()
    }
}
