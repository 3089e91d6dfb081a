use std::{collections::BTreeSet, net::Ipv4Addr, sync::RwLock};

use anyhow::Result;
use ip_filter_common::{PolicyKey, PolicyLookup};
use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::FilterMode;
use crate::model::PolicyEntry;
use crate::sources::ZoneSource;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("prefix {0} is not in the policy table")]
    NotFound(Ipv4Net),
    #[error("failed to update {network}: {source}")]
    Update {
        network: Ipv4Net,
        #[source]
        source: aya::maps::MapError,
    },
    #[error("failed to read policy map: {0}")]
    Read(#[source] aya::maps::MapError),
    #[error("failed to open policy map at {path}: {reason}")]
    Open { path: String, reason: String },
    #[error("policy table lock poisoned")]
    Poisoned,
}

/// Control-plane side of the policy table.
///
/// The datapath only reads; everything that writes goes through here.
pub trait PolicyTable {
    fn insert(&self, network: Ipv4Net, policy: u8) -> Result<(), TableError>;
    fn remove(&self, network: Ipv4Net) -> Result<(), TableError>;
    fn list(&self) -> Result<Vec<PolicyEntry>, TableError>;
}

/// Userspace LPM table, used for offline checks and in tests.
pub struct MemoryPolicyTable {
    trie: RwLock<PrefixMap<Ipv4Net, u8>>,
}

impl MemoryPolicyTable {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(PrefixMap::new()),
        }
    }

    pub fn from_entries<I>(entries: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = PolicyEntry>,
    {
        let table = Self::new();
        for entry in entries {
            table.insert(entry.network, entry.policy)?;
        }
        Ok(table)
    }
}

impl Default for MemoryPolicyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyTable for MemoryPolicyTable {
    fn insert(&self, network: Ipv4Net, policy: u8) -> Result<(), TableError> {
        let mut trie = self.trie.write().map_err(|_| TableError::Poisoned)?;
        trie.insert(network.trunc(), policy);
        Ok(())
    }

    fn remove(&self, network: Ipv4Net) -> Result<(), TableError> {
        let mut trie = self.trie.write().map_err(|_| TableError::Poisoned)?;
        match trie.remove(&network.trunc()) {
            Some(_) => Ok(()),
            None => Err(TableError::NotFound(network)),
        }
    }

    fn list(&self) -> Result<Vec<PolicyEntry>, TableError> {
        let trie = self.trie.read().map_err(|_| TableError::Poisoned)?;
        Ok(trie
            .iter()
            .map(|(network, policy)| PolicyEntry {
                network: *network,
                policy: *policy,
            })
            .collect())
    }
}

impl PolicyLookup for MemoryPolicyTable {
    fn lookup(&self, key: &PolicyKey) -> Option<u8> {
        let query = Ipv4Net::new(Ipv4Addr::from(key.addr), key.prefix_len as u8).ok()?;
        // A poisoned table answers like an empty one.
        let trie = self.trie.read().ok()?;
        trie.get_lpm(&query).map(|(_, policy)| *policy)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RefreshSummary {
    pub removed: usize,
    pub inserted: usize,
    pub failed: usize,
}

/// Replace the table contents with the zone lists of `countries`.
///
/// All lists are fetched before the table is touched, so a failed download
/// leaves the previous contents in place. New entries are written before
/// stale ones are removed: a prefix listed before and after the refresh is
/// never missing from the table.
pub async fn refresh<T: PolicyTable>(
    table: &T,
    mode: FilterMode,
    countries: &[String],
    source: &ZoneSource,
) -> Result<RefreshSummary> {
    let mut networks = BTreeSet::new();
    for country in countries {
        let zone = source.fetch(country).await?;
        info!(country = %country, prefixes = zone.len(), "loaded zone list");
        networks.extend(zone);
    }

    let previous = table.list()?;
    let policy = mode.policy();
    let mut summary = RefreshSummary::default();
    for &network in &networks {
        match table.insert(network, policy) {
            Ok(()) => summary.inserted += 1,
            Err(err) => {
                summary.failed += 1;
                warn!(%network, "failed to update policy map: {err}");
            }
        }
    }
    for entry in previous {
        if networks.contains(&entry.network) {
            continue;
        }
        match table.remove(entry.network) {
            Ok(()) => summary.removed += 1,
            Err(err) => {
                summary.failed += 1;
                warn!(network = %entry.network, "failed to delete entry: {err}");
            }
        }
    }

    info!(
        %mode,
        removed = summary.removed,
        inserted = summary.inserted,
        failed = summary.failed,
        "policy table refreshed"
    );
    Ok(summary)
}

/// Log the number of entries and each entry.
pub fn log_table<T: PolicyTable>(table: &T) -> Result<usize, TableError> {
    let entries = table.list()?;
    for entry in &entries {
        info!(network = %entry.network, policy = entry.policy, "found entry");
    }
    info!(entries = entries.len(), "current map entries");
    Ok(entries.len())
}
