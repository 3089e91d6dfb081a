use std::{
    convert::TryFrom,
    fs,
    future::Future,
    io,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Mutex,
};

use anyhow::{Context, Result, anyhow, ensure};
use aya::maps::lpm_trie::{Key, LpmTrie};
use aya::maps::{Map, MapData, MapError};
use aya::pin::PinError;
use aya::programs::xdp::XdpLinkId;
use aya::programs::{Xdp, XdpFlags};
use aya::{Ebpf, EbpfLoader};
use clap::ValueEnum;
use ip_filter_common::{POLICY_MAP_NAME, PROGRAM_NAME, PolicyKey, PolicyLookup};
use ipnet::Ipv4Net;
use tokio::{signal, time};
use tracing::{error, info, warn};

use crate::config::FilterConfig;
use crate::model::PolicyEntry;
use crate::sources::ZoneSource;
use crate::store::{PolicyTable, TableError, log_table, refresh};

#[cfg(feature = "embed-ebpf")]
const EBPF_BYTES: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/ip-filter"));

pub const DEFAULT_POLICY_MAP_PIN: &str = "/sys/fs/bpf/ip_filter/ip_map";

type PolicyTrie = LpmTrie<MapData, [u8; 4], u8>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum XdpMode {
    Skb,
    Driver,
    Hw,
}

pub struct AttachOptions {
    /// Interface to attach to; discovered when absent.
    pub iface: Option<String>,
    /// bpf object on disk; falls back to the embedded object.
    pub object: Option<PathBuf>,
    pub pin_path: PathBuf,
    pub xdp_mode: XdpMode,
    pub map_entries: u32,
    pub filter: FilterConfig,
    pub source: ZoneSource,
}

/// `ip_map` as seen from userspace, either freshly loaded or reopened from
/// its pin.
pub struct KernelPolicyTable {
    trie: Mutex<PolicyTrie>,
}

impl KernelPolicyTable {
    pub fn from_pin<P: AsRef<Path>>(pin_path: P) -> Result<Self, TableError> {
        let path = pin_path.as_ref();
        let open_err = |reason: String| TableError::Open {
            path: path.display().to_string(),
            reason,
        };
        let map_data = MapData::from_pin(path).map_err(|e| open_err(e.to_string()))?;
        let map = Map::LpmTrie(map_data);
        Self::from_map(map).map_err(|e| open_err(e.to_string()))
    }

    pub fn from_map(map: Map) -> Result<Self, MapError> {
        let trie = PolicyTrie::try_from(map)?;
        Ok(Self {
            trie: Mutex::new(trie),
        })
    }
}

fn trie_key(network: Ipv4Net) -> Key<[u8; 4]> {
    let network = network.trunc();
    Key::new(u32::from(network.prefix_len()), network.network().octets())
}

fn is_missing(err: &MapError) -> bool {
    match err {
        MapError::KeyNotFound => true,
        MapError::SyscallError(err) => err.io_error.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

impl PolicyTable for KernelPolicyTable {
    fn insert(&self, network: Ipv4Net, policy: u8) -> Result<(), TableError> {
        let mut trie = self.trie.lock().map_err(|_| TableError::Poisoned)?;
        trie.insert(&trie_key(network), policy, 0)
            .map_err(|source| TableError::Update { network, source })
    }

    fn remove(&self, network: Ipv4Net) -> Result<(), TableError> {
        let mut trie = self.trie.lock().map_err(|_| TableError::Poisoned)?;
        trie.remove(&trie_key(network)).map_err(|source| {
            if is_missing(&source) {
                TableError::NotFound(network)
            } else {
                TableError::Update { network, source }
            }
        })
    }

    fn list(&self) -> Result<Vec<PolicyEntry>, TableError> {
        let trie = self.trie.lock().map_err(|_| TableError::Poisoned)?;
        let mut entries = Vec::new();
        for item in trie.iter() {
            let (key, policy) = item.map_err(TableError::Read)?;
            let addr = Ipv4Addr::from(key.data());
            let Ok(network) = Ipv4Net::new(addr, key.prefix_len() as u8) else {
                warn!(%addr, prefix_len = key.prefix_len(), "skipping malformed map key");
                continue;
            };
            entries.push(PolicyEntry { network, policy });
        }
        Ok(entries)
    }
}

impl PolicyLookup for KernelPolicyTable {
    fn lookup(&self, key: &PolicyKey) -> Option<u8> {
        let trie = self.trie.lock().ok()?;
        trie.get(&Key::new(key.prefix_len, key.addr), 0).ok()
    }
}

pub async fn run_filter(opts: AttachOptions) -> Result<()> {
    validate_attach_options(&opts)?;

    let iface = match opts.iface.clone() {
        Some(iface) => iface,
        None => crate::iface::default_interface()?,
    };

    let mut bpf = load_object(&opts)?;
    pin_map(&mut bpf, POLICY_MAP_NAME, &opts.pin_path)?;
    // Declared after `bpf`, so the pin goes before the program is dropped.
    let _pin = PinGuard::new(&opts.pin_path);
    let map = bpf
        .take_map(POLICY_MAP_NAME)
        .with_context(|| format!("map {POLICY_MAP_NAME} not found"))?;
    let table = KernelPolicyTable::from_map(map).context("policy map has unexpected type")?;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    let filter = &opts.filter;
    let initial = refresh(&table, filter.mode, &filter.countries, &opts.source);
    match or_shutdown(shutdown.as_mut(), initial).await {
        Step::Done(res) => {
            res.context("failed to perform initial policy update")?;
        }
        Step::Shutdown(res) => {
            res.context("failed to wait for shutdown signal")?;
            info!("interrupted before attaching {PROGRAM_NAME}");
            return Ok(());
        }
    }

    let link = attach_xdp(&mut bpf, &iface, opts.xdp_mode)?;
    info!(
        %iface,
        mode = ?opts.xdp_mode,
        filter = %filter.mode,
        countries = ?filter.countries,
        "attached {PROGRAM_NAME}, press Ctrl+C to detach"
    );

    let mut refresh_tick = time::interval(filter.update_period);
    let mut report_tick = time::interval(filter.report_interval);
    // Both intervals fire immediately; the table was just filled.
    refresh_tick.tick().await;
    report_tick.tick().await;

    let stopped = loop {
        tokio::select! {
            res = &mut shutdown => break res,
            _ = refresh_tick.tick() => {
                let update = refresh(&table, filter.mode, &filter.countries, &opts.source);
                match or_shutdown(shutdown.as_mut(), update).await {
                    Step::Done(Ok(_)) => {}
                    Step::Done(Err(err)) => error!("failed to update policy table: {err:#}"),
                    Step::Shutdown(res) => break res,
                }
            }
            _ = report_tick.tick() => {
                if let Err(err) = log_table(&table) {
                    warn!("failed to get map stats: {err}");
                }
            }
        }
    };

    info!(%iface, "detaching {PROGRAM_NAME}");
    detach(&mut bpf, link)?;
    stopped.context("failed to wait for shutdown signal")
}

enum Step<T> {
    Done(T),
    Shutdown(io::Result<()>),
}

/// Drive `work` to completion unless `shutdown` resolves first.
async fn or_shutdown<S, W>(shutdown: Pin<&mut S>, work: W) -> Step<W::Output>
where
    S: Future<Output = io::Result<()>>,
    W: Future,
{
    tokio::select! {
        res = shutdown => Step::Shutdown(res),
        out = work => Step::Done(out),
    }
}

/// Removes the map pin when dropped.
struct PinGuard {
    path: PathBuf,
}

impl PinGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        unpin(&self.path);
    }
}

fn validate_attach_options(opts: &AttachOptions) -> Result<()> {
    ensure!(
        opts.map_entries > 0,
        "policy map size must be greater than zero"
    );
    if opts.object.is_none() && !cfg!(feature = "embed-ebpf") {
        return Err(anyhow!(
            "no bpf object embedded in this build; pass --object <PATH>"
        ));
    }
    Ok(())
}

fn load_object(opts: &AttachOptions) -> Result<Ebpf> {
    let mut loader = EbpfLoader::new();
    #[allow(deprecated)]
    {
        loader.set_max_entries(POLICY_MAP_NAME, opts.map_entries);
    }

    match &opts.object {
        Some(path) => loader
            .load_file(path)
            .with_context(|| format!("failed to load bpf object {}", path.display())),
        None => load_embedded(&mut loader),
    }
}

#[cfg(feature = "embed-ebpf")]
fn load_embedded(loader: &mut EbpfLoader<'_>) -> Result<Ebpf> {
    loader
        .load(EBPF_BYTES)
        .context("failed to load embedded bpf object")
}

#[cfg(not(feature = "embed-ebpf"))]
fn load_embedded(_loader: &mut EbpfLoader<'_>) -> Result<Ebpf> {
    Err(anyhow!("no bpf object embedded in this build"))
}

fn pin_map(bpf: &mut Ebpf, map_name: &str, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    // A pin left by an earlier run points at a map no program reads anymore.
    match fs::remove_file(path) {
        Ok(()) => warn!(path = %path.display(), "replaced stale map pin"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to remove {}", path.display()));
        }
    }
    let map = bpf
        .map_mut(map_name)
        .with_context(|| format!("map {map_name} not found"))?;
    match map.pin(path) {
        Ok(()) => Ok(()),
        Err(PinError::SyscallError(err)) if err.io_error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(())
        }
        Err(err) => Err(anyhow!(
            "failed to pin map {map_name} at {}: {err}",
            path.display()
        )),
    }
}

fn unpin(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove map pin: {err}"),
    }
}

fn attach_xdp(bpf: &mut Ebpf, iface: &str, mode: XdpMode) -> Result<XdpLinkId> {
    let program: &mut Xdp = bpf
        .program_mut(PROGRAM_NAME)
        .with_context(|| format!("program {PROGRAM_NAME} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.load().context("failed to load xdp program")?;
    program
        .attach(iface, xdp_flags(mode))
        .with_context(|| format!("failed to attach xdp on {iface}"))
}

fn detach(bpf: &mut Ebpf, link: XdpLinkId) -> Result<()> {
    let program: &mut Xdp = bpf
        .program_mut(PROGRAM_NAME)
        .with_context(|| format!("program {PROGRAM_NAME} not found"))?
        .try_into()
        .context("xdp program has wrong type")?;
    program.detach(link).context("failed to detach xdp program")
}

fn xdp_flags(mode: XdpMode) -> XdpFlags {
    match mode {
        XdpMode::Skb => XdpFlags::SKB_MODE,
        XdpMode::Driver => XdpFlags::DRV_MODE,
        XdpMode::Hw => XdpFlags::HW_MODE,
    }
}
