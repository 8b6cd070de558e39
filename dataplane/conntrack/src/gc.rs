/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::error::Error as StdError;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aya::maps::{HashMap, Map, MapData, MapError};
use common::{
    ConnKey, ConnRecord, TCP_ACK, TCP_CWR, TCP_ECE, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN, TCP_URG,
};
use tokio::task::spawn_blocking;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::flow::protocol_name;
use crate::metrics::Metrics;
use crate::netutils::ipv4_from_be;
use crate::plugin::Plugin;
use crate::{Error, Result};

pub const PLUGIN_NAME: &str = "conntrackgc";

/// The kernel-shared connection table as seen by the GC.
///
/// The datapath keeps inserting and updating entries while the GC runs, so
/// none of these calls may assume the table is stable between two calls.
pub trait ConnTable: Send {
    /// Calls `visit` for every entry until the enumeration ends or fails.
    fn for_each_entry(
        &self,
        visit: &mut dyn FnMut(ConnKey, ConnRecord),
    ) -> std::result::Result<(), MapError>;

    fn get(&self, key: &ConnKey) -> std::result::Result<Option<ConnRecord>, MapError>;

    fn remove(&mut self, key: &ConnKey) -> std::result::Result<(), MapError>;
}

/// The pinned LRU hash map written by the datapath program.
pub struct PinnedConnTable {
    map: HashMap<MapData, ConnKey, ConnRecord>,
}

impl PinnedConnTable {
    pub fn open(path: &Path) -> Result<Self> {
        let open_err = |source| Error::MapOpenError {
            path: path.display().to_string(),
            source,
        };
        let data = MapData::from_pin(path).map_err(open_err)?;
        let map = HashMap::try_from(Map::LruHashMap(data)).map_err(open_err)?;
        Ok(PinnedConnTable { map })
    }
}

impl ConnTable for PinnedConnTable {
    fn for_each_entry(
        &self,
        visit: &mut dyn FnMut(ConnKey, ConnRecord),
    ) -> std::result::Result<(), MapError> {
        for entry in self.map.iter() {
            let (key, record) = entry?;
            visit(key, record);
        }
        Ok(())
    }

    fn get(&self, key: &ConnKey) -> std::result::Result<Option<ConnRecord>, MapError> {
        match self.map.get(key, 0) {
            Ok(record) => Ok(Some(record)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove(&mut self, key: &ConnKey) -> std::result::Result<(), MapError> {
        self.map.remove(key)
    }
}

/// Whether a map error only says the key is no longer there.
pub fn is_not_found(err: &MapError) -> bool {
    if matches!(err, MapError::KeyNotFound) {
        return true;
    }
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if io_err.raw_os_error() == Some(libc::ENOENT) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

pub trait MonotonicClock: Send + Sync {
    fn now_secs(&self) -> u32;
}

/// `CLOCK_MONOTONIC` in seconds, shifted by a fixed offset.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelClock {
    offset_secs: i64,
}

impl KernelClock {
    pub fn with_offset(offset_secs: i64) -> Self {
        KernelClock { offset_secs }
    }
}

impl MonotonicClock for KernelClock {
    fn now_secs(&self) -> u32 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts is a valid timespec owned by this frame.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }
        (ts.tv_sec as i64)
            .saturating_add(self.offset_secs)
            .clamp(0, u32::MAX as i64) as u32
    }
}

pub fn decode_flags(flags: u8) -> String {
    const NAMES: [(u8, &str); 8] = [
        (TCP_FIN, "FIN"),
        (TCP_SYN, "SYN"),
        (TCP_RST, "RST"),
        (TCP_PSH, "PSH"),
        (TCP_ACK, "ACK"),
        (TCP_URG, "URG"),
        (TCP_ECE, "ECE"),
        (TCP_CWR, "CWR"),
    ];
    let seen: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if seen.is_empty() {
        return "None".to_string();
    }
    seen.join(", ")
}

fn evictable(record: &ConnRecord, now_secs: u32) -> bool {
    record.closing() || record.expired(now_secs)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub seen: usize,
    pub evicted: usize,
    /// Entries that disappeared before they could be deleted.
    pub gone: usize,
    /// Entries the datapath refreshed between enumeration and delete.
    pub refreshed: usize,
    pub failed: usize,
}

impl SweepStats {
    pub fn remaining(&self) -> usize {
        self.seen.saturating_sub(self.evicted + self.gone)
    }
}

/// Deletes every closing or expired entry.
///
/// Keys are collected first and deleted afterwards; each candidate is read
/// again right before its delete so a refreshed entry survives.
pub fn sweep<T: ConnTable + ?Sized>(table: &mut T, now_secs: u32) -> SweepStats {
    let mut stats = SweepStats::default();
    let mut candidates = Vec::new();

    let enumerated = table.for_each_entry(&mut |key, record| {
        stats.seen += 1;
        let evict = evictable(&record, now_secs);
        debug!(
            src_ip = %ipv4_from_be(key.src_addr),
            src_port = u16::from_be(key.src_port),
            dst_ip = %ipv4_from_be(key.dst_addr),
            dst_port = u16::from_be(key.dst_port),
            proto = protocol_name(key.proto),
            lifetime = record.lifetime,
            is_closing = record.is_closing,
            flags_seen = %decode_flags(record.flags_seen),
            last_report = record.last_report,
            evict,
            "conntrack entry"
        );
        if evict {
            candidates.push(key);
        }
    });
    if let Err(err) = enumerated {
        warn!(%err, "conntrack map iteration failed");
    }

    for key in candidates {
        match table.get(&key) {
            Ok(None) => {
                stats.gone += 1;
                continue;
            }
            Ok(Some(record)) if !evictable(&record, now_secs) => {
                stats.refreshed += 1;
                continue;
            }
            Ok(Some(_)) => {}
            Err(err) => debug!(%err, "conntrack entry lookup failed, deleting anyway"),
        }

        match table.remove(&key) {
            Ok(()) => stats.evicted += 1,
            Err(err) if is_not_found(&err) => stats.gone += 1,
            Err(err) => {
                stats.failed += 1;
                warn!(%err, "failed to delete conntrack entry");
            }
        }
    }

    stats
}

type TableOpener<T> = Box<dyn Fn(&Path) -> Result<T> + Send + Sync>;

/// Periodically evicts closing and expired entries from the conntrack map.
pub struct ConntrackGc<T: ConnTable = PinnedConnTable> {
    config: Config,
    metrics: Metrics,
    clock: Arc<dyn MonotonicClock>,
    open: TableOpener<T>,
    table: Option<T>,
    initialized: bool,
}

impl ConntrackGc<PinnedConnTable> {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        ConntrackGc::with_opener(config, metrics, PinnedConnTable::open)
    }
}

impl<T: ConnTable> ConntrackGc<T> {
    pub fn with_opener<F>(config: Config, metrics: Metrics, open: F) -> Self
    where
        F: Fn(&Path) -> Result<T> + Send + Sync + 'static,
    {
        ConntrackGc {
            config,
            metrics,
            clock: Arc::new(KernelClock::default()),
            open: Box::new(open),
            table: None,
            initialized: false,
        }
    }

    pub fn with_clock(mut self, clock: impl MonotonicClock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Runs one sweep, opening the map first if needed.
    pub fn sweep_once(&mut self) -> Result<SweepStats> {
        let table = self.take_table()?;
        let table = self.table.insert(table);
        let stats = sweep(table, self.clock.now_secs());
        self.record_sweep(&stats);
        Ok(stats)
    }

    fn take_table(&mut self) -> Result<T> {
        match self.table.take() {
            Some(table) => Ok(table),
            None => (self.open)(&self.config.conntrack_map_path),
        }
    }

    fn record_sweep(&self, stats: &SweepStats) {
        self.metrics.gc_entries.set(stats.remaining() as i64);
        self.metrics.gc_evicted.inc_by(stats.evicted as u64);
        info!(
            entries = stats.seen,
            evicted = stats.evicted,
            gone = stats.gone,
            refreshed = stats.refreshed,
            failed = stats.failed,
            "conntrack GC sweep finished"
        );
    }
}

impl<T: ConnTable + 'static> ConntrackGc<T> {
    /// Like [`ConntrackGc::sweep_once`], but the map syscalls run on the
    /// blocking pool instead of a runtime worker.
    pub async fn sweep_blocking(&mut self) -> Result<SweepStats> {
        let mut table = self.take_table()?;
        let now_secs = self.clock.now_secs();
        let (table, stats) = spawn_blocking(move || {
            let stats = sweep(&mut table, now_secs);
            (table, stats)
        })
        .await
        .map_err(Error::SweepTaskError)?;
        self.table = Some(table);
        self.record_sweep(&stats);
        Ok(stats)
    }
}

#[async_trait]
impl<T: ConnTable + 'static> Plugin for ConntrackGc<T> {
    fn name(&self) -> &'static str {
        PLUGIN_NAME
    }

    fn init(&mut self) -> Result<()> {
        if self.config.gc_frequency.is_zero() {
            return Err(Error::InvalidConfigError(
                "conntrack GC frequency must be positive".to_string(),
            ));
        }
        self.initialized = true;
        Ok(())
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotInitializedError(PLUGIN_NAME));
        }
        if self.table.is_none() {
            self.table = Some((self.open)(&self.config.conntrack_map_path)?);
        }

        info!(
            path = %self.config.conntrack_map_path.display(),
            frequency = ?self.config.gc_frequency,
            "starting conntrack GC loop"
        );
        let mut ticker = interval(self.config.gc_frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_blocking().await?;
                }
            }
        }

        self.table = None;
        info!("conntrack GC loop stopped");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.table = None;
        Ok(())
    }
}
