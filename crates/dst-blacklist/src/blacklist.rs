//! The destination blacklist handle
//!
//! [`DstBlacklist`] is what the rest of the proxy talks to. It owns the
//! entry table behind one table-wide lock, the maintenance timer and the
//! add/search hooks. Handles are cheap to clone and all clones share the
//! same table.
//!
//! ## Lifecycle
//!
//! [`DstBlacklist::init`] allocates the table header from the arena, then the
//! lock, then registers the maintenance timer. Any failure releases whatever
//! was already allocated. [`DstBlacklist::destroy`] releases everything and
//! may be called any number of times; dropping the last handle does the same.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::arena::{ArenaBlock, ShmArena};
use crate::config::{BlacklistConfig, IgnoreMasks};
use crate::error::{BlacklistError, Result};
use crate::maintenance::MaintenanceTask;
use crate::table::{
    BlacklistTable, BucketStat, EntryView, InsertOutcome, SCHEDULED_SWEEP_TIMEOUT, SweepLimits,
};
use crate::ticks::{Clock, MonotonicClock, Ticks, duration_to_ticks};
use crate::types::{BlacklistFlags, Destination, Protocol};

/// Arena bytes accounted for the table lock
pub const LOCK_SIZE: usize = 8;

/// Counter names understood by [`DstBlacklist::counter`]
pub const HIT_COUNTER: &str = "bkl_hit_cnt";
pub const LRU_COUNTER: &str = "bkl_lru_cnt";

/// Verdict of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// No opinion, let the next hook or the table decide
    Continue,
    /// On add: record immediately. On search: report a hit with the hook's flags.
    Accept,
    /// On add: do not record. On search: report a miss.
    Deny,
}

/// Callback consulted before adds or lookups
pub trait BlacklistHook: Send + Sync {
    fn on_blacklist_action(&self, dest: &Destination, flags: &mut BlacklistFlags) -> HookAction;
}

impl<F> BlacklistHook for F
where
    F: Fn(&Destination, &mut BlacklistFlags) -> HookAction + Send + Sync,
{
    fn on_blacklist_action(&self, dest: &Destination, flags: &mut BlacklistFlags) -> HookAction {
        self(dest, flags)
    }
}

#[derive(Default)]
struct HookList {
    hooks: Vec<Arc<dyn BlacklistHook>>,
}

impl HookList {
    fn run(&self, dest: &Destination, flags: &mut BlacklistFlags) -> HookAction {
        for hook in &self.hooks {
            let action = hook.on_blacklist_action(dest, flags);
            if action != HookAction::Continue {
                return action;
            }
        }
        HookAction::Continue
    }

    fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Result of a successful add request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddOutcome {
    /// A new entry was stored
    Inserted,
    /// An existing entry was refreshed and its flags merged
    Refreshed,
    /// Nothing recorded: blacklist disabled or every reason masked out
    Ignored,
    /// Nothing recorded: an add hook refused
    Denied,
}

impl From<InsertOutcome> for AddOutcome {
    fn from(outcome: InsertOutcome) -> Self {
        match outcome {
            InsertOutcome::Inserted => AddOutcome::Inserted,
            InsertOutcome::Refreshed => AddOutcome::Refreshed,
        }
    }
}

/// Memory usage of the entry table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemInfo {
    pub used: usize,
    pub budget: usize,
}

struct Inner {
    config: BlacklistConfig,
    clock: Arc<dyn Clock>,
    arena: ShmArena,
    table: Mutex<Option<BlacklistTable>>,
    lock_block: Mutex<Option<ArenaBlock>>,
    maintenance: Mutex<Option<MaintenanceTask>>,
    initialized: bool,
    enabled: AtomicBool,
    masks: IgnoreMasks,
    add_hooks: HookList,
    search_hooks: HookList,
    hits: AtomicU64,
}

impl Inner {
    fn teardown(&self) {
        if let Some(task) = self.maintenance.lock().take() {
            task.stop();
        }
        if let Some(block) = self.lock_block.lock().take() {
            self.arena.free(block);
        }
        if let Some(mut table) = self.table.lock().take() {
            table.release();
            info!("dst blacklist destroyed");
        }
    }

    fn sweep(&self) -> usize {
        let mut table = self.table.lock();
        match table.as_mut() {
            Some(table) => table.evict_until(
                0,
                0,
                SweepLimits::timeout(SCHEDULED_SWEEP_TIMEOUT),
                self.clock.as_ref(),
            ),
            None => 0,
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Builder for [`DstBlacklist`] with a custom clock, arena or hooks
pub struct DstBlacklistBuilder {
    config: BlacklistConfig,
    clock: Option<Arc<dyn Clock>>,
    arena: Option<ShmArena>,
    add_hooks: HookList,
    search_hooks: HookList,
}

impl DstBlacklistBuilder {
    pub fn new(config: BlacklistConfig) -> Self {
        Self {
            config,
            clock: None,
            arena: None,
            add_hooks: HookList::default(),
            search_hooks: HookList::default(),
        }
    }

    /// Use `clock` instead of a [`MonotonicClock`]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Draw storage from `arena` instead of a private one sized by `arena_kb`
    pub fn arena(mut self, arena: ShmArena) -> Self {
        self.arena = Some(arena);
        self
    }

    /// Hook consulted before every add, in registration order
    pub fn add_hook(mut self, hook: impl BlacklistHook + 'static) -> Self {
        self.add_hooks.hooks.push(Arc::new(hook));
        self
    }

    /// Hook consulted before every lookup, in registration order
    pub fn search_hook(mut self, hook: impl BlacklistHook + 'static) -> Self {
        self.search_hooks.hooks.push(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<DstBlacklist> {
        self.config.validate()?;
        let enabled = self.config.enabled;
        if !enabled && !(self.add_hooks.is_empty() && self.search_hooks.is_empty()) {
            return Err(BlacklistError::Disabled);
        }

        let arena = self
            .arena
            .unwrap_or_else(|| ShmArena::new(self.config.arena_bytes()));
        let blacklist = DstBlacklist {
            inner: Arc::new(Inner {
                masks: self.config.ignore_masks(),
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::new())),
                arena,
                table: Mutex::new(None),
                lock_block: Mutex::new(None),
                maintenance: Mutex::new(None),
                initialized: enabled,
                enabled: AtomicBool::new(enabled),
                add_hooks: self.add_hooks,
                search_hooks: self.search_hooks,
                hits: AtomicU64::new(0),
            }),
        };

        if !enabled {
            info!("dst blacklist turned off");
            return Ok(blacklist);
        }

        if let Err(e) = blacklist.allocate() {
            blacklist.destroy();
            return Err(e);
        }
        info!(
            "dst blacklist ready: {} buckets, {} bytes budget, default ttl {}s",
            blacklist.inner.config.bucket_count,
            blacklist.inner.config.max_bytes(),
            blacklist.inner.config.default_ttl_secs
        );
        Ok(blacklist)
    }
}

/// Shared negative cache of destinations that recently failed
#[derive(Clone)]
pub struct DstBlacklist {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DstBlacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DstBlacklist")
            .field("enabled", &self.is_enabled())
            .field("mem", &self.stats())
            .finish()
    }
}

impl DstBlacklist {
    /// Build a blacklist with the default clock and a private arena
    pub fn init(config: BlacklistConfig) -> Result<Self> {
        DstBlacklistBuilder::new(config).build()
    }

    pub fn builder(config: BlacklistConfig) -> DstBlacklistBuilder {
        DstBlacklistBuilder::new(config)
    }

    fn allocate(&self) -> Result<()> {
        let inner = &self.inner;
        let table = BlacklistTable::new(
            inner.arena.clone(),
            inner.config.bucket_count,
            inner.config.max_bytes(),
        )?;
        *inner.table.lock() = Some(table);
        *inner.lock_block.lock() = Some(inner.arena.alloc(LOCK_SIZE)?);

        if let Some(period) = inner.config.sweep_interval() {
            let weak: Weak<Inner> = Arc::downgrade(inner);
            let task = MaintenanceTask::spawn(period, move || {
                let inner = weak.upgrade()?;
                let alive = inner.table.lock().is_some();
                alive.then(|| inner.sweep())
            })?;
            *inner.maintenance.lock() = Some(task);
        }
        Ok(())
    }

    /// Release the timer, the lock and the table; later calls do nothing
    pub fn destroy(&self) {
        self.inner.teardown();
    }

    pub fn config(&self) -> &BlacklistConfig {
        &self.inner.config
    }

    pub fn arena(&self) -> &ShmArena {
        &self.inner.arena
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Switch lookups and adds on or off at runtime
    ///
    /// A blacklist built with `enabled = false` has no table and cannot be
    /// switched on.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        if enabled && !self.inner.initialized {
            return Err(BlacklistError::Config(
                "dst blacklist is turned off at init, it cannot be enabled at runtime".to_string(),
            ));
        }
        self.inner.enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Whether `flags` has a reason left after the protocol's ignore mask
    pub fn should_blacklist(&self, protocol: Protocol, flags: BlacklistFlags) -> bool {
        self.is_enabled() && self.inner.masks.should_blacklist(protocol, flags)
    }

    /// Reasons `protocol`/`addr`:`port` is blacklisted, if it is
    pub fn is_blacklisted(&self, protocol: Protocol, addr: IpAddr, port: u16) -> Option<BlacklistFlags> {
        self.lookup(&Destination::new(protocol, addr, port))
    }

    /// Lookup by destination
    ///
    /// Walking the bucket frees expired entries, so this may change
    /// [`stats`](Self::stats) even when it returns `None`.
    pub fn lookup(&self, dest: &Destination) -> Option<BlacklistFlags> {
        if !self.is_enabled() {
            return None;
        }

        let mut flags = BlacklistFlags::NONE;
        match self.inner.search_hooks.run(dest, &mut flags) {
            HookAction::Deny => return None,
            HookAction::Accept => return Some(flags),
            HookAction::Continue => {}
        }

        let now = self.inner.clock.now();
        let found = self.with_table(|table| table.find(dest, now)).flatten();
        if found.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        }
        found.map(BlacklistFlags::reasons)
    }

    /// Blacklist a destination for the configured default TTL
    pub fn blacklist(
        &self,
        protocol: Protocol,
        addr: IpAddr,
        port: u16,
        flags: BlacklistFlags,
    ) -> Result<AddOutcome> {
        let dest = Destination::new(protocol, addr, port);
        self.add_checked(&dest, flags, self.inner.config.default_ttl())
    }

    /// Blacklist a destination for `ttl`
    pub fn blacklist_with_ttl(
        &self,
        protocol: Protocol,
        addr: IpAddr,
        port: u16,
        flags: BlacklistFlags,
        ttl: Duration,
    ) -> Result<AddOutcome> {
        let dest = Destination::new(protocol, addr, port);
        self.add_checked(&dest, flags, duration_to_ticks(ttl))
    }

    /// Blacklist a destination for `ttl`, ignoring the protocol ignore masks
    pub fn force_blacklist(
        &self,
        protocol: Protocol,
        addr: IpAddr,
        port: u16,
        flags: BlacklistFlags,
        ttl: Duration,
    ) -> Result<AddOutcome> {
        if !self.is_enabled() {
            return Ok(AddOutcome::Ignored);
        }
        let dest = Destination::new(protocol, addr, port);
        self.add(&dest, flags, duration_to_ticks(ttl))
    }

    fn add_checked(&self, dest: &Destination, flags: BlacklistFlags, ttl: Ticks) -> Result<AddOutcome> {
        if !self.should_blacklist(dest.protocol, flags) {
            return Ok(AddOutcome::Ignored);
        }
        self.add(dest, flags, ttl)
    }

    fn add(&self, dest: &Destination, mut flags: BlacklistFlags, ttl: Ticks) -> Result<AddOutcome> {
        if self.inner.add_hooks.run(dest, &mut flags) == HookAction::Deny {
            debug!("add hook refused to blacklist {}", dest);
            return Ok(AddOutcome::Denied);
        }
        self.insert(dest, flags, ttl)
    }

    /// Store an operator supplied entry for the default TTL; masks and hooks are skipped
    pub(crate) fn operator_add(&self, dest: &Destination, flags: BlacklistFlags) -> Result<AddOutcome> {
        self.insert(dest, flags, self.inner.config.default_ttl())
    }

    fn insert(&self, dest: &Destination, flags: BlacklistFlags, ttl: Ticks) -> Result<AddOutcome> {
        let clock = self.inner.clock.as_ref();
        self.with_table(|table| table.insert(dest, flags, ttl, clock))
            .ok_or(BlacklistError::Disabled)?
            .map(AddOutcome::from)
    }

    /// Forget a destination; returns whether a live entry was removed
    pub fn remove(&self, protocol: Protocol, addr: IpAddr, port: u16) -> bool {
        let dest = Destination::new(protocol, addr, port);
        let now = self.inner.clock.now();
        self.with_table(|table| table.remove(&dest, now)).unwrap_or(false)
    }

    /// Remove every entry except the permanent ones
    pub fn flush(&self) -> usize {
        let removed = self.with_table(|table| table.flush()).unwrap_or(0);
        debug!("flushed {} dst blacklist entries", removed);
        removed
    }

    /// Bytes used by entries and the configured budget
    pub fn stats(&self) -> MemInfo {
        let table = self.inner.table.lock();
        match table.as_ref() {
            Some(table) => MemInfo {
                used: table.bytes_used(),
                budget: table.bytes_budget(),
            },
            None => MemInfo {
                used: 0,
                budget: self.inner.config.max_bytes(),
            },
        }
    }

    /// Change the memory budget; existing entries are kept
    pub fn set_max_mem_kb(&self, kb: usize) {
        self.with_table(|table| table.set_bytes_budget(kb << 10));
    }

    /// Every reachable entry, including expired ones not yet removed
    ///
    /// Holds the table lock for the whole walk; meant for debugging.
    pub fn dump(&self) -> Vec<EntryView> {
        let now = self.inner.clock.now();
        self.with_table(|table| table.dump(now, true)).unwrap_or_default()
    }

    /// Like [`dump`](Self::dump) but only entries that have not expired
    pub fn view(&self) -> Vec<EntryView> {
        let now = self.inner.clock.now();
        self.with_table(|table| table.dump(now, false)).unwrap_or_default()
    }

    /// Entry count of every bucket
    pub fn hash_stats(&self) -> Vec<BucketStat> {
        self.with_table(|table| table.bucket_stats()).unwrap_or_default()
    }

    /// One maintenance pass: free expired entries for at most two ticks
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Free entries expiring within `delta` ticks until `target` bytes are used
    pub fn evict_expired(&self, target: usize, delta: Ticks, limits: SweepLimits) -> usize {
        let clock = self.inner.clock.as_ref();
        self.with_table(|table| table.evict_until(target, delta, limits, clock))
            .unwrap_or(0)
    }

    /// Bucket the next eviction pass starts from
    pub fn sweep_cursor(&self) -> usize {
        self.with_table(|table| table.sweep_cursor()).unwrap_or(0)
    }

    pub fn maintenance_running(&self) -> bool {
        self.inner
            .maintenance
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Read a counter by name, optionally zeroing it
    pub fn counter(&self, name: &str, reset: bool) -> Result<u64> {
        if name.eq_ignore_ascii_case(HIT_COUNTER) {
            let hits = if reset {
                self.inner.hits.swap(0, Ordering::Relaxed)
            } else {
                self.inner.hits.load(Ordering::Relaxed)
            };
            Ok(hits)
        } else if name.eq_ignore_ascii_case(LRU_COUNTER) {
            Ok(self
                .with_table(|table| {
                    let events = table.pressure_events();
                    if reset {
                        table.reset_pressure_events();
                    }
                    events
                })
                .unwrap_or(0))
        } else {
            Err(BlacklistError::UnknownStat(name.to_string()))
        }
    }

    /// Every counter by name
    pub fn counters(&self, reset: bool) -> Result<BTreeMap<String, u64>> {
        [HIT_COUNTER, LRU_COUNTER]
            .into_iter()
            .map(|name| Ok((name.to_string(), self.counter(name, reset)?)))
            .collect()
    }

    fn with_table<R>(&self, f: impl FnOnce(&mut BlacklistTable) -> R) -> Option<R> {
        self.inner.table.lock().as_mut().map(f)
    }
}
