//! The blacklist entry store
//!
//! A fixed number of buckets, each the head of a singly linked chain of
//! entries. Chains link entries by slab index and every entry owns the arena
//! block that pays for it, so unlinking an entry and freeing its storage are
//! the same step.
//!
//! Expired entries are not removed when they expire. They are discovered:
//!
//! - lazily, by any lookup, insert or delete walking the entry's bucket;
//! - actively, by [`BlacklistTable::evict_until`], which scans buckets from a
//!   persistent cursor under a time budget.
//!
//! The table itself is not synchronized. The owner wraps it in a single lock
//! that also covers the byte counter.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::arena::{ArenaBlock, ShmArena};
use crate::error::{BlacklistError, Result};
use crate::slab::{EntrySlab, SlotId};
use crate::ticks::{Clock, Ticks, ms_to_ticks, ticks_to_ms, ticks_to_s};
use crate::types::{BlacklistFlags, Destination, Protocol, entry_size};

/// Default number of hash buckets
pub const DEFAULT_BUCKET_COUNT: usize = 1024;

/// Arena bytes accounted for each bucket head
pub const BUCKET_HEAD_SIZE: usize = 16;

/// Arena bytes accounted for the shared byte counter
pub const COUNTER_SIZE: usize = std::mem::size_of::<usize>();

/// Time an insert may spend reclaiming room before giving up (250 ms)
pub const REACTIVE_EVICTION_TIMEOUT: Ticks = ms_to_ticks(250);

/// Time a scheduled sweep may hold the table
pub const SCHEDULED_SWEEP_TIMEOUT: Ticks = 2;

/// Bounds on a single eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepLimits {
    /// Stop once this many ticks have elapsed, checked after each non-empty bucket
    pub timeout: Ticks,
    /// Stop after visiting this many buckets
    pub max_buckets: usize,
}

impl SweepLimits {
    pub fn timeout(timeout: Ticks) -> Self {
        Self {
            timeout,
            max_buckets: usize::MAX,
        }
    }

    pub fn with_max_buckets(mut self, max_buckets: usize) -> Self {
        self.max_buckets = max_buckets;
        self
    }
}

/// What an insert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new entry was stored
    Inserted,
    /// A live matching entry had its flags merged and its TTL restarted
    Refreshed,
}

/// Operator view of one stored entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryView {
    pub protocol: Protocol,
    pub address: IpAddr,
    pub port: u16,
    /// Seconds until expiry; negative once expired but not yet removed
    pub expires_in: i64,
    /// Raw flags, including the address family tag
    pub flags: u8,
}

/// Entry count of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketStat {
    pub bucket: usize,
    pub entries: u32,
}

#[derive(Debug)]
struct Entry {
    next: Option<SlotId>,
    expires_at: Ticks,
    port: u16,
    protocol: Protocol,
    flags: BlacklistFlags,
    addr: IpAddr,
    block: ArenaBlock,
}

impl Entry {
    fn matches(&self, dest: &Destination) -> bool {
        self.port == dest.port && self.addr == dest.addr && self.protocol.matches(dest.protocol)
    }

    fn is_expired(&self, now: Ticks) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    head: Option<SlotId>,
    entries: u32,
}

/// Hash table of blacklisted destinations with byte accounting
#[derive(Debug)]
pub struct BlacklistTable {
    buckets: Vec<Bucket>,
    slab: EntrySlab<Entry>,
    arena: ShmArena,
    /// Counter and bucket array storage, returned on release
    header: Vec<ArenaBlock>,
    bytes_used: usize,
    bytes_budget: usize,
    sweep_cursor: usize,
    pressure_events: u64,
}

impl BlacklistTable {
    /// Allocate the counter and bucket array from `arena`
    pub fn new(arena: ShmArena, bucket_count: usize, bytes_budget: usize) -> Result<Self> {
        if bucket_count == 0 || !bucket_count.is_power_of_two() {
            return Err(BlacklistError::Config(format!(
                "bucket count must be a non-zero power of two, got {}",
                bucket_count
            )));
        }

        let counter = arena.alloc(COUNTER_SIZE)?;
        let buckets = match arena.alloc(bucket_count * BUCKET_HEAD_SIZE) {
            Ok(block) => block,
            Err(e) => {
                arena.free(counter);
                return Err(e);
            }
        };

        Ok(Self {
            buckets: vec![Bucket::default(); bucket_count],
            slab: EntrySlab::new(),
            arena,
            header: vec![counter, buckets],
            bytes_used: 0,
            bytes_budget,
            sweep_cursor: 0,
            pressure_events: 0,
        })
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn bytes_budget(&self) -> usize {
        self.bytes_budget
    }

    pub fn set_bytes_budget(&mut self, bytes_budget: usize) {
        self.bytes_budget = bytes_budget;
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Bucket the next eviction pass starts from
    pub fn sweep_cursor(&self) -> usize {
        self.sweep_cursor
    }

    /// Entries reachable from the table, expired or not
    pub fn len(&self) -> usize {
        self.slab.len()
    }

    /// Inserts that found the budget full and had to evict
    pub fn pressure_events(&self) -> u64 {
        self.pressure_events
    }

    pub fn reset_pressure_events(&mut self) {
        self.pressure_events = 0;
    }

    /// Bucket holding entries for `addr`:`port`; the protocol plays no part
    pub fn bucket_index(&self, addr: &IpAddr, port: u16) -> usize {
        let port = port.to_ne_bytes();
        let hash = match addr {
            IpAddr::V4(ip) => hash2(&ip.octets(), &port),
            IpAddr::V6(ip) => hash2(&ip.octets(), &port),
        };
        hash as usize & (self.buckets.len() - 1)
    }

    /// Find the first live entry matching `dest`, freeing expired entries on the way
    pub fn find(&mut self, dest: &Destination, now: Ticks) -> Option<BlacklistFlags> {
        let id = self.find_slot(dest, now)?;
        Some(self.entry(id).flags)
    }

    /// Record `dest`, or refresh the live entry already matching it
    pub fn insert(
        &mut self,
        dest: &Destination,
        flags: BlacklistFlags,
        ttl: Ticks,
        clock: &dyn Clock,
    ) -> Result<InsertOutcome> {
        let flags = if dest.is_ipv6() {
            flags | BlacklistFlags::IS_IPV6
        } else {
            flags & !BlacklistFlags::IS_IPV6
        };
        let now = clock.now();

        if let Some(id) = self.find_slot(dest, now) {
            let entry = self.entry_mut(id);
            entry.flags |= flags;
            entry.expires_at = now.saturating_add(ttl);
            return Ok(InsertOutcome::Refreshed);
        }

        let size = entry_size(&dest.addr);
        if self.bytes_used + size >= self.bytes_budget {
            self.pressure_events += 1;
            let target = self.bytes_used / 16 * 14;
            self.evict_until(target, 0, SweepLimits::timeout(REACTIVE_EVICTION_TIMEOUT), clock);
            if self.bytes_used + size >= self.bytes_budget {
                warn!(
                    "dst blacklist full ({} of {} bytes), not adding {}",
                    self.bytes_used, self.bytes_budget, dest
                );
                return Err(BlacklistError::CapacityExceeded {
                    used: self.bytes_used,
                    budget: self.bytes_budget,
                    requested: size,
                });
            }
        }

        let block = self.arena.alloc(size)?;
        let idx = self.bucket_index(&dest.addr, dest.port);
        let id = self.slab.insert(Entry {
            next: self.buckets[idx].head,
            expires_at: now.saturating_add(ttl),
            port: dest.port,
            protocol: dest.protocol,
            flags,
            addr: dest.addr,
            block,
        });
        self.buckets[idx].head = Some(id);
        self.buckets[idx].entries += 1;
        self.bytes_used += size;
        trace!("blacklisted {} flags {} in bucket {}", dest, flags, idx);
        Ok(InsertOutcome::Inserted)
    }

    /// Delete the first live entry matching `dest`
    pub fn remove(&mut self, dest: &Destination, now: Ticks) -> bool {
        let idx = self.bucket_index(&dest.addr, dest.port);
        let mut prev = None;
        let mut cur = self.buckets[idx].head;
        while let Some(id) = cur {
            let entry = self.entry(id);
            let next = entry.next;
            if entry.is_expired(now) {
                self.unlink(idx, prev, id);
            } else if entry.matches(dest) {
                self.unlink(idx, prev, id);
                return true;
            } else {
                prev = Some(id);
            }
            cur = next;
        }
        false
    }

    /// Free entries expiring within `delta` ticks until at most `target` bytes are used
    ///
    /// Scanning starts at the sweep cursor and wraps around once. It stops as
    /// soon as the target is reached, the time budget is spent, or
    /// `limits.max_buckets` buckets were visited; the cursor is left where the
    /// scan stopped so the next pass continues from there. Returns the number
    /// of entries freed.
    ///
    /// A pass that runs out of time resumes on the bucket after the last one
    /// it finished, not on that bucket again.
    pub fn evict_until(
        &mut self,
        target: usize,
        delta: Ticks,
        limits: SweepLimits,
        clock: &dyn Clock,
    ) -> usize {
        let count = self.buckets.len();
        let start_time = clock.now();
        let mut now = start_time;
        let mut removed = 0;
        let mut visited = 0;
        let mut idx = self.sweep_cursor % count;
        let mut next_cursor = idx;

        'scan: while visited < count && visited < limits.max_buckets {
            visited += 1;
            if self.buckets[idx].head.is_some() {
                let horizon = now.saturating_add(delta);
                let mut prev = None;
                let mut cur = self.buckets[idx].head;
                while let Some(id) = cur {
                    let entry = self.entry(id);
                    let next = entry.next;
                    if entry.expires_at <= horizon {
                        self.unlink(idx, prev, id);
                        removed += 1;
                        if self.bytes_used <= target {
                            next_cursor = idx;
                            break 'scan;
                        }
                    } else {
                        prev = Some(id);
                    }
                    cur = next;
                }

                now = clock.now();
                let elapsed = now.saturating_sub(start_time);
                if elapsed >= limits.timeout {
                    debug!(
                        "timeout: {} ms >= {} ms",
                        ticks_to_ms(elapsed),
                        ticks_to_ms(limits.timeout)
                    );
                    next_cursor = (idx + 1) % count;
                    break;
                }
            }
            idx = (idx + 1) % count;
            next_cursor = idx;
        }

        self.sweep_cursor = next_cursor;
        if removed > 0 {
            debug!("{} entries removed", removed);
        }
        removed
    }

    /// Remove every entry not marked permanent, expired or not
    pub fn flush(&mut self) -> usize {
        let mut removed = 0;
        for idx in 0..self.buckets.len() {
            let mut prev = None;
            let mut cur = self.buckets[idx].head;
            while let Some(id) = cur {
                let entry = self.entry(id);
                let next = entry.next;
                if entry.flags.contains(BlacklistFlags::PERMANENT) {
                    prev = Some(id);
                } else {
                    self.unlink(idx, prev, id);
                    removed += 1;
                }
                cur = next;
            }
        }
        removed
    }

    /// Every entry still reachable, bucket by bucket
    pub fn dump(&self, now: Ticks, include_expired: bool) -> Vec<EntryView> {
        let mut views = Vec::with_capacity(self.slab.len());
        for bucket in &self.buckets {
            let mut cur = bucket.head;
            while let Some(id) = cur {
                let entry = self.entry(id);
                if include_expired || !entry.is_expired(now) {
                    views.push(EntryView {
                        protocol: entry.protocol,
                        address: entry.addr,
                        port: entry.port,
                        expires_in: signed_secs_until(entry.expires_at, now),
                        flags: entry.flags.bits(),
                    });
                }
                cur = entry.next;
            }
        }
        views
    }

    pub fn bucket_stats(&self) -> Vec<BucketStat> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(bucket, b)| BucketStat {
                bucket,
                entries: b.entries,
            })
            .collect()
    }

    /// Free every entry and the header storage; safe to call more than once
    pub fn release(&mut self) {
        for entry in self.slab.drain() {
            self.arena.free(entry.block);
        }
        for bucket in &mut self.buckets {
            *bucket = Bucket::default();
        }
        for block in self.header.drain(..) {
            self.arena.free(block);
        }
        self.bytes_used = 0;
        self.sweep_cursor = 0;
    }

    fn find_slot(&mut self, dest: &Destination, now: Ticks) -> Option<SlotId> {
        let idx = self.bucket_index(&dest.addr, dest.port);
        let mut prev = None;
        let mut cur = self.buckets[idx].head;
        while let Some(id) = cur {
            let entry = self.entry(id);
            let next = entry.next;
            if entry.is_expired(now) {
                self.unlink(idx, prev, id);
            } else if entry.matches(dest) {
                return Some(id);
            } else {
                prev = Some(id);
            }
            cur = next;
        }
        None
    }

    fn unlink(&mut self, idx: usize, prev: Option<SlotId>, id: SlotId) {
        let entry = self
            .slab
            .remove(id)
            .unwrap_or_else(|| panic!("bucket {} links free slot {}", idx, id.index()));
        match prev {
            Some(prev) => self.entry_mut(prev).next = entry.next,
            None => self.buckets[idx].head = entry.next,
        }
        self.buckets[idx].entries -= 1;

        let size = entry.block.size();
        let used = self.bytes_used;
        self.bytes_used = used
            .checked_sub(size)
            .unwrap_or_else(|| panic!("byte accounting corrupted: {} < {}", used, size));
        self.arena.free(entry.block);
    }

    fn entry(&self, id: SlotId) -> &Entry {
        self.slab
            .get(id)
            .unwrap_or_else(|| panic!("chain links free slot {}", id.index()))
    }

    fn entry_mut(&mut self, id: SlotId) -> &mut Entry {
        self.slab
            .get_mut(id)
            .unwrap_or_else(|| panic!("chain links free slot {}", id.index()))
    }
}

fn signed_secs_until(expires_at: Ticks, now: Ticks) -> i64 {
    if expires_at >= now {
        ticks_to_s(expires_at - now) as i64
    } else {
        -(ticks_to_s(now - expires_at) as i64)
    }
}

/// Two-part string hash: 4-byte stride, then a final avalanche
fn hash2(first: &[u8], second: &[u8]) -> u32 {
    let mut h: u32 = 0;
    hash_update(&mut h, first);
    hash_update(&mut h, second);
    h.wrapping_add(h >> 11)
        .wrapping_add((h >> 13).wrapping_add(h >> 23))
}

fn hash_update(h: &mut u32, bytes: &[u8]) {
    let mut chunks = bytes.chunks_exact(4);
    for chunk in &mut chunks {
        let v = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        *h = h.wrapping_add(v ^ (v >> 3));
    }
    let v = chunks
        .remainder()
        .iter()
        .fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    *h = h.wrapping_add(v ^ (v >> 3));
}
