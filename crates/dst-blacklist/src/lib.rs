//! # Destination blacklist for SIP proxies
//!
//! A shared negative cache of network destinations (protocol, address, port)
//! that recently failed. While a destination is blacklisted the proxy skips it
//! instead of spending transaction time on a dead peer; entries are forgiven
//! automatically once their TTL runs out.
//!
//! The cache is bounded in memory. Entries are charged against a byte budget
//! and the storage comes from a shared arena; when an insert finds the budget
//! full the table reclaims expired entries under a strict time limit before
//! refusing the add. Expired entries are also dropped lazily by any lookup
//! touching their bucket, and a background task sweeps the rest periodically.
//!
//! ## Example
//!
//! ```
//! use std::net::IpAddr;
//! use rvoip_dst_blacklist::{BlacklistConfig, BlacklistFlags, DstBlacklist, Protocol};
//!
//! let blacklist = DstBlacklist::init(BlacklistConfig::default().without_sweep())?;
//! let peer: IpAddr = "192.0.2.10".parse().unwrap();
//!
//! blacklist.blacklist(Protocol::Udp, peer, 5060, BlacklistFlags::TIMEOUT)?;
//!
//! // a wildcard lookup matches the UDP entry
//! let reasons = blacklist.is_blacklisted(Protocol::Any, peer, 5060);
//! assert_eq!(reasons, Some(BlacklistFlags::TIMEOUT));
//! # Ok::<(), rvoip_dst_blacklist::BlacklistError>(())
//! ```

pub mod arena;
pub mod blacklist;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod rpc;
pub mod slab;
pub mod table;
pub mod ticks;
pub mod types;

pub use arena::{ArenaBlock, ShmArena};
pub use blacklist::{
    AddOutcome, BlacklistHook, DstBlacklist, DstBlacklistBuilder, HookAction, MemInfo,
};
pub use config::{BlacklistConfig, IgnoreMasks};
pub use error::{BlacklistError, Result};
pub use logging::{LoggingConfig, setup_logging};
pub use rpc::{BlacklistRpc, RpcFault, RpcMethod};
pub use table::{BucketStat, EntryView, SweepLimits};
pub use ticks::{Clock, ManualClock, MonotonicClock, TICKS_HZ, Ticks};
pub use types::{BlacklistFlags, Destination, Protocol};

/// Re-export of commonly used items
pub mod prelude {
    pub use crate::blacklist::{AddOutcome, DstBlacklist, HookAction};
    pub use crate::config::BlacklistConfig;
    pub use crate::error::{BlacklistError, Result};
    pub use crate::types::{BlacklistFlags, Destination, Protocol};
}
