//! Blacklist API tests
//!
//! Exercises the public handle end to end: adds, lookups, expiry, memory
//! accounting, lifecycle and the operator commands.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use rvoip_dst_blacklist::blacklist::LOCK_SIZE;
use rvoip_dst_blacklist::table::{BUCKET_HEAD_SIZE, BlacklistTable, COUNTER_SIZE};
use rvoip_dst_blacklist::types::{ENTRY_BASE_SIZE, IPV6_EXTRA_SIZE, entry_size};
use rvoip_dst_blacklist::{
    AddOutcome, BlacklistConfig, BlacklistError, BlacklistFlags, BlacklistRpc, Destination,
    DstBlacklist, HookAction, ManualClock, Protocol, ShmArena,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn blacklist_with_clock(config: BlacklistConfig) -> (DstBlacklist, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let blacklist = DstBlacklist::builder(config.without_sweep())
        .clock(clock.clone())
        .build()
        .unwrap();
    (blacklist, clock)
}

/// Test that a recorded destination is reported with its reasons
#[test]
fn test_add_then_lookup() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let addr = ip("192.0.2.1");

    assert_eq!(blacklist.is_blacklisted(Protocol::Udp, addr, 5060), None);
    let outcome = blacklist
        .blacklist_with_ttl(
            Protocol::Udp,
            addr,
            5060,
            BlacklistFlags::TIMEOUT,
            Duration::from_secs(10),
        )
        .unwrap();

    assert_eq!(outcome, AddOutcome::Inserted);
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Udp, addr, 5060),
        Some(BlacklistFlags::TIMEOUT)
    );
    assert_eq!(blacklist.is_blacklisted(Protocol::Udp, addr, 5061), None);
    assert_eq!(blacklist.stats().used, ENTRY_BASE_SIZE);
}

/// Test that a second add merges reasons and restarts the TTL from the second call
#[test]
fn test_repeat_add_merges_flags_and_restarts_ttl() {
    let (blacklist, clock) = blacklist_with_clock(BlacklistConfig::default());
    let addr = ip("192.0.2.2");

    blacklist
        .blacklist_with_ttl(
            Protocol::Tcp,
            addr,
            5060,
            BlacklistFlags::SEND_ERROR,
            Duration::from_secs(10),
        )
        .unwrap();
    clock.advance_by(Duration::from_secs(5));
    let outcome = blacklist
        .blacklist_with_ttl(
            Protocol::Tcp,
            addr,
            5060,
            BlacklistFlags::ERROR_503,
            Duration::from_secs(20),
        )
        .unwrap();

    assert_eq!(outcome, AddOutcome::Refreshed);
    assert_eq!(blacklist.stats().used, ENTRY_BASE_SIZE);

    // the first TTL would have ended at 10s, the refreshed one ends at 25s
    clock.advance_by(Duration::from_secs(19));
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Tcp, addr, 5060),
        Some(BlacklistFlags::SEND_ERROR | BlacklistFlags::ERROR_503)
    );
    clock.advance_by(Duration::from_secs(1));
    assert_eq!(blacklist.is_blacklisted(Protocol::Tcp, addr, 5060), None);
}

/// Test wildcard protocol matching in both directions
#[test]
fn test_wildcard_protocol_matching() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let stored_any = ip("192.0.2.3");
    let stored_udp = ip("192.0.2.4");

    blacklist
        .blacklist(Protocol::Any, stored_any, 5060, BlacklistFlags::CONNECT_ERROR)
        .unwrap();
    blacklist
        .blacklist(Protocol::Udp, stored_udp, 5060, BlacklistFlags::ICMP_RECEIVED)
        .unwrap();

    assert_eq!(
        blacklist.is_blacklisted(Protocol::Tls, stored_any, 5060),
        Some(BlacklistFlags::CONNECT_ERROR)
    );
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Any, stored_udp, 5060),
        Some(BlacklistFlags::ICMP_RECEIVED)
    );
    assert_eq!(blacklist.is_blacklisted(Protocol::Tcp, stored_udp, 5060), None);
}

/// Test that expired entries are never reported and their bytes are returned
#[test]
fn test_expiry_releases_memory() {
    let (blacklist, clock) = blacklist_with_clock(BlacklistConfig::default());
    let addr = ip("192.0.2.5");
    blacklist
        .blacklist_with_ttl(
            Protocol::Udp,
            addr,
            5060,
            BlacklistFlags::TIMEOUT,
            Duration::from_secs(2),
        )
        .unwrap();
    let arena_used = blacklist.arena().used();

    clock.advance_by(Duration::from_secs(2));
    assert_eq!(blacklist.is_blacklisted(Protocol::Udp, addr, 5060), None);
    assert_eq!(blacklist.stats().used, 0);
    assert_eq!(blacklist.arena().used(), arena_used - ENTRY_BASE_SIZE);
}

/// Test that IPv6 entries are charged the larger size
#[test]
fn test_ipv6_entry_size() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let addr = ip("2001:db8::1");

    blacklist
        .blacklist(Protocol::Tls, addr, 5061, BlacklistFlags::TIMEOUT)
        .unwrap();

    assert_eq!(blacklist.stats().used, ENTRY_BASE_SIZE + IPV6_EXTRA_SIZE);
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Tls, addr, 5061),
        Some(BlacklistFlags::TIMEOUT)
    );
    let dump = blacklist.dump();
    assert_eq!(dump.len(), 1);
    assert_eq!(
        dump[0].flags,
        (BlacklistFlags::TIMEOUT | BlacklistFlags::IS_IPV6).bits()
    );
}

/// Test that a full table refuses new destinations without growing
#[test]
fn test_budget_is_never_exceeded() {
    let config = BlacklistConfig {
        max_mem_kb: 1,
        ..Default::default()
    };
    let (blacklist, _clock) = blacklist_with_clock(config);
    let addr = ip("198.51.100.1");

    let mut refused = 0;
    for port in 0..200 {
        match blacklist.blacklist(Protocol::Udp, addr, port, BlacklistFlags::TIMEOUT) {
            Ok(_) => {}
            Err(BlacklistError::CapacityExceeded { used, budget, .. }) => {
                assert!(used <= budget);
                refused += 1;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(blacklist.stats().used <= blacklist.stats().budget);
    }
    assert!(refused > 0);
}

/// Test that a lowered budget applies to the next insert and keeps existing entries
#[test]
fn test_lowering_budget_refuses_new_entries() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let addr = ip("198.51.100.3");
    for port in 5060..5063 {
        blacklist
            .blacklist(Protocol::Udp, addr, port, BlacklistFlags::TIMEOUT)
            .unwrap();
    }
    assert_eq!(blacklist.stats().used, 3 * ENTRY_BASE_SIZE);

    blacklist.set_max_mem_kb(0);
    assert_eq!(blacklist.stats().budget, 0);
    match blacklist.blacklist(Protocol::Udp, addr, 5063, BlacklistFlags::TIMEOUT) {
        Err(BlacklistError::CapacityExceeded { used, budget, .. }) => {
            assert_eq!(used, 3 * ENTRY_BASE_SIZE);
            assert_eq!(budget, 0);
        }
        other => panic!("expected a refused add, got {:?}", other),
    }
    assert_eq!(blacklist.dump().len(), 3);
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Udp, addr, 5060),
        Some(BlacklistFlags::TIMEOUT)
    );

    blacklist.set_max_mem_kb(1);
    assert_eq!(blacklist.stats().budget, 1024);
    assert_eq!(
        blacklist
            .blacklist(Protocol::Udp, addr, 5063, BlacklistFlags::TIMEOUT)
            .unwrap(),
        AddOutcome::Inserted
    );
}

/// Test that expired entries make room when the budget is full
#[test]
fn test_full_table_reclaims_expired_entries() {
    let config = BlacklistConfig {
        max_mem_kb: 1,
        ..Default::default()
    };
    let (blacklist, clock) = blacklist_with_clock(config);
    let addr = ip("198.51.100.2");

    let mut port = 0;
    while blacklist
        .blacklist_with_ttl(
            Protocol::Udp,
            addr,
            port,
            BlacklistFlags::TIMEOUT,
            Duration::from_secs(1),
        )
        .is_ok()
    {
        port += 1;
    }
    let full = blacklist.stats().used;
    assert!(full > 0);

    // pick a port whose bucket is empty so the insert cannot free anything lazily
    let occupied = blacklist.hash_stats();
    let probe = BlacklistTable::new(ShmArena::with_kb(64), occupied.len(), 0).unwrap();
    let fresh = (port..u16::MAX)
        .find(|&p| occupied[probe.bucket_index(&addr, p)].entries == 0)
        .unwrap();

    clock.advance_by(Duration::from_secs(2));
    let outcome = blacklist
        .blacklist(Protocol::Udp, addr, fresh, BlacklistFlags::TIMEOUT)
        .unwrap();
    assert_eq!(outcome, AddOutcome::Inserted);
    assert!(blacklist.stats().used < full);
    assert_eq!(blacklist.counter("bkl_lru_cnt", false).unwrap(), 2);
}

/// Test that a failed header allocation leaves the arena untouched
#[test]
fn test_init_failure_on_table_rolls_back() {
    let arena = ShmArena::new(100);
    let err = DstBlacklist::builder(BlacklistConfig::default().without_sweep())
        .arena(arena.clone())
        .build()
        .unwrap_err();

    assert!(matches!(err, BlacklistError::OutOfMemory { .. }));
    assert_eq!(arena.used(), 0);
    assert_eq!(arena.blocks(), 0);
}

/// Test that a failed lock allocation releases the table already allocated
#[test]
fn test_init_failure_on_lock_rolls_back() {
    let config = BlacklistConfig {
        bucket_count: 16,
        ..Default::default()
    };
    let arena = ShmArena::new(COUNTER_SIZE + 16 * BUCKET_HEAD_SIZE + LOCK_SIZE - 1);
    let err = DstBlacklist::builder(config.without_sweep())
        .arena(arena.clone())
        .build()
        .unwrap_err();

    assert!(matches!(err, BlacklistError::OutOfMemory { .. }));
    assert_eq!(arena.used(), 0);
}

/// Test that a missing timer runtime fails init and releases everything
#[test]
fn test_init_without_runtime_rolls_back() {
    let arena = ShmArena::with_kb(1024);
    let err = DstBlacklist::builder(BlacklistConfig::default())
        .arena(arena.clone())
        .build()
        .unwrap_err();

    assert!(matches!(err, BlacklistError::Timer(_)));
    assert_eq!(arena.used(), 0);
}

/// Test that teardown may run any number of times and returns every byte
#[test]
fn test_destroy_is_idempotent() {
    let arena = ShmArena::with_kb(1024);
    let blacklist = DstBlacklist::builder(BlacklistConfig::default().without_sweep())
        .arena(arena.clone())
        .build()
        .unwrap();
    for port in 5060..5070 {
        blacklist
            .blacklist(Protocol::Udp, ip("192.0.2.9"), port, BlacklistFlags::TIMEOUT)
            .unwrap();
    }
    assert!(arena.used() > 0);

    blacklist.destroy();
    assert_eq!(arena.used(), 0);
    blacklist.destroy();
    assert_eq!(arena.used(), 0);
    drop(blacklist);
    assert_eq!(arena.used(), 0);
}

/// Test that dropping the last handle releases the arena storage
#[test]
fn test_drop_of_last_handle_releases_storage() {
    let arena = ShmArena::with_kb(1024);
    let blacklist = DstBlacklist::builder(BlacklistConfig::default().without_sweep())
        .arena(arena.clone())
        .build()
        .unwrap();
    let other = blacklist.clone();
    other
        .blacklist(Protocol::Tcp, ip("192.0.2.10"), 5060, BlacklistFlags::SEND_ERROR)
        .unwrap();

    drop(blacklist);
    assert!(arena.used() > 0);
    assert!(other.is_blacklisted(Protocol::Tcp, ip("192.0.2.10"), 5060).is_some());
    drop(other);
    assert_eq!(arena.used(), 0);
}

/// Test removal, flush and the permanent flag
#[test]
fn test_remove_and_flush() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let a = ip("192.0.2.11");
    let b = ip("192.0.2.12");
    blacklist
        .blacklist(Protocol::Udp, a, 5060, BlacklistFlags::TIMEOUT)
        .unwrap();
    blacklist
        .blacklist(
            Protocol::Udp,
            b,
            5060,
            BlacklistFlags::ADMIN_PROHIBITED | BlacklistFlags::PERMANENT,
        )
        .unwrap();
    blacklist
        .blacklist(Protocol::Udp, b, 5061, BlacklistFlags::TIMEOUT)
        .unwrap();

    assert!(blacklist.remove(Protocol::Udp, a, 5060));
    assert!(!blacklist.remove(Protocol::Udp, a, 5060));

    assert_eq!(blacklist.flush(), 1);
    assert!(blacklist.is_blacklisted(Protocol::Udp, b, 5060).is_some());
    assert_eq!(blacklist.is_blacklisted(Protocol::Udp, b, 5061), None);
    assert_eq!(blacklist.stats().used, ENTRY_BASE_SIZE);
}

/// Test that accounting matches the stored entries under concurrent use
#[test]
fn test_concurrent_adds_and_lookups() {
    let config = BlacklistConfig {
        max_mem_kb: 4,
        ..Default::default()
    };
    let (blacklist, _clock) = blacklist_with_clock(config);

    let workers: Vec<_> = (0..4u16)
        .map(|worker| {
            let blacklist = blacklist.clone();
            thread::spawn(move || {
                for i in 0..200u16 {
                    let addr = if i % 3 == 0 {
                        IpAddr::from([0x2001, 0xdb8, 0, 0, 0, 0, worker, i])
                    } else {
                        IpAddr::from([10, worker as u8, (i >> 8) as u8, i as u8])
                    };
                    let _ = blacklist.blacklist(Protocol::Udp, addr, 5060, BlacklistFlags::TIMEOUT);
                    let _ = blacklist.is_blacklisted(Protocol::Any, addr, 5060);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = blacklist.stats();
    assert!(stats.used <= stats.budget);
    let stored: usize = blacklist
        .dump()
        .iter()
        .map(|entry| entry_size(&entry.address))
        .sum();
    assert_eq!(stats.used, stored);
}

/// Test the add command, including address family fallback
#[test]
fn test_rpc_add() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let rpc = BlacklistRpc::new(blacklist.clone());

    let reply = rpc
        .call("dst_blacklist.add", &json!(["192.0.2.50", 5060, 1, 8]))
        .unwrap();
    assert_eq!(reply, json!("inserted"));
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Udp, ip("192.0.2.50"), 5060),
        Some(BlacklistFlags::TIMEOUT)
    );

    rpc.call("dst_blacklist.add", &json!(["2001:db8::7", 5061, 0, 1]))
        .unwrap();
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Tcp, ip("2001:db8::7"), 5061),
        Some(BlacklistFlags::SEND_ERROR)
    );
    assert_eq!(blacklist.stats().used, 2 * ENTRY_BASE_SIZE + IPV6_EXTRA_SIZE);
}

/// Test that operator adds are stored even when masks or hooks would refuse them
#[test]
fn test_rpc_add_skips_masks_and_hooks() {
    let config = BlacklistConfig {
        udp_ignore_mask: BlacklistFlags::ICMP_RECEIVED.bits(),
        ..Default::default()
    };
    let blacklist = DstBlacklist::builder(config.without_sweep())
        .clock(Arc::new(ManualClock::new(0)))
        .add_hook(|_: &Destination, _: &mut BlacklistFlags| HookAction::Deny)
        .build()
        .unwrap();
    let addr = ip("192.0.2.77");

    assert_eq!(
        blacklist
            .blacklist(Protocol::Udp, addr, 5060, BlacklistFlags::ICMP_RECEIVED)
            .unwrap(),
        AddOutcome::Ignored
    );
    assert_eq!(
        blacklist
            .blacklist(Protocol::Tcp, addr, 5060, BlacklistFlags::TIMEOUT)
            .unwrap(),
        AddOutcome::Denied
    );
    assert_eq!(blacklist.stats().used, 0);

    let rpc = BlacklistRpc::new(blacklist.clone());
    let reply = rpc
        .call("dst_blacklist.add", &json!(["192.0.2.77", 5060, 1, 4]))
        .unwrap();
    assert_eq!(reply, json!("inserted"));
    assert_eq!(blacklist.stats().used, ENTRY_BASE_SIZE);
    assert_eq!(
        blacklist.is_blacklisted(Protocol::Udp, addr, 5060),
        Some(BlacklistFlags::ICMP_RECEIVED)
    );
}

/// Test that bad operator input is answered with client faults
#[test]
fn test_rpc_add_rejects_bad_input() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let rpc = BlacklistRpc::new(blacklist.clone());

    let fault = rpc
        .handle("dst_blacklist.add", &json!(["192.0.2.51", 5060, 5, 8]))
        .unwrap_err();
    assert_eq!(fault.code, 400);
    assert_eq!(fault.message, "Unknown protocol: 5");

    let fault = rpc
        .handle("dst_blacklist.add", &json!(["not-an-ip", 5060, 1, 8]))
        .unwrap_err();
    assert_eq!(fault.code, 400);

    let fault = rpc
        .handle("dst_blacklist.add", &json!(["192.0.2.51", 5060, 1, 0x88]))
        .unwrap_err();
    assert_eq!(fault.code, 400);

    let fault = rpc.handle("dst_blacklist.add", &json!(["192.0.2.51"])).unwrap_err();
    assert_eq!(fault.code, 400);

    assert_eq!(blacklist.stats().used, 0);
}

/// Test the read-only operator commands
#[test]
fn test_rpc_introspection() {
    let config = BlacklistConfig {
        bucket_count: 8,
        ..Default::default()
    };
    let (blacklist, clock) = blacklist_with_clock(config);
    let rpc = BlacklistRpc::new(blacklist.clone());
    blacklist
        .blacklist_with_ttl(
            Protocol::Udp,
            ip("192.0.2.60"),
            5060,
            BlacklistFlags::TIMEOUT,
            Duration::from_secs(60),
        )
        .unwrap();
    blacklist
        .blacklist_with_ttl(
            Protocol::Tcp,
            ip("192.0.2.61"),
            5060,
            BlacklistFlags::SEND_ERROR,
            Duration::from_secs(1),
        )
        .unwrap();
    clock.advance_by(Duration::from_secs(3));

    let mem = rpc.call("dst_blacklist.mem_info", &json!([])).unwrap();
    assert_eq!(mem, json!({"used": 2 * ENTRY_BASE_SIZE, "budget": 250 * 1024}));

    // debug shows the expired entry with a negative TTL, view hides it
    let debug = rpc.call("dst_blacklist.debug", &json!([])).unwrap();
    let debug = debug.as_array().unwrap();
    assert_eq!(debug.len(), 2);
    assert!(debug.iter().any(|e| e["expires_in"] == json!(-2)));

    let view = rpc.call("dst_blacklist.view", &json!([])).unwrap();
    assert_eq!(
        view,
        json!([
            "{\n    protocol: udp\n    ip: 192.0.2.60\n    port: 5060\n    expires in (s): 57\n    flags: 8\n}"
        ])
    );

    let stats = rpc.call("dst_blacklist.hash_stats", &json!([])).unwrap();
    let stats = stats.as_array().unwrap();
    assert_eq!(stats.len(), 8);
    let total: u64 = stats.iter().map(|s| s["entries"].as_u64().unwrap()).sum();
    assert_eq!(total, 2);
}

/// Test delete_all and the counters command
#[test]
fn test_rpc_delete_all_and_stats() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let rpc = BlacklistRpc::new(blacklist.clone());
    let addr = ip("192.0.2.70");
    blacklist
        .blacklist(Protocol::Udp, addr, 5060, BlacklistFlags::TIMEOUT)
        .unwrap();
    blacklist
        .blacklist(Protocol::Udp, addr, 5061, BlacklistFlags::PERMANENT)
        .unwrap();
    blacklist.is_blacklisted(Protocol::Udp, addr, 5060);

    assert_eq!(rpc.call("dst_blacklist.delete_all", &json!([])).unwrap(), json!(1));
    assert_eq!(blacklist.is_blacklisted(Protocol::Udp, addr, 5060), None);
    assert!(blacklist.is_blacklisted(Protocol::Udp, addr, 5061).is_some());

    let stats = rpc
        .call("dst_blacklist.stats_get", &json!(["all", 0]))
        .unwrap();
    assert_eq!(stats, json!({"bkl_hit_cnt": 2, "bkl_lru_cnt": 0}));

    let stats = rpc
        .call("dst_blacklist.stats_get", &json!(["BKL_HIT_CNT", 1]))
        .unwrap();
    assert_eq!(stats, json!({"bkl_hit_cnt": 2}));
    assert_eq!(blacklist.counter("bkl_hit_cnt", false).unwrap(), 0);

    let fault = rpc
        .handle("dst_blacklist.stats_get", &json!(["bkl_miss_cnt", 0]))
        .unwrap_err();
    assert_eq!(fault.code, 500);
}

/// Test faults for unknown commands and a switched off blacklist
#[test]
fn test_rpc_faults() {
    let (blacklist, _clock) = blacklist_with_clock(BlacklistConfig::default());
    let rpc = BlacklistRpc::new(blacklist.clone());

    let fault = rpc.handle("dst_blacklist.nope", &json!([])).unwrap_err();
    assert_eq!(fault.code, 404);

    blacklist.set_enabled(false).unwrap();
    let fault = rpc.handle("dst_blacklist.mem_info", &json!([])).unwrap_err();
    assert_eq!(fault.code, 500);
    assert_eq!(fault.message, "dst blacklist support disabled");

    let off = DstBlacklist::init(BlacklistConfig {
        enabled: false,
        ..Default::default()
    })
    .unwrap();
    let fault = BlacklistRpc::new(off)
        .handle("dst_blacklist.view", &json!([]))
        .unwrap_err();
    assert_eq!(fault.code, 500);
}

#[test]
fn test_method_listing() {
    let methods = BlacklistRpc::list_methods();
    assert_eq!(methods.len(), 7);
    assert!(methods.iter().any(|(name, _)| *name == "dst_blacklist.stats_get"));
}
