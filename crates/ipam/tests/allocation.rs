//! Concurrent allocation against a shared allocator

use ipam::{AllocationStrategy, Ipam, IpamError};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn concurrent_allocations_never_share_an_address() {
    let ipam = Arc::new(Ipam::new());
    ipam.add_or_update_subnet("shared", "10.0.0.0/24", &[], AllocationStrategy::Sequential)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let ipam = Arc::clone(&ipam);
            thread::spawn(move || {
                let mut granted = Vec::new();
                let mut exhausted = 0;
                for i in 0..40 {
                    match ipam.allocate(&format!("w{}-{}", worker, i), "shared", None, None) {
                        Ok(allocation) => granted.push(allocation.ip_string()),
                        Err(IpamError::AddressSpaceExhausted(_)) => exhausted += 1,
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
                (granted, exhausted)
            })
        })
        .collect();

    let mut all = HashSet::new();
    let mut exhausted = 0;
    for handle in handles {
        let (granted, failed) = handle.join().unwrap();
        for ip in granted {
            assert!(all.insert(ip.clone()), "{} allocated twice", ip);
        }
        exhausted += failed;
    }

    // 8 * 40 = 320 requests against 254 usable addresses
    assert_eq!(all.len(), 254);
    assert_eq!(exhausted, 66);
    assert_eq!(ipam.snapshot("shared").unwrap().v4_available, 0);
}

#[test]
fn concurrent_allocate_and_release_keep_counters_consistent() {
    let ipam = Arc::new(Ipam::new());
    ipam.add_or_update_subnet(
        "churn",
        "10.1.0.0/24,fd00:10:1::/120",
        &["10.1.0.1".to_string(), "fd00:10:1::1".to_string()],
        AllocationStrategy::Sequential,
    )
    .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let ipam = Arc::clone(&ipam);
            thread::spawn(move || {
                for round in 0..50 {
                    let owner = format!("w{}-{}", worker, round % 5);
                    let allocation = ipam.allocate(&owner, "churn", None, None).unwrap();
                    assert!(allocation.v4.is_some() && allocation.v6.is_some());
                    if round % 2 == 0 {
                        ipam.release(&owner);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = ipam.snapshot("churn").unwrap();
    assert_eq!(snapshot.v4_using, snapshot.v6_using);
    assert_eq!(snapshot.v4_using + snapshot.v4_available, 253);
    assert_eq!(snapshot.v6_using + snapshot.v6_available, 253);
}
