// SPDX-License-Identifier: PMPL-1.0-or-later

//! Tests for fault registration and construction

use chaos_agent::injector::{FaultDomain, Info, Registry};
use chaos_agent::testing::{memory_host, MemoryProcesses, MemoryTc};
use std::sync::Arc;

fn host() -> chaos_agent::host::Host {
    memory_host(
        Arc::new(MemoryProcesses::new()),
        Arc::new(MemoryTc::with_interfaces(&["lo"])),
    )
}

#[test]
fn test_builtin_registry_lists_both_faults() {
    let registry = Registry::builtin();
    let faults: Vec<_> = registry.faults().collect();
    assert_eq!(
        faults,
        vec![(FaultDomain::Diskio, "burn"), (FaultDomain::Network, "delay")]
    );
    assert!(registry.contains(FaultDomain::Network, "delay"));
    assert!(!registry.contains(FaultDomain::Network, "loss"));
}

#[test]
fn test_create_returns_fresh_zero_valued_instances() {
    let registry = Registry::builtin();
    let a = registry
        .create(FaultDomain::Network, "delay", Info::new("a"), host())
        .unwrap();
    let b = registry
        .create(FaultDomain::Network, "delay", Info::new("b"), host())
        .unwrap();

    assert_eq!(a.domain(), FaultDomain::Network);
    assert_eq!(a.fault(), "delay");
    assert_eq!(a.info().uid, "a");
    assert_eq!(b.info().uid, "b");
    assert_eq!(a.args()["interface"], "");
    assert_eq!(a.args()["latency"], "");
    assert!(!a.base().is_recovered());
}

#[test]
fn test_unknown_fault_is_not_constructed() {
    let registry = Registry::builtin();
    assert!(registry
        .create(FaultDomain::Diskio, "fill", Info::new("x"), host())
        .is_none());
    assert!(Registry::new()
        .create(FaultDomain::Diskio, "burn", Info::new("x"), host())
        .is_none());
}

#[test]
#[should_panic(expected = "registered twice")]
fn test_duplicate_registration_panics() {
    let mut registry = Registry::builtin();
    chaos_agent::injector::diskio::register(&mut registry);
}

#[test]
fn test_malformed_args_are_rejected() {
    let mut injector = Registry::builtin()
        .create(FaultDomain::Diskio, "burn", Info::new("x"), host())
        .unwrap();
    let err = injector
        .load_args(serde_json::json!({ "mode": 7 }))
        .unwrap_err();
    assert!(err.to_string().starts_with("invalid fault args"));
}
