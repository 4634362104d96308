// SPDX-License-Identifier: PMPL-1.0-or-later

//! Lookup table from (domain, fault) to injector constructors.

use super::{diskio, network, FaultDomain, Info, Injector};
use crate::host::Host;
use std::collections::BTreeMap;

pub type Constructor = fn(Info, Host) -> Box<dyn Injector>;

#[derive(Default)]
pub struct Registry {
    constructors: BTreeMap<(FaultDomain, &'static str), Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every fault this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        diskio::register(&mut registry);
        network::register(&mut registry);
        registry
    }

    /// # Panics
    ///
    /// Registering the same (domain, fault) twice is a wiring bug and panics.
    pub fn register(&mut self, domain: FaultDomain, fault: &'static str, constructor: Constructor) {
        if self.constructors.insert((domain, fault), constructor).is_some() {
            panic!("fault {}/{} registered twice", domain, fault);
        }
    }

    pub fn create(
        &self,
        domain: FaultDomain,
        fault: &str,
        info: Info,
        host: Host,
    ) -> Option<Box<dyn Injector>> {
        self.constructors
            .iter()
            .find(|((d, f), _)| *d == domain && *f == fault)
            .map(|(_, constructor)| constructor(info, host))
    }

    pub fn contains(&self, domain: FaultDomain, fault: &str) -> bool {
        self.constructors
            .keys()
            .any(|(d, f)| *d == domain && *f == fault)
    }

    pub fn faults(&self) -> impl Iterator<Item = (FaultDomain, &'static str)> + '_ {
        self.constructors.keys().copied()
    }
}
