//! The set of live circuits: a cycling pool eligible for random selection,
//! and a named registry addressable only by name.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::warn;

use crate::circuit::Circuit;
use crate::{Error, Result};

/// The live circuits known to a manager.
#[derive(Default)]
pub(crate) struct CircuitPool {
    /// Circuits eligible for random selection.
    cycling: Vec<Arc<Circuit>>,
    /// Circuits reachable only by name.
    named: HashMap<String, Arc<Circuit>>,
}

impl CircuitPool {
    /// Fail with [`Error::DuplicateCircuit`] if `circuit`'s identifier is
    /// already present in either collection.
    pub(crate) fn check_unique(&self, circuit: &Circuit) -> Result<()> {
        let id = circuit.proxy_id();
        let clash = self
            .cycling
            .iter()
            .chain(self.named.values())
            .any(|c| c.proxy_id() == id);
        if clash {
            return Err(Error::DuplicateCircuit(circuit.display_id()));
        }
        if let Some(name) = circuit.name() {
            if self.by_name(name).is_some() {
                return Err(Error::DuplicateCircuit(circuit.display_id()));
            }
        }
        Ok(())
    }

    /// Insert a circuit into the collection its flags select.
    ///
    /// Non-cycling circuits must be named; they would otherwise be
    /// unreachable.
    pub(crate) fn add(&mut self, circuit: Arc<Circuit>) -> Result<()> {
        self.check_unique(&circuit)?;
        if circuit.in_cycling_pool() {
            self.cycling.push(circuit);
        } else {
            match circuit.name() {
                Some(name) => {
                    self.named.insert(name.to_owned(), circuit);
                }
                None => return Err(Error::UnnamedRigidCircuit),
            }
        }
        Ok(())
    }

    /// Mark `circuit` invalid and drop it from whichever collection holds
    /// it.  Removal mirrors the add path: cycling circuits leave the
    /// cycling pool, named-only circuits leave the registry.
    pub(crate) fn remove(&mut self, circuit: &Arc<Circuit>) {
        circuit.invalidate();
        if circuit.in_cycling_pool() {
            self.cycling.retain(|c| !Arc::ptr_eq(c, circuit));
        } else if let Some(name) = circuit.name() {
            self.named.remove(name);
        }
    }

    /// Choose a circuit uniformly at random from the cycling pool.
    ///
    /// With `skip_unhealthy`, only healthy circuits are candidates; the
    /// `exclude` circuit is avoided when any alternative exists.  Pools of
    /// one (or zero) entries short-circuit: there is nothing to choose
    /// between, so the sole entry (or nothing) comes back regardless of
    /// exclusion or health.
    pub(crate) fn select_random(
        &self,
        exclude: Option<&Arc<Circuit>>,
        skip_unhealthy: bool,
    ) -> Result<Option<Arc<Circuit>>> {
        if self.cycling.len() <= 1 {
            warn!(
                "cycling pool has {} circuit(s); selection is degenerate",
                self.cycling.len()
            );
            return Ok(self.cycling.first().map(Arc::clone));
        }
        if skip_unhealthy && !self.cycling.iter().any(|c| c.healthy()) {
            return Err(Error::AllCircuitsUnhealthy);
        }
        let candidates: Vec<&Arc<Circuit>> = self
            .cycling
            .iter()
            .filter(|c| exclude.map_or(true, |e| !Arc::ptr_eq(c, e)))
            .filter(|c| !skip_unhealthy || c.healthy())
            .collect();
        if candidates.is_empty() {
            // The only healthy circuit is the excluded one.  Staying put
            // beats moving to a known-bad circuit.
            warn!("every other cycling circuit is unhealthy; staying on the current one");
            return Ok(exclude.map(Arc::clone));
        }
        Ok(candidates
            .choose(&mut rand::thread_rng())
            .map(|c| Arc::clone(c)))
    }

    /// Exact lookup by name, across both collections.
    pub(crate) fn by_name(&self, name: &str) -> Option<Arc<Circuit>> {
        if let Some(c) = self.named.get(name) {
            return Some(Arc::clone(c));
        }
        self.cycling
            .iter()
            .find(|c| c.name() == Some(name))
            .map(Arc::clone)
    }

    /// Index into the cycling pool.
    pub(crate) fn by_index(&self, index: usize) -> Option<Arc<Circuit>> {
        self.cycling.get(index).map(Arc::clone)
    }

    /// Every circuit routed through the local daemon.
    pub(crate) fn local_daemon_circuits(&self) -> Vec<Arc<Circuit>> {
        self.cycling
            .iter()
            .chain(self.named.values())
            .filter(|c| c.is_local_daemon())
            .map(Arc::clone)
            .collect()
    }

    /// The set of exit IPs some live circuit currently presents; the rate
    /// store must not compact these away.
    pub(crate) fn active_ips(&self) -> HashSet<String> {
        self.cycling
            .iter()
            .chain(self.named.values())
            .filter_map(|c| c.exit_ip())
            .collect()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::CircuitConfigBuilder;

    fn mk(port: u16) -> Arc<Circuit> {
        Arc::new(Circuit::new(
            CircuitConfigBuilder::default().port(port).build().unwrap(),
        ))
    }

    fn mk_named(port: u16, name: &str, cycling: bool) -> Arc<Circuit> {
        Arc::new(Circuit::new(
            CircuitConfigBuilder::default()
                .port(port)
                .name(Some(name.to_owned()))
                .in_cycling_pool(cycling)
                .build()
                .unwrap(),
        ))
    }

    #[test]
    fn duplicate_identifier_is_rejected() {
        let mut pool = CircuitPool::default();
        pool.add(mk(9050)).unwrap();
        assert!(matches!(
            pool.add(mk(9050)),
            Err(Error::DuplicateCircuit(_))
        ));
        pool.add(mk(9051)).unwrap();
    }

    #[test]
    fn nameless_rigid_is_rejected() {
        let mut pool = CircuitPool::default();
        let rigid = Arc::new(Circuit::new(
            CircuitConfigBuilder::default()
                .in_cycling_pool(false)
                .build()
                .unwrap(),
        ));
        assert!(matches!(pool.add(rigid), Err(Error::UnnamedRigidCircuit)));
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let pool = CircuitPool::default();
        assert!(pool.select_random(None, true).unwrap().is_none());
    }

    #[test]
    fn pool_of_one_returns_sole_entry_even_excluded() {
        let mut pool = CircuitPool::default();
        let only = mk(9050);
        pool.add(Arc::clone(&only)).unwrap();
        let got = pool.select_random(Some(&only), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &only));
    }

    #[test]
    fn exclusion_is_honored() {
        let mut pool = CircuitPool::default();
        let a = mk(9050);
        let b = mk(9051);
        pool.add(Arc::clone(&a)).unwrap();
        pool.add(Arc::clone(&b)).unwrap();
        for _ in 0..20 {
            let got = pool.select_random(Some(&a), true).unwrap().unwrap();
            assert!(Arc::ptr_eq(&got, &b));
        }
    }

    #[test]
    fn unhealthy_circuits_are_skipped() {
        let mut pool = CircuitPool::default();
        let a = mk(9050);
        let b = mk(9051);
        let c = mk(9052);
        b.punish_health(90);
        pool.add(Arc::clone(&a)).unwrap();
        pool.add(Arc::clone(&b)).unwrap();
        pool.add(Arc::clone(&c)).unwrap();
        for _ in 0..20 {
            let got = pool.select_random(None, true).unwrap().unwrap();
            assert!(!Arc::ptr_eq(&got, &b));
        }
    }

    #[test]
    fn all_unhealthy_is_an_error() {
        let mut pool = CircuitPool::default();
        let a = mk(9050);
        let b = mk(9051);
        a.punish_health(100);
        b.punish_health(100);
        pool.add(a).unwrap();
        pool.add(b).unwrap();
        assert!(matches!(
            pool.select_random(None, true),
            Err(Error::AllCircuitsUnhealthy)
        ));
    }

    #[test]
    fn healthy_exclude_beats_unhealthy_rest() {
        let mut pool = CircuitPool::default();
        let a = mk(9050);
        let b = mk(9051);
        let c = mk(9052);
        b.punish_health(100);
        c.punish_health(100);
        pool.add(Arc::clone(&a)).unwrap();
        pool.add(b).unwrap();
        pool.add(c).unwrap();
        let got = pool.select_random(Some(&a), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&got, &a));
    }

    #[test]
    fn by_name_searches_both_collections() {
        let mut pool = CircuitPool::default();
        pool.add(mk_named(9050, "cyc", true)).unwrap();
        pool.add(mk_named(9051, "rigid", false)).unwrap();
        assert!(pool.by_name("cyc").is_some());
        assert!(pool.by_name("rigid").is_some());
        assert!(pool.by_name("nope").is_none());
    }

    #[test]
    fn remove_invalidates_and_drops() {
        let mut pool = CircuitPool::default();
        let a = mk(9050);
        let r = mk_named(9051, "r", false);
        pool.add(Arc::clone(&a)).unwrap();
        pool.add(Arc::clone(&r)).unwrap();
        pool.remove(&a);
        pool.remove(&r);
        assert!(!a.is_valid());
        assert!(!r.is_valid());
        assert!(pool.by_name("r").is_none());
        assert!(pool.select_random(None, true).unwrap().is_none());
    }
}
