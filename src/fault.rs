//! Fault-injection hook for exercising cancellation paths.
//!
//! The hook sits before every pause and every concurrent phase body. It
//! never fires unless a site has been armed, and never when injection is
//! disabled in [`GcOptions`](crate::options::GcOptions).

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use log::debug;

use crate::phase::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arming {
    Once,
    Always,
}

/// ```
/// use regiongc::fault::FaultInjector;
/// use regiongc::phase::Phase;
///
/// let faults = FaultInjector::new(true);
/// faults.arm(Phase::ConcEvac);
/// assert!(!faults.should_fail(Phase::ConcMark));
/// assert!(faults.should_fail(Phase::ConcEvac));
/// assert!(!faults.should_fail(Phase::ConcEvac));
/// ```
#[derive(Debug)]
pub struct FaultInjector {
    enabled: bool,
    armed: DashMap<Phase, Arming>,
    fired: AtomicUsize,
}

impl FaultInjector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            armed: DashMap::new(),
            fired: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fail the next time `site` is reached.
    pub fn arm(&self, site: Phase) {
        self.armed.insert(site, Arming::Once);
    }

    /// Fail every time `site` is reached until disarmed.
    pub fn arm_always(&self, site: Phase) {
        self.armed.insert(site, Arming::Always);
    }

    pub fn disarm(&self, site: Phase) {
        self.armed.remove(&site);
    }

    pub fn disarm_all(&self) {
        self.armed.clear();
    }

    pub fn should_fail(&self, site: Phase) -> bool {
        if !self.enabled {
            return false;
        }
        let fire = match self.armed.get(&site).map(|a| *a) {
            None => false,
            Some(Arming::Always) => true,
            Some(Arming::Once) => self.armed.remove(&site).is_some(),
        };
        if fire {
            self.fired.fetch_add(1, Ordering::Relaxed);
            debug!("Injected allocation failure at {}", site.title());
        }
        fire
    }

    pub fn fired(&self) -> usize {
        self.fired.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_injector_never_fires() {
        let faults = FaultInjector::new(false);
        faults.arm_always(Phase::InitMark);
        assert!(!faults.should_fail(Phase::InitMark));
        assert_eq!(faults.fired(), 0);
    }

    #[test]
    fn always_armed_site_fires_until_disarmed() {
        let faults = FaultInjector::new(true);
        faults.arm_always(Phase::ConcMark);
        assert!(faults.should_fail(Phase::ConcMark));
        assert!(faults.should_fail(Phase::ConcMark));
        faults.disarm(Phase::ConcMark);
        assert!(!faults.should_fail(Phase::ConcMark));
        assert_eq!(faults.fired(), 2);
    }
}
