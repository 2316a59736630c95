//! Per-site position allocation.
//!
//! Each editing site owns one [`PositionAllocator`]. Stamps it hands out are
//! unique forever (the counter strictly increases) and comparable with every
//! other site's stamps without coordination (the site id breaks clock ties).

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CoreError;
use crate::position::{Position, Side, SiteId, Stamp};

/// Source of clock readings for stamps.
pub trait SiteClock: Send + Sync {
    fn now(&self) -> u64;
}

/// Unix time in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl SiteClock for WallClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A clock that never moves. Used to force "simultaneous" allocations.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClock(pub u64);

impl SiteClock for FixedClock {
    fn now(&self) -> u64 {
        self.0
    }
}

/// Issues stamps and positions for one site.
pub struct PositionAllocator {
    site: SiteId,
    clock: Box<dyn SiteClock>,
    /// Highest clock value used or observed; stamps never go below it.
    last_clock: u64,
    counter: u64,
}

impl PositionAllocator {
    /// Allocator backed by the wall clock.
    pub fn new(site: SiteId) -> Self {
        Self::with_clock(site, WallClock)
    }

    pub fn with_clock(site: SiteId, clock: impl SiteClock + 'static) -> Self {
        Self {
            site,
            clock: Box::new(clock),
            last_clock: 0,
            counter: 0,
        }
    }

    /// Continue a site that already issued `issued` stamps (a client that
    /// reconnects with its old site id).
    pub fn resume(mut self, issued: u64) -> Self {
        self.counter = issued;
        self
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    /// Number of stamps issued so far.
    pub fn issued(&self) -> u64 {
        self.counter
    }

    /// Issue the next stamp.
    ///
    /// Counter overflow is an [`CoreError::InvariantViolation`]: uniqueness
    /// can no longer be guaranteed for this site.
    pub fn allocate(&mut self) -> Result<Stamp, CoreError> {
        let counter = self.counter.checked_add(1).ok_or_else(|| {
            CoreError::InvariantViolation(format!("stamp counter overflow on site {}", self.site))
        })?;
        self.counter = counter;
        self.last_clock = self.last_clock.max(self.clock.now());
        Ok(Stamp::new(self.last_clock, self.site, counter))
    }

    /// Lift the local clock to the highest clock seen in a remote position.
    pub fn observe(&mut self, position: &Position) {
        self.last_clock = self.last_clock.max(position.max_clock());
    }

    /// Strict total order over positions.
    pub fn compare(a: &Position, b: &Position) -> Ordering {
        a.cmp(b)
    }

    /// A fresh position ordered after `prev` and before `next`.
    ///
    /// `next` must be the immediate successor of `prev` in the caller's
    /// document (or `None` when `prev` is last); `prev` is `None` when
    /// inserting before the first entry.
    pub fn between(
        &mut self,
        prev: Option<&Position>,
        next: Option<&Position>,
    ) -> Result<Position, CoreError> {
        let stamp = self.allocate()?;

        let position = match (prev, next) {
            (None, None) => Position::root(Side::Right, stamp),
            (None, Some(next)) => next.child(Side::Left, stamp),
            (Some(prev), Some(next)) if prev.is_ancestor_of(next) => {
                next.child(Side::Left, stamp)
            }
            (Some(prev), next) => prev
                .sibling_after(stamp)
                .filter(|candidate| next.map_or(true, |n| candidate < n))
                .unwrap_or_else(|| prev.child(Side::Right, stamp)),
        };

        Ok(position)
    }
}

impl std::fmt::Debug for PositionAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionAllocator")
            .field("site", &self.site)
            .field("last_clock", &self.last_clock)
            .field("counter", &self.counter)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    #[test]
    fn test_counter_strictly_increases() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(10));
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!(a.counter, 1);
        assert_eq!(b.counter, 2);
        assert!(a < b);
        assert_eq!(alloc.issued(), 2);
    }

    #[test]
    fn test_clock_never_goes_backwards() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(5));
        let remote = Position::root(Side::Right, Stamp::new(500, site(2), 1));
        alloc.observe(&remote);

        let stamp = alloc.allocate().unwrap();
        assert_eq!(stamp.clock, 500);
    }

    #[test]
    fn test_simultaneous_sites_never_collide() {
        let mut a = PositionAllocator::with_clock(site(1), FixedClock(7));
        let mut b = PositionAllocator::with_clock(site(2), FixedClock(7));

        let sa = a.allocate().unwrap();
        let sb = b.allocate().unwrap();
        assert_ne!(sa, sb);
        assert_eq!(sa.cmp(&sb), Ordering::Less);
    }

    #[test]
    fn test_counter_overflow_is_invariant_violation() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(0)).resume(u64::MAX);
        let err = alloc.allocate().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(alloc.issued(), u64::MAX);
    }

    #[test]
    fn test_resume_continues_counter() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(3)).resume(41);
        assert_eq!(alloc.allocate().unwrap().counter, 42);
    }

    #[test]
    fn test_between_empty() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(1));
        let p = alloc.between(None, None).unwrap();
        assert_eq!(p.depth(), 1);
        assert_eq!(p.last().side, Side::Right);
    }

    #[test]
    fn test_between_before_first() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(1));
        let first = alloc.between(None, None).unwrap();
        let front = alloc.between(None, Some(&first)).unwrap();
        assert!(front < first);
    }

    #[test]
    fn test_sequential_appends_stay_flat() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(1));
        let mut prev = alloc.between(None, None).unwrap();
        for _ in 0..100 {
            let next = alloc.between(Some(&prev), None).unwrap();
            assert!(prev < next);
            assert_eq!(next.depth(), 1);
            prev = next;
        }
    }

    #[test]
    fn test_between_neighbours_nests_when_sibling_overshoots() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(1));
        let a = alloc.between(None, None).unwrap();
        let c = alloc.between(Some(&a), None).unwrap();

        // Any sibling of `a` would carry a stamp above `c`'s and land after it.
        let b = alloc.between(Some(&a), Some(&c)).unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(a.is_ancestor_of(&b));
    }

    #[test]
    fn test_between_when_next_is_descendant() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(1));
        let a = alloc.between(None, None).unwrap();
        let inner = a.child(Side::Right, alloc.allocate().unwrap());

        let x = alloc.between(Some(&a), Some(&inner)).unwrap();
        assert!(a < x);
        assert!(x < inner);
        assert!(inner.is_ancestor_of(&x));
    }

    #[test]
    fn test_compare_matches_ord() {
        let mut alloc = PositionAllocator::with_clock(site(1), FixedClock(1));
        let a = alloc.between(None, None).unwrap();
        let b = alloc.between(Some(&a), None).unwrap();
        assert_eq!(PositionAllocator::compare(&a, &b), Ordering::Less);
        assert_eq!(PositionAllocator::compare(&b, &a), Ordering::Greater);
        assert_eq!(PositionAllocator::compare(&a, &a), Ordering::Equal);
    }
}
