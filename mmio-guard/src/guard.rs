// Copyright © 2026 The Guest Memory Plane Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use hypercall::{Error, Hypervisor, Result, MMIO_GUARD_HAS_RANGE};

/// Refcount value of a range that must survive until shutdown. Increments
/// and decrements leave it untouched and the hypervisor mapping is never
/// torn down.
const SATURATED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
struct GuardedRange {
    /// Exclusive end of the range.
    end: u64,
    refcount: u64,
}

struct GuardState {
    granule: u64,
    has_range: bool,
    /// Keyed by range start; ranges never overlap.
    ranges: BTreeMap<u64, GuardedRange>,
}

enum Undo {
    Incremented(u64),
    Inserted(u64),
}

/// Refcounted mirror of the hypervisor's MMIO guard.
///
/// Construction probes the hypervisor for the guard granule and enrolls the
/// host. If either step fails, guarding is permanently disabled and every
/// call becomes a successful no-op, matching the behavior of a kernel
/// running under an unenlightened hypervisor.
pub struct MmioGuard {
    hyp: Arc<Hypervisor>,
    enabled: bool,
    state: Mutex<GuardState>,
}

impl MmioGuard {
    pub fn new(hyp: Arc<Hypervisor>) -> Self {
        let mut granule = 0;
        let mut has_range = false;
        let mut enabled = false;

        match hyp.mmio_guard_info() {
            Ok((g, flags)) if g != 0 && g.is_power_of_two() => {
                granule = g;
                has_range = flags & MMIO_GUARD_HAS_RANGE != 0;
                match hyp.mmio_guard_enroll() {
                    Ok(()) => {
                        info!("using MMIO guard, granule {granule:#x}, range calls: {has_range}");
                        enabled = true;
                    }
                    Err(e) => warn!("MMIO guard enrollment failed: {e}"),
                }
            }
            Ok((g, _)) => warn!("MMIO guard initialization failed: bad granule {g:#x}"),
            Err(e) => warn!("MMIO guard info unavailable: {e}"),
        }

        MmioGuard {
            hyp,
            enabled,
            state: Mutex::new(GuardState {
                granule,
                has_range,
                ranges: BTreeMap::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Guard granule learned from the hypervisor; zero when disabled.
    pub fn granule(&self) -> u64 {
        self.state.lock().unwrap().granule
    }

    /// Guard `[phys, phys + size)`, taking a reference on every granule
    /// already guarded and asking the hypervisor to map the rest.
    ///
    /// On hypervisor failure every effect of this call is undone before the
    /// error is returned.
    pub fn register(&self, phys: u64, size: u64) -> Result<()> {
        self.update(phys, size, false)
    }

    /// Like [`register`](Self::register), but the resulting ranges carry a
    /// saturated refcount: they can never be unregistered. Used for windows
    /// guarded before the normal allocation paths are up.
    pub fn register_pinned(&self, phys: u64, size: u64) -> Result<()> {
        self.update(phys, size, true)
    }

    fn update(&self, phys: u64, size: u64, pinned: bool) -> Result<()> {
        if !self.enabled || size == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        let end = Self::checked_range(&state, phys, size)?;

        Self::isolate(&mut state.ranges, phys, end);

        let mut undo: Vec<Undo> = Vec::new();
        let mut cur = phys;
        while cur < end {
            let next = state
                .ranges
                .range(cur..end)
                .next()
                .map(|(s, r)| (*s, r.end));
            match next {
                Some((s, e)) if s == cur => {
                    let r = state.ranges.get_mut(&s).unwrap();
                    if pinned {
                        r.refcount = SATURATED;
                    } else {
                        r.refcount = r.refcount.saturating_add(1);
                        undo.push(Undo::Incremented(s));
                    }
                    cur = e;
                }
                other => {
                    // Gap up to the next guarded range, or to the end.
                    let gap_end = other.map(|(s, _)| s).unwrap_or(end);
                    if let Err(e) = self.map_fresh(&state, cur, gap_end) {
                        error!("failed to register {cur:#x}:{gap_end:#x}");
                        self.rollback(&mut state, undo);
                        Self::merge_around(&mut state.ranges, phys, end);
                        return Err(e);
                    }
                    state.ranges.insert(
                        cur,
                        GuardedRange {
                            end: gap_end,
                            refcount: if pinned { SATURATED } else { 1 },
                        },
                    );
                    undo.push(Undo::Inserted(cur));
                    cur = gap_end;
                }
            }
        }

        Self::merge_around(&mut state.ranges, phys, end);
        Ok(())
    }

    /// Drop a reference on every granule of `[phys, phys + size)`. Granules
    /// whose count reaches zero are unmapped in the hypervisor and erased;
    /// untracked granules are ignored.
    pub fn unregister(&self, phys: u64, size: u64) -> Result<()> {
        if !self.enabled || size == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        let end = Self::checked_range(&state, phys, size)?;

        Self::isolate(&mut state.ranges, phys, end);

        let mut cur = phys;
        while cur < end {
            let next = state
                .ranges
                .range(cur..end)
                .next()
                .map(|(s, r)| (*s, r.end, r.refcount));
            let (s, e, refcount) = match next {
                // Untracked tail, nothing left to drop.
                None => break,
                Some((s, _, _)) if s > cur => {
                    cur = s;
                    continue;
                }
                Some(entry) => entry,
            };

            match refcount {
                0 => {
                    error!("zero refcount on guarded range {s:#x}:{e:#x}");
                    Self::merge_around(&mut state.ranges, phys, end);
                    return Err(Error::Invalid);
                }
                SATURATED => {}
                1 => {
                    let nr = (e - s) / state.granule;
                    let done = self.do_xmap(&state, s, nr, false);
                    if done != nr {
                        error!("failed to unregister {s:#x}:{e:#x}");
                        Self::merge_around(&mut state.ranges, phys, end);
                        return Err(Error::Fault);
                    }
                    state.ranges.remove(&s);
                }
                _ => {
                    state.ranges.get_mut(&s).unwrap().refcount = refcount - 1;
                }
            }
            cur = e;
        }

        Self::merge_around(&mut state.ranges, phys, end);
        Ok(())
    }

    /// The guarded ranges as `(start, end, refcount)` triples, ascending.
    pub fn snapshot(&self) -> Vec<(u64, u64, u64)> {
        self.state
            .lock()
            .unwrap()
            .ranges
            .iter()
            .map(|(s, r)| (*s, r.end, r.refcount))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().ranges.is_empty()
    }

    fn checked_range(state: &GuardState, phys: u64, size: u64) -> Result<u64> {
        if phys % state.granule != 0 || size % state.granule != 0 {
            return Err(Error::Range);
        }
        phys.checked_add(size).ok_or(Error::Range)
    }

    /// Map all granules of a fresh gap, undoing the mapped prefix if the
    /// hypervisor gives up partway.
    fn map_fresh(&self, state: &GuardState, start: u64, end: u64) -> Result<()> {
        let nr = (end - start) / state.granule;
        let done = self.do_xmap(state, start, nr, true);
        if done != nr {
            self.do_xmap(state, start, done, false);
            return Err(Error::Fault);
        }
        Ok(())
    }

    /// Issue map or unmap calls until `nr` granules are processed or the
    /// hypervisor errors out. The range variant may do several granules per
    /// call and reports how many; the legacy variant does one.
    fn do_xmap(&self, state: &GuardState, start: u64, nr: u64, map: bool) -> u64 {
        let mut done = 0;
        let mut cur = start;
        while done < nr {
            let remaining = nr - done;
            let res = match (state.has_range, map) {
                (true, true) => self.hyp.mmio_rguard_map(cur, remaining),
                (true, false) => self.hyp.mmio_rguard_unmap(cur, remaining),
                (false, true) => self.hyp.mmio_guard_map(cur),
                (false, false) => self.hyp.mmio_guard_unmap(cur),
            };
            let step = match res {
                Ok(n) if n != 0 && n <= remaining => n,
                Ok(n) => {
                    error!("hypervisor processed {n} of {remaining} guard granules");
                    break;
                }
                Err(_) => break,
            };
            done += step;
            cur += step * state.granule;
        }
        done
    }

    fn rollback(&self, state: &mut GuardState, undo: Vec<Undo>) {
        for op in undo.into_iter().rev() {
            match op {
                Undo::Incremented(s) => {
                    let r = state.ranges.get_mut(&s).unwrap();
                    if r.refcount != SATURATED {
                        r.refcount -= 1;
                    }
                }
                Undo::Inserted(s) => {
                    let r = state.ranges.remove(&s).unwrap();
                    let nr = (r.end - s) / state.granule;
                    self.do_xmap(state, s, nr, false);
                }
            }
        }
    }

    /// Split any range straddling `lo` or `hi` so that every range either
    /// lies fully inside `[lo, hi)` or fully outside it.
    fn isolate(ranges: &mut BTreeMap<u64, GuardedRange>, lo: u64, hi: u64) {
        for boundary in [lo, hi] {
            let covering = ranges
                .range(..boundary)
                .next_back()
                .filter(|(_, r)| r.end > boundary)
                .map(|(s, r)| (*s, *r));
            if let Some((s, r)) = covering {
                ranges.get_mut(&s).unwrap().end = boundary;
                ranges.insert(
                    boundary,
                    GuardedRange {
                        end: r.end,
                        refcount: r.refcount,
                    },
                );
            }
        }
    }

    /// Coalesce contiguous neighbours with equal refcounts in the window
    /// touched by an update.
    fn merge_around(ranges: &mut BTreeMap<u64, GuardedRange>, lo: u64, hi: u64) {
        let mut cur = ranges
            .range(..=lo)
            .next_back()
            .map(|(s, _)| *s)
            .unwrap_or(lo);
        loop {
            let entry = ranges.range(cur..).next().map(|(s, r)| (*s, *r));
            let (s, r) = match entry {
                Some(e) if e.0 <= hi => e,
                _ => break,
            };
            let neighbour = ranges
                .range(r.end..)
                .next()
                .filter(|(ns, nr)| **ns == r.end && nr.refcount == r.refcount)
                .map(|(ns, nr)| (*ns, nr.end));
            if let Some((ns, nend)) = neighbour {
                ranges.remove(&ns);
                ranges.get_mut(&s).unwrap().end = nend;
                // Retry the grown range against its new neighbour.
                cur = s;
            } else {
                cur = r.end;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypercall::{HypercallOp, HypercallRet, HypercallTransport};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    const GRANULE: u64 = 0x1000;

    /// Hypervisor model: tracks the set of guarded granules, optionally
    /// speaks the range protocol with a per-call chunk limit, optionally
    /// fails once a given number of granules is guarded.
    struct GuardModel {
        granule: u64,
        has_range: bool,
        enroll_status: i64,
        max_chunk: u64,
        fail_after: Option<usize>,
        guarded: Mutex<HashSet<u64>>,
        map_calls: AtomicU64,
        unmap_calls: AtomicU64,
    }

    impl GuardModel {
        fn new(has_range: bool) -> Self {
            GuardModel {
                granule: GRANULE,
                has_range,
                enroll_status: 0,
                max_chunk: u64::MAX,
                fail_after: None,
                guarded: Mutex::new(HashSet::new()),
                map_calls: AtomicU64::new(0),
                unmap_calls: AtomicU64::new(0),
            }
        }

        fn map_granules(&self, phys: u64, nr: u64) -> HypercallRet {
            self.map_calls.fetch_add(1, Ordering::SeqCst);
            let mut guarded = self.guarded.lock().unwrap();
            let nr = nr.min(self.max_chunk);
            let mut done = 0;
            for i in 0..nr {
                if let Some(limit) = self.fail_after {
                    if guarded.len() >= limit {
                        // Partial progress still counts.
                        return if done == 0 {
                            HypercallRet::error(-5)
                        } else {
                            HypercallRet::ok(done, 0, 0)
                        };
                    }
                }
                assert!(
                    guarded.insert(phys + i * self.granule),
                    "granule double-guarded"
                );
                done += 1;
            }
            HypercallRet::ok(done, 0, 0)
        }

        fn unmap_granules(&self, phys: u64, nr: u64) -> HypercallRet {
            self.unmap_calls.fetch_add(1, Ordering::SeqCst);
            let mut guarded = self.guarded.lock().unwrap();
            let nr = nr.min(self.max_chunk);
            for i in 0..nr {
                assert!(
                    guarded.remove(&(phys + i * self.granule)),
                    "unmap of unguarded granule"
                );
            }
            HypercallRet::ok(nr, 0, 0)
        }
    }

    impl HypercallTransport for GuardModel {
        fn hypcall(&self, op: HypercallOp, args: [u64; 8]) -> HypercallRet {
            let flags = if self.has_range {
                MMIO_GUARD_HAS_RANGE
            } else {
                0
            };
            match op {
                HypercallOp::Probe => HypercallRet::ok(0, 0, 0),
                HypercallOp::MmioGuardInfo => HypercallRet::ok(self.granule, flags, 0),
                HypercallOp::MmioGuardEnroll => HypercallRet::error(self.enroll_status),
                HypercallOp::MmioGuardMap => self.map_granules(args[0], 1),
                HypercallOp::MmioGuardUnmap => self.unmap_granules(args[0], 1),
                HypercallOp::MmioRguardMap => self.map_granules(args[0], args[1]),
                HypercallOp::MmioRguardUnmap => self.unmap_granules(args[0], args[1]),
                _ => HypercallRet::error(-8),
            }
        }
    }

    fn guard_with(model: Arc<GuardModel>) -> MmioGuard {
        let hyp = Arc::new(Hypervisor::new(model));
        hyp.probe().unwrap();
        MmioGuard::new(hyp)
    }

    #[test]
    fn enroll_failure_disables_guarding() {
        let mut model = GuardModel::new(false);
        model.enroll_status = -24;
        let model = Arc::new(model);
        let guard = guard_with(model.clone());

        assert!(!guard.is_enabled());
        // Every call is a tolerated no-op.
        guard.register(0xf000_0000, 0x2000).unwrap();
        guard.unregister(0xf000_0000, 0x2000).unwrap();
        assert!(model.guarded.lock().unwrap().is_empty());
    }

    #[test]
    fn bad_granule_disables_guarding() {
        let mut model = GuardModel::new(false);
        model.granule = 0x1800;
        let guard = guard_with(Arc::new(model));
        assert!(!guard.is_enabled());
    }

    #[test]
    fn misaligned_range_rejected() {
        let guard = guard_with(Arc::new(GuardModel::new(false)));
        assert_eq!(guard.register(0xf000_0800, 0x1000), Err(Error::Range));
        assert_eq!(guard.register(0xf000_0000, 0x1800), Err(Error::Range));
        assert_eq!(guard.unregister(0xf000_0800, 0x1000), Err(Error::Range));
        assert!(guard.is_empty());
    }

    #[test]
    fn overlapping_registrations_share_granules() {
        let model = Arc::new(GuardModel::new(false));
        let guard = guard_with(model.clone());

        guard.register(0xf000_0000, 0x2000).unwrap();
        assert_eq!(guard.snapshot(), vec![(0xf000_0000, 0xf000_2000, 1)]);

        guard.register(0xf000_1000, 0x2000).unwrap();
        assert_eq!(
            guard.snapshot(),
            vec![
                (0xf000_0000, 0xf000_1000, 1),
                (0xf000_1000, 0xf000_2000, 2),
                (0xf000_2000, 0xf000_3000, 1),
            ]
        );
        // The shared granule was only mapped once.
        assert_eq!(model.guarded.lock().unwrap().len(), 3);

        guard.unregister(0xf000_0000, 0x3000).unwrap();
        assert_eq!(
            guard.snapshot(),
            vec![(0xf000_1000, 0xf000_2000, 1)]
        );

        guard.unregister(0xf000_1000, 0x1000).unwrap();
        assert!(guard.is_empty());
        assert!(model.guarded.lock().unwrap().is_empty());
    }

    #[test]
    fn balanced_registers_empty_the_map() {
        let model = Arc::new(GuardModel::new(true));
        let guard = guard_with(model.clone());

        let spans = [
            (0xa000_0000, 0x4000),
            (0xa000_2000, 0x4000),
            (0xa000_0000, 0x1000),
            (0xa000_5000, 0x1000),
        ];
        for (p, s) in spans {
            guard.register(p, s).unwrap();
        }
        for (p, s) in spans {
            guard.unregister(p, s).unwrap();
        }
        assert!(guard.is_empty());
        assert!(model.guarded.lock().unwrap().is_empty());
    }

    #[test]
    fn adjacent_equal_ranges_merge() {
        let guard = guard_with(Arc::new(GuardModel::new(false)));
        guard.register(0xb000_0000, 0x1000).unwrap();
        guard.register(0xb000_1000, 0x1000).unwrap();
        assert_eq!(guard.snapshot(), vec![(0xb000_0000, 0xb000_2000, 1)]);
    }

    #[test]
    fn partial_map_failure_rolls_back() {
        let mut model = GuardModel::new(false);
        model.fail_after = Some(2);
        let model = Arc::new(model);
        let guard = guard_with(model.clone());

        assert_eq!(guard.register(0xc000_0000, 0x4000), Err(Error::Fault));
        assert!(guard.is_empty());
        assert!(model.guarded.lock().unwrap().is_empty());
    }

    #[test]
    fn failure_after_overlap_undoes_increments() {
        let mut model = GuardModel::new(false);
        model.fail_after = Some(3);
        let model = Arc::new(model);
        let guard = guard_with(model.clone());

        guard.register(0xd000_0000, 0x3000).unwrap();
        // Overlaps the three guarded granules then needs a fourth, which
        // the hypervisor refuses.
        assert_eq!(guard.register(0xd000_1000, 0x3000), Err(Error::Fault));
        assert_eq!(guard.snapshot(), vec![(0xd000_0000, 0xd000_3000, 1)]);
        assert_eq!(model.guarded.lock().unwrap().len(), 3);
    }

    #[test]
    fn range_calls_retry_for_the_remainder() {
        let mut model = GuardModel::new(true);
        model.max_chunk = 2;
        let model = Arc::new(model);
        let guard = guard_with(model.clone());

        guard.register(0xe000_0000, 0x8000).unwrap();
        assert_eq!(model.guarded.lock().unwrap().len(), 8);
        // 8 granules at up to 2 per call.
        assert_eq!(model.map_calls.load(Ordering::SeqCst), 4);

        guard.unregister(0xe000_0000, 0x8000).unwrap();
        assert!(guard.is_empty());
        assert_eq!(model.unmap_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn pinned_ranges_survive_unregister() {
        let model = Arc::new(GuardModel::new(false));
        let guard = guard_with(model.clone());

        guard.register_pinned(0x9000_0000, 0x1000).unwrap();
        guard.unregister(0x9000_0000, 0x1000).unwrap();
        assert_eq!(guard.snapshot(), vec![(0x9000_0000, 0x9000_1000, SATURATED)]);
        assert_eq!(model.guarded.lock().unwrap().len(), 1);
    }

    #[test]
    fn unregister_of_untracked_range_is_ignored() {
        let guard = guard_with(Arc::new(GuardModel::new(false)));
        guard.unregister(0x8000_0000, 0x2000).unwrap();
        assert!(guard.is_empty());
    }
}
