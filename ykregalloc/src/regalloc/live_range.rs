//! Live ranges: the intervals during which a value is live, the points where it is used, and the
//! way both are split up as allocation proceeds.
//!
//! Everything is stored in one arena, [LiveRanges], and linked together with indices. A
//! [TopLevelLiveRange] describes one virtual register (or one fixed physical register, or one
//! splinter). Its first [LiveRange] (its "head") initially holds all of the value's
//! [UseInterval]s and [UsePosition]s; splitting moves a suffix of both into a new child range,
//! linked from its predecessor via [LiveRange::next]. Children are thus always in start order.

use super::{data::PhiMapValue, position::LifetimePosition};
use crate::sequence::{
    InstrIdx, OperandSlot, RegCode, RegisterKind, Representation, UnallocatedOperand,
};
use index_vec::IndexVec;
use std::{cell::Cell, iter};

index_vec::define_index_type! {
    pub(crate) struct LiveRangeIdx = u32;
}

index_vec::define_index_type! {
    pub(crate) struct TopLevelIdx = u32;
}

index_vec::define_index_type! {
    pub(crate) struct UseIntervalIdx = u32;
}

index_vec::define_index_type! {
    pub(crate) struct UsePositionIdx = u32;
}

index_vec::define_index_type! {
    pub(crate) struct SpillRangeIdx = u32;
}

index_vec::define_index_type! {
    pub(crate) struct PhiIdx = u32;
}

/// A half-open interval `[start, end)` during which a value is live.
#[derive(Clone, Debug)]
pub(crate) struct UseInterval {
    pub(crate) start: LifetimePosition,
    pub(crate) end: LifetimePosition,
    pub(crate) next: Option<UseIntervalIdx>,
}

impl UseInterval {
    fn new(start: LifetimePosition, end: LifetimePosition) -> Self {
        debug_assert!(start < end);
        Self {
            start,
            end,
            next: None,
        }
    }

    pub(crate) fn contains(&self, pos: LifetimePosition) -> bool {
        self.start <= pos && pos < self.end
    }

    /// If `self` and `other` overlap, return the first position they share.
    pub(crate) fn intersect(&self, other: &UseInterval) -> Option<LifetimePosition> {
        if other.start < self.start {
            return other.intersect(self);
        }
        if other.start < self.end {
            return Some(other.start);
        }
        None
    }

    /// The index of the first instruction whose gap this interval covers.
    pub(crate) fn first_gap_index(&self) -> InstrIdx {
        let i = self.start.to_instruction_index();
        if self.start.is_instruction_position() {
            InstrIdx::new(i.index() + 1)
        } else {
            i
        }
    }

    /// The index of the last instruction whose gap this interval covers.
    pub(crate) fn last_gap_index(&self) -> InstrIdx {
        let i = self.end.to_instruction_index();
        if self.end.is_gap_position() && self.end.is_start() && i.index() > 0 {
            InstrIdx::new(i.index() - 1)
        } else {
            i
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum UsePositionType {
    Any,
    RequiresRegister,
    RequiresSlot,
}

/// Where a use position might find out which register it would like to be in.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum UsePositionHint {
    None,
    /// The hint is a virtual register whose use position has not been created yet.
    Unresolved,
    /// A fixed register operand.
    Operand(crate::sequence::InstructionOperand),
    /// Whatever register another use position ends up being assigned.
    UsePos(UsePositionIdx),
    /// Whatever register a phi ends up being assigned.
    Phi(PhiIdx),
}

impl UsePositionHint {
    /// The kind of hint a move to or from `op` provides.
    pub(crate) fn for_operand(op: &crate::sequence::InstructionOperand) -> Self {
        use crate::sequence::InstructionOperand;
        match op {
            InstructionOperand::Unallocated(_) => UsePositionHint::Unresolved,
            InstructionOperand::Register { .. } => UsePositionHint::Operand(*op),
            _ => UsePositionHint::None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct UsePosition {
    pub(crate) pos: LifetimePosition,
    /// The operand this use will be rewritten into. Some uses (e.g. the implicit use at the end of
    /// a definition without any other uses) have no operand.
    pub(crate) operand: Option<OperandSlot>,
    pub(crate) hint: UsePositionHint,
    pub(crate) next: Option<UsePositionIdx>,
    pub(crate) ty: UsePositionType,
    pub(crate) register_beneficial: bool,
    /// The register the range holding this use was assigned, used as a hint by other ranges.
    pub(crate) assigned_register: Option<RegCode>,
}

impl UsePosition {
    fn new(
        pos: LifetimePosition,
        operand: Option<(OperandSlot, &UnallocatedOperand)>,
        hint: UsePositionHint,
    ) -> Self {
        let (ty, register_beneficial) = match operand {
            Some((_, u)) if u.has_register_policy() => (UsePositionType::RequiresRegister, true),
            Some((_, u)) if u.has_slot_policy() => (UsePositionType::RequiresSlot, false),
            Some((_, u)) => (UsePositionType::Any, !u.has_any_policy()),
            None => (UsePositionType::Any, true),
        };
        Self {
            pos,
            operand: operand.map(|(slot, _)| slot),
            hint,
            next: None,
            ty,
            register_beneficial,
            assigned_register: None,
        }
    }

    /// Does this use have a hint that may, now or later, name a register?
    pub(crate) fn has_hint(&self) -> bool {
        !matches!(
            self.hint,
            UsePositionHint::None | UsePositionHint::Unresolved
        )
    }

    /// Replace an unresolved hint with `other`.
    pub(crate) fn resolve_hint(&mut self, other: UsePositionIdx) {
        if self.hint == UsePositionHint::Unresolved {
            self.hint = UsePositionHint::UsePos(other);
        }
    }

    pub(crate) fn set_type(&mut self, ty: UsePositionType, register_beneficial: bool) {
        self.ty = ty;
        self.register_beneficial = register_beneficial;
    }
}

/// Where a top-level range lives when it is spilled.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum SpillLocation {
    None,
    /// The value already has a home: a constant or a fixed stack slot.
    Operand(crate::sequence::InstructionOperand),
    /// The value will be given a slot by the spill range.
    Range(SpillRangeIdx),
}

/// One piece of a value's lifetime, allocated as a unit.
#[derive(Debug)]
pub(crate) struct LiveRange {
    /// 0 for the head of a top-level range, and unique among its children otherwise.
    pub(crate) relative_id: u32,
    pub(crate) top: TopLevelIdx,
    pub(crate) next: Option<LiveRangeIdx>,
    pub(crate) first_interval: Option<UseIntervalIdx>,
    pub(crate) last_interval: Option<UseIntervalIdx>,
    pub(crate) first_pos: Option<UsePositionIdx>,
    pub(crate) assigned_register: Option<RegCode>,
    pub(crate) spilled: bool,
    pub(crate) kind: RegisterKind,
    /// A cache of the interval a search for a position should start at.
    current_interval: Cell<Option<UseIntervalIdx>>,
    /// A cache of the use position most recently returned by [LiveRanges::next_use_position].
    last_processed_use: Cell<Option<UsePositionIdx>>,
}

impl LiveRange {
    fn new(relative_id: u32, top: TopLevelIdx, kind: RegisterKind) -> Self {
        Self {
            relative_id,
            top,
            next: None,
            first_interval: None,
            last_interval: None,
            first_pos: None,
            assigned_register: None,
            spilled: false,
            kind,
            current_interval: Cell::new(None),
            last_processed_use: Cell::new(None),
        }
    }

    fn reset_caches(&self) {
        self.current_interval.set(None);
        self.last_processed_use.set(None);
    }
}

#[derive(Debug)]
pub(crate) struct TopLevelLiveRange {
    /// The virtual register. Fixed ranges have negative numbers; splinters have numbers beyond
    /// those of the instruction sequence.
    pub(crate) vreg: i32,
    pub(crate) head: LiveRangeIdx,
    pub(crate) representation: Representation,
    pub(crate) spill: SpillLocation,
    /// A spill range created before we knew whether one would be needed. It becomes
    /// [SpillLocation::Range] if the range is ever spilled.
    pub(crate) pending_spill_range: Option<SpillRangeIdx>,
    /// The first instruction at which the value may be in its spill slot.
    pub(crate) spill_start_index: Option<InstrIdx>,
    /// The places where a move to the spill slot must be inserted if the value is spilled: the
    /// gap (START) before an instruction and the operand holding the value at that point.
    pub(crate) spill_move_insertion_locations: Vec<(InstrIdx, OperandSlot)>,
    pub(crate) is_phi: bool,
    pub(crate) is_non_loop_phi: bool,
    pub(crate) has_slot_use: bool,
    last_child_id: u32,
    pub(crate) splinter: Option<TopLevelIdx>,
    pub(crate) splintered_from: Option<TopLevelIdx>,
}

impl TopLevelLiveRange {
    pub(crate) fn is_fixed(&self) -> bool {
        self.vreg < 0
    }

    pub(crate) fn is_splinter(&self) -> bool {
        self.splintered_from.is_some()
    }

    pub(crate) fn kind(&self) -> RegisterKind {
        self.representation.kind()
    }

    pub(crate) fn has_no_spill_type(&self) -> bool {
        self.spill == SpillLocation::None
    }

    pub(crate) fn has_spill_operand(&self) -> bool {
        matches!(self.spill, SpillLocation::Operand(_))
    }

    pub(crate) fn has_spill_range(&self) -> bool {
        matches!(self.spill, SpillLocation::Range(_))
    }

    pub(crate) fn spill_range(&self) -> Option<SpillRangeIdx> {
        match self.spill {
            SpillLocation::Range(x) => Some(x),
            _ => None,
        }
    }

    /// Does this range still need a spill range to be created before it can be splintered?
    pub(crate) fn may_require_spill_range(&self) -> bool {
        !self.has_spill_operand() && self.pending_spill_range.is_none() && !self.has_spill_range()
    }

    pub(crate) fn set_spill_operand(&mut self, op: crate::sequence::InstructionOperand) {
        debug_assert!(!op.is_unallocated());
        self.spill = SpillLocation::Operand(op);
    }

    pub(crate) fn set_spill_start_index(&mut self, i: InstrIdx) {
        self.spill_start_index = Some(match self.spill_start_index {
            Some(x) => x.min(i),
            None => i,
        });
    }

    pub(crate) fn record_spill_location(&mut self, gap: InstrIdx, slot: OperandSlot) {
        debug_assert!(self.has_no_spill_type());
        self.spill_move_insertion_locations.push((gap, slot));
    }
}

/// The parts of a range removed by [LiveRanges::detach_at].
struct Detached {
    first_interval: UseIntervalIdx,
    last_interval: UseIntervalIdx,
    first_pos: Option<UsePositionIdx>,
}

/// The arena holding every live range, interval and use position of one allocation run.
#[derive(Debug, Default)]
pub(crate) struct LiveRanges {
    pub(crate) ranges: IndexVec<LiveRangeIdx, LiveRange>,
    pub(crate) tops: IndexVec<TopLevelIdx, TopLevelLiveRange>,
    pub(crate) intervals: IndexVec<UseIntervalIdx, UseInterval>,
    pub(crate) uses: IndexVec<UsePositionIdx, UsePosition>,
}

impl LiveRanges {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn new_top_level(&mut self, vreg: i32, representation: Representation) -> TopLevelIdx {
        let top = self.tops.next_idx();
        let head = self
            .ranges
            .push(LiveRange::new(0, top, representation.kind()));
        self.tops.push(TopLevelLiveRange {
            vreg,
            head,
            representation,
            spill: SpillLocation::None,
            pending_spill_range: None,
            spill_start_index: None,
            spill_move_insertion_locations: Vec::new(),
            is_phi: false,
            is_non_loop_phi: false,
            has_slot_use: false,
            last_child_id: 0,
            splinter: None,
            splintered_from: None,
        })
    }

    pub(crate) fn new_use(
        &mut self,
        pos: LifetimePosition,
        operand: Option<(OperandSlot, &UnallocatedOperand)>,
        hint: UsePositionHint,
    ) -> UsePositionIdx {
        self.uses.push(UsePosition::new(pos, operand, hint))
    }

    pub(crate) fn top(&self, r: LiveRangeIdx) -> &TopLevelLiveRange {
        &self.tops[self.ranges[r].top]
    }

    pub(crate) fn head(&self, top: TopLevelIdx) -> LiveRangeIdx {
        self.tops[top].head
    }

    pub(crate) fn is_top_level(&self, r: LiveRangeIdx) -> bool {
        self.top(r).head == r
    }

    pub(crate) fn is_empty(&self, r: LiveRangeIdx) -> bool {
        self.ranges[r].first_interval.is_none()
    }

    pub(crate) fn start(&self, r: LiveRangeIdx) -> LifetimePosition {
        match self.ranges[r].first_interval {
            Some(i) => self.intervals[i].start,
            None => panic!("Empty live range {} has no start", self.name(r)),
        }
    }

    pub(crate) fn end(&self, r: LiveRangeIdx) -> LifetimePosition {
        match self.ranges[r].last_interval {
            Some(i) => self.intervals[i].end,
            None => panic!("Empty live range {} has no end", self.name(r)),
        }
    }

    /// A human readable name for `r`, of the form `v<vreg>:<child id>`.
    pub(crate) fn name(&self, r: LiveRangeIdx) -> String {
        format!("v{}:{}", self.top(r).vreg, self.ranges[r].relative_id)
    }

    /// Iterate over `top`'s head and all of its children, in start order.
    pub(crate) fn children(&self, top: TopLevelIdx) -> impl Iterator<Item = LiveRangeIdx> + '_ {
        iter::successors(Some(self.tops[top].head), |r| self.ranges[*r].next)
    }

    pub(crate) fn intervals_of(&self, r: LiveRangeIdx) -> impl Iterator<Item = &UseInterval> + '_ {
        iter::successors(self.ranges[r].first_interval, |i| self.intervals[*i].next)
            .map(|i| &self.intervals[i])
    }

    pub(crate) fn uses_of(&self, r: LiveRangeIdx) -> impl Iterator<Item = UsePositionIdx> + '_ {
        iter::successors(self.ranges[r].first_pos, |u| self.uses[*u].next)
    }

    /// The sum of the lengths of `r`'s intervals.
    pub(crate) fn size(&self, r: LiveRangeIdx) -> u64 {
        self.intervals_of(r)
            .map(|i| u64::try_from(i.end.value() - i.start.value()).unwrap())
            .sum()
    }

    fn next_child_id(&mut self, top: TopLevelIdx) -> u32 {
        match self.tops[top].splintered_from {
            Some(parent) => self.next_child_id(parent),
            None => {
                self.tops[top].last_child_id += 1;
                self.tops[top].last_child_id
            }
        }
    }

    /// Record that `splinter` holds the pieces of `top` that lie in deferred code. The splinter
    /// shares `top`'s spill location, and its head is named as one of `top`'s children.
    pub(crate) fn set_splinter(&mut self, top: TopLevelIdx, splinter: TopLevelIdx) {
        debug_assert!(self.tops[top].splinter.is_none());
        let id = self.next_child_id(top);
        let head = self.tops[splinter].head;
        self.ranges[head].relative_id = id;
        let (spill, pending) = {
            let t = &self.tops[top];
            (t.spill, t.pending_spill_range)
        };
        let s = &mut self.tops[splinter];
        s.splintered_from = Some(top);
        s.spill = spill;
        s.pending_spill_range = pending;
        self.tops[top].splinter = Some(splinter);
    }

    // Interval construction. These are only used by liveness analysis, which visits positions
    // backwards: new intervals are always added at, or overlapping, the front of the chain.

    /// Add `[start, end)` to `top`, merging it with the first interval if they touch or overlap.
    pub(crate) fn add_use_interval(
        &mut self,
        top: TopLevelIdx,
        start: LifetimePosition,
        end: LifetimePosition,
    ) {
        if start >= end {
            return;
        }
        let r = self.tops[top].head;
        match self.ranges[r].first_interval {
            None => {
                let i = self.intervals.push(UseInterval::new(start, end));
                self.ranges[r].first_interval = Some(i);
                self.ranges[r].last_interval = Some(i);
            }
            Some(first) => {
                let cur = &mut self.intervals[first];
                if end == cur.start {
                    cur.start = start;
                } else if end < cur.start {
                    let mut ui = UseInterval::new(start, end);
                    ui.next = Some(first);
                    self.ranges[r].first_interval = Some(self.intervals.push(ui));
                } else {
                    debug_assert!(start <= cur.end);
                    cur.start = cur.start.min(start);
                    cur.end = cur.end.max(end);
                }
            }
        }
    }

    /// Make `top` live for all of `[start, end)`, swallowing any intervals that start before
    /// `end`.
    pub(crate) fn ensure_interval(
        &mut self,
        top: TopLevelIdx,
        start: LifetimePosition,
        end: LifetimePosition,
    ) {
        let r = self.tops[top].head;
        let mut new_end = end;
        let mut first = self.ranges[r].first_interval;
        while let Some(i) = first {
            if self.intervals[i].start > end {
                break;
            }
            new_end = new_end.max(self.intervals[i].end);
            first = self.intervals[i].next;
        }
        let mut ui = UseInterval::new(start, new_end);
        ui.next = first;
        let i = self.intervals.push(ui);
        self.ranges[r].first_interval = Some(i);
        if first.is_none() {
            self.ranges[r].last_interval = Some(i);
        }
        self.ranges[r].reset_caches();
    }

    /// Move the start of `top`'s first interval to `start`: used when a definition is found.
    pub(crate) fn shorten_to(&mut self, top: TopLevelIdx, start: LifetimePosition) {
        let r = self.tops[top].head;
        let Some(first) = self.ranges[r].first_interval else {
            panic!("Cannot shorten empty range v{}", self.tops[top].vreg);
        };
        let ui = &mut self.intervals[first];
        debug_assert!(ui.start <= start && start < ui.end);
        ui.start = start;
    }

    /// Insert `u` into `top`'s use positions, keeping them in position order.
    pub(crate) fn add_use_position(&mut self, top: TopLevelIdx, u: UsePositionIdx) {
        let r = self.tops[top].head;
        let pos = self.uses[u].pos;
        let mut prev = None;
        let mut cur = self.ranges[r].first_pos;
        while let Some(c) = cur {
            if self.uses[c].pos >= pos {
                break;
            }
            prev = Some(c);
            cur = self.uses[c].next;
        }
        self.uses[u].next = cur;
        match prev {
            Some(p) => self.uses[p].next = Some(u),
            None => self.ranges[r].first_pos = Some(u),
        }
    }

    /// The first use of `top` with a hint, if any.
    pub(crate) fn first_hinted_use(&self, top: TopLevelIdx) -> Option<UsePositionIdx> {
        self.uses_of(self.tops[top].head)
            .find(|u| self.uses[*u].has_hint())
    }

    // Queries.

    fn first_search_interval_for_position(
        &self,
        r: LiveRangeIdx,
        pos: LifetimePosition,
    ) -> Option<UseIntervalIdx> {
        let lr = &self.ranges[r];
        match lr.current_interval.get() {
            None => lr.first_interval,
            Some(c) if self.intervals[c].start > pos => {
                lr.current_interval.set(None);
                lr.first_interval
            }
            Some(c) => Some(c),
        }
    }

    fn advance_last_processed_marker(
        &self,
        r: LiveRangeIdx,
        to_start_of: UseIntervalIdx,
        but_not_past: LifetimePosition,
    ) {
        let start = self.intervals[to_start_of].start;
        if start > but_not_past {
            return;
        }
        let lr = &self.ranges[r];
        let cur_start = lr
            .current_interval
            .get()
            .map(|c| self.intervals[c].start)
            .unwrap_or_else(LifetimePosition::invalid);
        if start > cur_start {
            lr.current_interval.set(Some(to_start_of));
        }
    }

    /// Is `r` live at `pos`?
    pub(crate) fn covers(&self, r: LiveRangeIdx, pos: LifetimePosition) -> bool {
        let mut cur = self.first_search_interval_for_position(r, pos);
        while let Some(i) = cur {
            self.advance_last_processed_marker(r, i, pos);
            let ui = &self.intervals[i];
            if ui.contains(pos) {
                return true;
            }
            if ui.start > pos {
                return false;
            }
            cur = ui.next;
        }
        false
    }

    /// Is `pos` within `r`'s extent, ignoring holes?
    pub(crate) fn can_cover(&self, r: LiveRangeIdx, pos: LifetimePosition) -> bool {
        !self.is_empty(r) && self.start(r) <= pos && pos < self.end(r)
    }

    /// The first position at which `r` and `other` are both live, if any.
    pub(crate) fn first_intersection(
        &self,
        r: LiveRangeIdx,
        other: LiveRangeIdx,
    ) -> Option<LifetimePosition> {
        let mut b = self.ranges[other].first_interval?;
        if self.is_empty(r) {
            return None;
        }
        let (r_end, other_end) = (self.end(r), self.end(other));
        let advance_up_to = self.intervals[b].start;
        let mut a = self.first_search_interval_for_position(r, advance_up_to);
        while let Some(ai) = a {
            let (ua, ub) = (&self.intervals[ai], &self.intervals[b]);
            if ua.start > other_end || ub.start > r_end {
                break;
            }
            if let Some(x) = ua.intersect(ub) {
                return Some(x);
            }
            if ua.start < ub.start {
                a = ua.next;
                match a {
                    Some(ai) if self.intervals[ai].start <= other_end => {
                        self.advance_last_processed_marker(r, ai, advance_up_to)
                    }
                    _ => break,
                }
            } else {
                match ub.next {
                    Some(x) => b = x,
                    None => break,
                }
            }
        }
        None
    }

    /// The first use of `r` at or after `start`.
    pub(crate) fn next_use_position(
        &self,
        r: LiveRangeIdx,
        start: LifetimePosition,
    ) -> Option<UsePositionIdx> {
        let lr = &self.ranges[r];
        let mut u = match lr.last_processed_use.get() {
            Some(u) if self.uses[u].pos <= start => Some(u),
            _ => lr.first_pos,
        };
        while let Some(x) = u {
            if self.uses[x].pos >= start {
                break;
            }
            u = self.uses[x].next;
        }
        lr.last_processed_use.set(u);
        u
    }

    fn next_use_matching<F>(
        &self,
        r: LiveRangeIdx,
        start: LifetimePosition,
        pred: F,
    ) -> Option<UsePositionIdx>
    where
        F: Fn(&UsePosition) -> bool,
    {
        iter::successors(self.next_use_position(r, start), |u| self.uses[*u].next)
            .find(|u| pred(&self.uses[*u]))
    }

    pub(crate) fn next_use_position_register_is_beneficial(
        &self,
        r: LiveRangeIdx,
        start: LifetimePosition,
    ) -> Option<UsePositionIdx> {
        self.next_use_matching(r, start, |u| u.register_beneficial)
    }

    /// The last register-beneficial use of `r` strictly before `start`.
    pub(crate) fn previous_use_position_register_is_beneficial(
        &self,
        r: LiveRangeIdx,
        start: LifetimePosition,
    ) -> Option<UsePositionIdx> {
        self.uses_of(r)
            .take_while(|u| self.uses[*u].pos < start)
            .filter(|u| self.uses[*u].register_beneficial)
            .last()
    }

    pub(crate) fn next_register_position(
        &self,
        r: LiveRangeIdx,
        start: LifetimePosition,
    ) -> Option<UsePositionIdx> {
        self.next_use_matching(r, start, |u| u.ty == UsePositionType::RequiresRegister)
    }

    pub(crate) fn next_slot_position(
        &self,
        r: LiveRangeIdx,
        start: LifetimePosition,
    ) -> Option<UsePositionIdx> {
        self.next_use_matching(r, start, |u| u.ty == UsePositionType::RequiresSlot)
    }

    /// Can `r` be spilled at `pos`? Not if it needs a register at, or immediately after, `pos`.
    pub(crate) fn can_be_spilled(&self, r: LiveRangeIdx, pos: LifetimePosition) -> bool {
        match self.next_register_position(r, pos) {
            None => true,
            Some(u) => self.uses[u].pos > pos.next_start().end(),
        }
    }

    /// The register `u`'s hint currently names, if any.
    pub(crate) fn hint_register(
        &self,
        u: UsePositionIdx,
        phis: &IndexVec<PhiIdx, PhiMapValue>,
    ) -> Option<RegCode> {
        match self.uses[u].hint {
            UsePositionHint::None | UsePositionHint::Unresolved => None,
            UsePositionHint::Operand(op) => match op {
                crate::sequence::InstructionOperand::Register { code, .. } => Some(code),
                _ => None,
            },
            UsePositionHint::UsePos(other) => self.uses[other].assigned_register,
            UsePositionHint::Phi(p) => phis[p].assigned_register,
        }
    }

    /// The first use of `r` whose hint names a register, and that register.
    pub(crate) fn first_hint_position(
        &self,
        r: LiveRangeIdx,
        phis: &IndexVec<PhiIdx, PhiMapValue>,
    ) -> Option<(UsePositionIdx, RegCode)> {
        self.uses_of(r)
            .find_map(|u| self.hint_register(u, phis).map(|reg| (u, reg)))
    }

    /// Should `r` be allocated before `other`? Earlier starts go first; ties are broken by the
    /// earliest use.
    pub(crate) fn should_be_allocated_before(&self, r: LiveRangeIdx, other: LiveRangeIdx) -> bool {
        let (start, other_start) = (self.start(r), self.start(other));
        if start == other_start {
            let Some(u) = self.ranges[r].first_pos else {
                return false;
            };
            let Some(other_u) = self.ranges[other].first_pos else {
                return true;
            };
            return self.uses[u].pos < self.uses[other_u].pos;
        }
        start < other_start
    }

    // Mutation.

    pub(crate) fn set_assigned_register(&mut self, r: LiveRangeIdx, reg: RegCode) {
        debug_assert!(self.ranges[r].assigned_register.is_none() && !self.ranges[r].spilled);
        self.ranges[r].assigned_register = Some(reg);
    }

    pub(crate) fn unset_assigned_register(&mut self, r: LiveRangeIdx) {
        self.ranges[r].assigned_register = None;
    }

    /// Mark `r` as spilled. Nothing is said about where to: see [SpillLocation].
    pub(crate) fn mark_spilled(&mut self, r: LiveRangeIdx) {
        debug_assert!(!self.ranges[r].spilled);
        debug_assert!(!self.top(r).is_fixed());
        self.ranges[r].spilled = true;
        self.ranges[r].assigned_register = None;
    }

    /// Tell every use of `r` that could be in a register that it will be in `reg`.
    pub(crate) fn set_use_hints(&mut self, r: LiveRangeIdx, reg: RegCode) {
        let mut cur = self.ranges[r].first_pos;
        while let Some(u) = cur {
            let up = &mut self.uses[u];
            if up.operand.is_some() && up.ty != UsePositionType::RequiresSlot {
                up.assigned_register = Some(reg);
            }
            cur = up.next;
        }
    }

    pub(crate) fn unset_use_hints(&mut self, r: LiveRangeIdx) {
        let mut cur = self.ranges[r].first_pos;
        while let Some(u) = cur {
            self.uses[u].assigned_register = None;
            cur = self.uses[u].next;
        }
    }

    /// Split `i` at `pos`, returning the new interval `[pos, end)`.
    fn split_interval(&mut self, i: UseIntervalIdx, pos: LifetimePosition) -> UseIntervalIdx {
        let ui = &self.intervals[i];
        debug_assert!(ui.contains(pos) && pos != ui.start);
        let mut after = UseInterval::new(pos, ui.end);
        after.next = ui.next;
        let after = self.intervals.push(after);
        let ui = &mut self.intervals[i];
        ui.next = None;
        ui.end = pos;
        after
    }

    /// Remove everything at or after `pos` from `r`, returning what was removed and the last use
    /// position that remains in `r`. If `connect_hints` is true, the first removed use is hinted
    /// with the last remaining use.
    fn detach_at(
        &mut self,
        r: LiveRangeIdx,
        pos: LifetimePosition,
        connect_hints: bool,
    ) -> (Detached, Option<UsePositionIdx>) {
        debug_assert!(self.start(r) < pos && pos < self.end(r));
        // Find the last interval that ends before `pos`, splitting the interval that contains
        // `pos` if there is one.
        let mut current = match self.first_search_interval_for_position(r, pos) {
            Some(c) if self.intervals[c].start != pos => c,
            _ => self.ranges[r].first_interval.unwrap(),
        };
        // If `pos` is the start of an interval (i.e. the end of a hole), a use at `pos` belongs
        // to the detached part, which owns the interval covering it.
        let mut split_at_start = false;
        let after = loop {
            if self.intervals[current].contains(pos) {
                break self.split_interval(current, pos);
            }
            // `pos < end(r)` so there is always a next interval.
            let next = self.intervals[current].next.unwrap();
            if self.intervals[next].start >= pos {
                split_at_start = self.intervals[next].start == pos;
                self.intervals[current].next = None;
                break next;
            }
            current = next;
        };

        let lr = &mut self.ranges[r];
        let last_interval = if lr.last_interval == Some(current) {
            after
        } else {
            lr.last_interval.unwrap()
        };
        lr.last_interval = Some(current);

        let mut use_after = lr.first_pos;
        let mut use_before = None;
        while let Some(u) = use_after {
            let upos = self.uses[u].pos;
            if upos > pos || (split_at_start && upos == pos) {
                break;
            }
            use_before = Some(u);
            use_after = self.uses[u].next;
        }
        match use_before {
            Some(u) => self.uses[u].next = None,
            None => self.ranges[r].first_pos = None,
        }
        self.ranges[r].reset_caches();

        if connect_hints {
            if let (Some(b), Some(a)) = (use_before, use_after) {
                self.uses[a].hint = UsePositionHint::UsePos(b);
            }
        }
        (
            Detached {
                first_interval: after,
                last_interval,
                first_pos: use_after,
            },
            use_before,
        )
    }

    /// Split `r` at `pos`, which must be strictly inside it, returning the new child range that
    /// holds everything from `pos` onwards.
    pub(crate) fn split_at(&mut self, r: LiveRangeIdx, pos: LifetimePosition) -> LiveRangeIdx {
        let top = self.ranges[r].top;
        debug_assert!(!self.tops[top].is_fixed());
        let id = self.next_child_id(top);
        let (d, _) = self.detach_at(r, pos, true);
        let mut child = LiveRange::new(id, top, self.ranges[r].kind);
        child.first_interval = Some(d.first_interval);
        child.last_interval = Some(d.last_interval);
        child.first_pos = d.first_pos;
        child.next = self.ranges[r].next;
        let child = self.ranges.push(child);
        self.ranges[r].next = Some(child);
        child
    }

    /// Move the part of `top` that lies within `[start, end)` into the splinter `splinter`,
    /// appending it to whatever the splinter already holds. `top` must not have been split yet.
    pub(crate) fn splinter(
        &mut self,
        top: TopLevelIdx,
        splinter: TopLevelIdx,
        start: LifetimePosition,
        end: LifetimePosition,
    ) {
        let r = self.tops[top].head;
        debug_assert!(self.ranges[r].next.is_none());
        debug_assert!(start > self.start(r) && start < end);

        let (piece, last_in_piece) = if end >= self.end(r) {
            let (d, _) = self.detach_at(r, start, true);
            (d, None)
        } else {
            // Temporarily turn the middle part into a child so that it can be split again.
            let (mid, last_before) = self.detach_at(r, start, true);
            let tmp = self.ranges.push(LiveRange::new(u32::MAX, top, self.ranges[r].kind));
            self.ranges[tmp].first_interval = Some(mid.first_interval);
            self.ranges[tmp].last_interval = Some(mid.last_interval);
            self.ranges[tmp].first_pos = mid.first_pos;
            // The value leaves the deferred region here: allocation decisions made there should
            // not leak back into the hot path, so hints are not connected.
            let (tail, last_in_mid) = self.detach_at(tmp, end, false);
            let mid = Detached {
                first_interval: mid.first_interval,
                last_interval: self.ranges[tmp].last_interval.unwrap(),
                first_pos: self.ranges[tmp].first_pos,
            };
            self.ranges[tmp].first_interval = None;
            self.ranges[tmp].last_interval = None;
            self.ranges[tmp].first_pos = None;

            // Reattach the tail to `r`.
            let lr_last = self.ranges[r].last_interval.unwrap();
            self.intervals[lr_last].next = Some(tail.first_interval);
            self.ranges[r].last_interval = Some(tail.last_interval);
            match last_before {
                Some(u) => self.uses[u].next = tail.first_pos,
                None => self.ranges[r].first_pos = tail.first_pos,
            }
            (mid, last_in_mid)
        };
        self.ranges[r].reset_caches();

        let s = self.tops[splinter].head;
        match self.ranges[s].last_interval {
            None => self.ranges[s].first_interval = Some(piece.first_interval),
            Some(l) => self.intervals[l].next = Some(piece.first_interval),
        }
        self.ranges[s].last_interval = Some(piece.last_interval);
        match self.uses_of(s).last() {
            None => self.ranges[s].first_pos = piece.first_pos,
            Some(l) => self.uses[l].next = piece.first_pos,
        }
        debug_assert!(last_in_piece.map_or(true, |u| self.uses[u].next.is_none()));
        self.ranges[s].reset_caches();
    }

    /// Make `splinter` part of `top` again, interleaving their children in start order. Children
    /// of `top` that straddle a splinter child are split around it.
    pub(crate) fn merge(&mut self, top: TopLevelIdx, splinter: TopLevelIdx) {
        debug_assert_eq!(self.tops[splinter].splintered_from, Some(top));
        let mut first = Some(self.tops[top].head);
        let mut second = Some(self.tops[splinter].head);
        debug_assert!(self.start(first.unwrap()) < self.start(second.unwrap()));
        while let (Some(f), Some(s)) = (first, second) {
            debug_assert_ne!(f, s);
            if self.start(s) < self.start(f) {
                (first, second) = (second, first);
                continue;
            }
            if self.end(f) <= self.start(s) {
                match self.ranges[f].next {
                    Some(n) if self.start(n) <= self.start(s) => first = Some(n),
                    n => {
                        self.ranges[f].next = Some(s);
                        first = n;
                    }
                }
                continue;
            }
            // `f` and `s` overlap: `f` has a hole that `s` sits in.
            debug_assert!(self.start(f) < self.start(s) && self.start(s) < self.end(f));
            let s_start = self.start(s);
            let rest = self.split_at(f, s_start);
            self.ranges[rest].spilled = self.ranges[f].spilled;
            self.ranges[rest].assigned_register = self.ranges[f].assigned_register;
            // `split_at` linked `rest` after `f`: put `s` in between.
            self.ranges[f].next = Some(s);
            first = Some(rest);
        }

        let mut cur = Some(self.tops[top].head);
        while let Some(r) = cur {
            self.ranges[r].top = top;
            self.ranges[r].reset_caches();
            cur = self.ranges[r].next;
        }
        let (sp_spill, sp_slot_use) = {
            let sp = &self.tops[splinter];
            (sp.spill, sp.has_slot_use)
        };
        let t = &mut self.tops[top];
        if t.has_no_spill_type() {
            if let SpillLocation::Range(_) = sp_spill {
                t.spill = sp_spill;
            }
        }
        t.has_slot_use |= sp_slot_use;
        t.splinter = None;
        // The splinter's children now belong to `top`: the splinter itself must not be used again.
        self.tops[splinter].spill = SpillLocation::None;
    }

    // Verification.

    /// Check that `r`'s intervals are ascending and disjoint and that every use lies within one of
    /// them (or at the end of one).
    pub(crate) fn verify_range(&self, r: LiveRangeIdx) -> Result<(), String> {
        let name = self.name(r);
        let mut last_end = None;
        for ui in self.intervals_of(r) {
            if ui.start >= ui.end {
                return Err(format!("{name} has an empty interval at {}", ui.start));
            }
            if let Some(e) = last_end {
                if ui.start < e {
                    return Err(format!("{name} has overlapping intervals at {}", ui.start));
                }
            }
            last_end = Some(ui.end);
        }
        if last_end.is_some() && last_end != Some(self.end(r)) {
            return Err(format!("{name}'s last interval is out of date"));
        }
        let mut intervals = self.intervals_of(r).peekable();
        let mut last_pos = None;
        for u in self.uses_of(r) {
            let pos = self.uses[u].pos;
            if last_pos.is_some_and(|x| x > pos) {
                return Err(format!("{name}'s use positions are out of order at {pos}"));
            }
            last_pos = Some(pos);
            loop {
                match intervals.peek() {
                    Some(ui) if ui.contains(pos) || ui.end == pos => break,
                    Some(_) => {
                        intervals.next();
                    }
                    None => return Err(format!("{name} has a use at {pos} outside its intervals")),
                }
            }
        }
        Ok(())
    }

    /// Check every child of `top` with [Self::verify_range], and that the children are in order.
    pub(crate) fn verify_child_structure(&self, top: TopLevelIdx) -> Result<(), String> {
        let mut last_end = None;
        for r in self.children(top) {
            self.verify_range(r)?;
            if self.is_empty(r) {
                if r == self.tops[top].head {
                    continue;
                }
                return Err(format!("{} is an empty child", self.name(r)));
            }
            if last_end.is_some_and(|e| e > self.start(r)) {
                return Err(format!("{} starts before its predecessor ends", self.name(r)));
            }
            if self.ranges[r].top != top {
                return Err(format!("{} has the wrong parent", self.name(r)));
            }
            last_end = Some(self.end(r));
        }
        Ok(())
    }
}
