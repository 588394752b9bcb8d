//! Insert the moves that carry a value between the locations of consecutive pieces of its live
//! range: within a block, and along control flow edges.

use super::{data::RegisterAllocationData, live_range::LiveRangeIdx, position::LifetimePosition};
use crate::{
    log::ra_trace,
    sequence::{GapPosition, InstrIdx, InstructionBlock, InstructionOperand, MoveOperands, RpoNumber},
    stats::Counter,
};
use std::collections::BTreeMap;

/// Can control flow into `block` be resolved by [LiveRangeConnector::connect_ranges]? Only if its
/// sole predecessor is laid out immediately before it.
fn can_eagerly_resolve_control_flow(block: &InstructionBlock) -> bool {
    match block.predecessors() {
        [pred] => pred.index() + 1 == block.rpo_number().index(),
        _ => false,
    }
}

/// The extent of one child of a top-level range.
struct Bound {
    start: LifetimePosition,
    end: LifetimePosition,
    range: LiveRangeIdx,
    /// Spilled children are stored to at their definition, so nothing needs to flow into them.
    skip: bool,
}

impl Bound {
    fn can_cover(&self, pos: LifetimePosition) -> bool {
        self.start <= pos && pos < self.end
    }
}

fn find_bound(bounds: &[Bound], pos: LifetimePosition) -> Option<&Bound> {
    let i = bounds.partition_point(|b| b.end <= pos);
    bounds.get(i).filter(|b| b.can_cover(pos))
}

pub(crate) struct LiveRangeConnector<'d, 'a> {
    d: &'d mut RegisterAllocationData<'a>,
}

impl<'d, 'a> LiveRangeConnector<'d, 'a> {
    pub(crate) fn new(d: &'d mut RegisterAllocationData<'a>) -> Self {
        Self { d }
    }

    /// Where a value moves from one child of its range to the next within a block, insert a move
    /// between their locations.
    pub(crate) fn connect_ranges(&mut self) {
        // Moves that must happen after those already in an END gap, keyed by that gap.
        let mut delayed = BTreeMap::<InstrIdx, Vec<MoveOperands>>::new();
        for top in self.d.top_level_ranges().collect::<Vec<_>>() {
            let children = self.d.lrs.children(top).collect::<Vec<_>>();
            for w in children.windows(2) {
                let (first, second) = (w[0], w[1]);
                // A spilled child is stored to when the value is defined.
                if self.d.lrs.ranges[second].spilled {
                    continue;
                }
                let pos = self.d.lrs.start(second);
                if self.d.lrs.end(first) != pos {
                    continue;
                }
                if self.d.is_block_boundary(pos)
                    && !can_eagerly_resolve_control_flow(self.d.block_at(pos))
                {
                    continue;
                }
                let prev_op = self.d.assigned_operand(first);
                let cur_op = self.d.assigned_operand(second);
                if prev_op == cur_op {
                    continue;
                }
                let mut gap_index = pos.to_instruction_index();
                if pos.is_gap_position() {
                    let gpos = if pos.is_start() {
                        GapPosition::Start
                    } else {
                        GapPosition::End
                    };
                    self.d.add_gap_move(gap_index, gpos, prev_op, cur_op);
                } else if pos.is_start() {
                    delayed
                        .entry(gap_index)
                        .or_default()
                        .push(MoveOperands::new(prev_op, cur_op));
                } else {
                    gap_index = InstrIdx::new(gap_index.index() + 1);
                    self.d
                        .add_gap_move(gap_index, GapPosition::Start, prev_op, cur_op);
                }
                ra_trace!(
                    self.d.log,
                    "connecting {} and {} at {pos}",
                    self.d.lrs.name(first),
                    self.d.lrs.name(second)
                );
            }
        }

        for (i, moves) in delayed {
            let pm = self
                .d
                .seq
                .instruction_mut(i)
                .get_or_create_parallel_move(GapPosition::End);
            let mut to_eliminate = Vec::new();
            let mut to_insert = Vec::with_capacity(moves.len());
            for mut mv in moves {
                if let Some(j) = pm.prepare_insert_after(&mut mv) {
                    to_eliminate.push(j);
                }
                to_insert.push(mv);
            }
            for j in to_eliminate {
                pm.moves_mut()[j].eliminate();
            }
            let n = to_insert.len();
            pm.moves_mut().extend(to_insert);
            self.d.stats.add(Counter::GapMoves, n as u64);
        }
    }

    /// Where a value is live into a block but is in a different location at the end of a
    /// predecessor, insert a move on that edge.
    pub(crate) fn resolve_control_flow(&mut self) {
        let nvregs = self.d.seq.virtual_register_count();
        let mut bounds: Vec<Option<Vec<Bound>>> = (0..nvregs).map(|_| None).collect();
        for b in self.d.seq.blocks().indices() {
            let block = self.d.seq.block(b);
            if can_eagerly_resolve_control_flow(block) {
                continue;
            }
            let block_start =
                LifetimePosition::gap_from_instruction_index(block.first_instruction_index());
            let preds = block.predecessors().to_vec();
            let live = self.d.live_in_sets[b]
                .iter_set_bits(..)
                .collect::<Vec<_>>();
            for vreg in live {
                let Some(top) = self.d.live_ranges[vreg] else {
                    continue;
                };
                let bounds = bounds[vreg].get_or_insert_with(|| {
                    self.d
                        .lrs
                        .children(top)
                        .filter(|r| !self.d.lrs.is_empty(*r))
                        .map(|r| Bound {
                            start: self.d.lrs.start(r),
                            end: self.d.lrs.end(r),
                            range: r,
                            skip: self.d.lrs.ranges[r].spilled,
                        })
                        .collect()
                });
                for pred in &preds {
                    let pred_end = LifetimePosition::instruction_from_instruction_index(
                        self.d.seq.block(*pred).last_instruction_index(),
                    );
                    let Some(pred_cover) = find_bound(bounds, pred_end) else {
                        panic!(
                            "v{vreg} is live into B{} but not out of B{}",
                            b.index(),
                            pred.index()
                        );
                    };
                    if pred_cover.can_cover(block_start) {
                        // One child covers both ends of the edge.
                        continue;
                    }
                    let Some(cur_cover) = find_bound(bounds, block_start) else {
                        panic!("v{vreg} is live into B{} but not at its start", b.index());
                    };
                    if cur_cover.skip || cur_cover.range == pred_cover.range {
                        continue;
                    }
                    let pred_op = self.d.assigned_operand(pred_cover.range);
                    let cur_op = self.d.assigned_operand(cur_cover.range);
                    if pred_op != cur_op {
                        self.resolve_edge(b, *pred, pred_op, cur_op);
                    }
                }
            }
        }
    }

    /// Move `pred_op` to `cur_op` on the edge from `pred` to `b`. Edges are never critical, so
    /// either `b` has a single predecessor or `pred` has a single successor.
    fn resolve_edge(
        &mut self,
        b: RpoNumber,
        pred: RpoNumber,
        pred_op: InstructionOperand,
        cur_op: InstructionOperand,
    ) {
        let block = self.d.seq.block(b);
        let (gap, gpos) = if block.predecessors().len() == 1 {
            (block.first_instruction_index(), GapPosition::Start)
        } else {
            let pred = self.d.seq.block(pred);
            debug_assert_eq!(pred.successors().len(), 1);
            (pred.last_instruction_index(), GapPosition::End)
        };
        ra_trace!(
            self.d.log,
            "resolving B{} -> B{}: {} to {}",
            pred.index(),
            b.index(),
            pred_op.display(self.d.config),
            cur_op.display(self.d.config)
        );
        self.d.add_gap_move(gap, gpos, pred_op, cur_op);
    }
}
