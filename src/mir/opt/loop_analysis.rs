use crate::mir::flow::Cfg;
use crate::mir::*;
use rustc_hash::FxHashSet;

#[derive(Debug, Clone)]
pub struct LoopInfo {
    pub header: BlockId,
    pub backedges: Vec<BlockId>,    // Blocks that jump back to header
    pub preheaders: Vec<BlockId>,   // Header predecessors outside the loop
    pub exits: Vec<BlockId>,        // Blocks outside loop targeted by loop blocks
    pub body: FxHashSet<BlockId>,   // All blocks in the loop, header included
}

impl LoopInfo {
    /// The only backedge, if the loop has exactly one.
    pub fn backedge(&self) -> Option<BlockId> {
        match self.backedges.as_slice() {
            [b] => Some(*b),
            _ => None,
        }
    }

    pub fn preheader(&self) -> Option<BlockId> {
        match self.preheaders.as_slice() {
            [p] => Some(*p),
            _ => None,
        }
    }

    pub fn contains(&self, bid: BlockId) -> bool {
        self.body.contains(&bid)
    }

    /// Whether `vid` is defined outside the loop.
    pub fn is_invariant(&self, fn_ir: &FnIR, vid: ValueId) -> bool {
        !self.contains(fn_ir.def_block(vid))
    }
}

pub struct LoopAnalyzer<'a> {
    fn_ir: &'a FnIR,
    cfg: &'a Cfg,
}

impl<'a> LoopAnalyzer<'a> {
    pub fn new(fn_ir: &'a FnIR, cfg: &'a Cfg) -> Self {
        Self { fn_ir, cfg }
    }

    /// Natural loops of the reachable CFG, one per header, in RPO of their
    /// headers (outer loops before the loops they contain).
    pub fn find_loops(&self) -> Vec<LoopInfo> {
        let mut loops = Vec::new();
        for &header in &self.cfg.rpo {
            // A back-edge is src -> header where header dominates src.
            let backedges: Vec<BlockId> = self.cfg.preds[header]
                .iter()
                .copied()
                .filter(|&src| self.cfg.dominates(header, src))
                .collect();
            if backedges.is_empty() {
                continue;
            }
            loops.push(self.analyze_natural_loop(header, backedges));
        }
        loops
    }

    fn analyze_natural_loop(&self, header: BlockId, backedges: Vec<BlockId>) -> LoopInfo {
        // Collect body blocks (Reach backwards from the backedges to header)
        let mut body = FxHashSet::default();
        body.insert(header);
        let mut stack = Vec::new();
        for &b in &backedges {
            if body.insert(b) {
                stack.push(b);
            }
        }
        while let Some(node) = stack.pop() {
            for &pred in &self.cfg.preds[node] {
                if self.cfg.is_reachable(pred) && body.insert(pred) {
                    stack.push(pred);
                }
            }
        }

        // Find exits (successors of body blocks NOT in body)
        let mut exits = Vec::new();
        let mut sorted: Vec<BlockId> = body.iter().copied().collect();
        sorted.sort_unstable();
        for &block in &sorted {
            for succ in self.fn_ir.blocks[block].term.successors() {
                if !body.contains(&succ) && !exits.contains(&succ) {
                    exits.push(succ);
                }
            }
        }

        let preheaders = self.cfg.preds[header]
            .iter()
            .copied()
            .filter(|p| !body.contains(p) && self.cfg.is_reachable(*p))
            .collect();

        LoopInfo {
            header,
            backedges,
            preheaders,
            exits,
            body,
        }
    }
}
