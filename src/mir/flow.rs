use crate::mir::*;

/// Control-flow facts of one function: predecessors, block orders and the
/// dominator tree. Blocks never change during range analysis, so one `Cfg`
/// serves the whole pipeline.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub preds: Vec<Vec<BlockId>>,
    pub rpo: Vec<BlockId>,
    pub postorder: Vec<BlockId>,
    rpo_index: Vec<Option<usize>>,
    idom: Vec<Option<BlockId>>,
}

impl Cfg {
    pub fn new(fn_ir: &FnIR) -> Self {
        let n = fn_ir.blocks.len();
        let mut preds = vec![Vec::new(); n];
        for blk in &fn_ir.blocks {
            for succ in blk.term.successors() {
                if succ < n && !preds[succ].contains(&blk.id) {
                    preds[succ].push(blk.id);
                }
            }
        }

        let postorder = compute_postorder(fn_ir);
        let rpo: Vec<BlockId> = postorder.iter().rev().copied().collect();
        let mut rpo_index = vec![None; n];
        for (i, b) in rpo.iter().enumerate() {
            rpo_index[*b] = Some(i);
        }

        let idom = compute_idoms(fn_ir.entry, &rpo, &rpo_index, &preds);
        Self {
            preds,
            rpo,
            postorder,
            rpo_index,
            idom,
        }
    }

    pub fn is_reachable(&self, bid: BlockId) -> bool {
        self.rpo_index.get(bid).copied().flatten().is_some()
    }

    pub fn rpo_index(&self, bid: BlockId) -> Option<usize> {
        self.rpo_index.get(bid).copied().flatten()
    }

    /// Immediate dominator; `None` for the entry and unreachable blocks.
    pub fn idom(&self, bid: BlockId) -> Option<BlockId> {
        self.idom.get(bid).copied().flatten()
    }

    /// Whether `a` dominates `b` (reflexive).
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if !self.is_reachable(a) || !self.is_reachable(b) {
            return false;
        }
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom(cur) {
                Some(next) => cur = next,
                None => return false,
            }
        }
    }

    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// The block whose `If` decides entry into `bid`, when `bid` is only
    /// entered from that test: its single predecessor is its immediate
    /// dominator and ends in a conditional branch.
    pub fn immediate_dominator_branch(&self, fn_ir: &FnIR, bid: BlockId) -> Option<BlockId> {
        let preds = &self.preds[bid];
        if preds.len() != 1 {
            return None;
        }
        let dom = self.idom(bid)?;
        if dom != preds[0] {
            return None;
        }
        match fn_ir.blocks[dom].term {
            Terminator::If {
                then_bb, else_bb, ..
            } if then_bb != else_bb => Some(dom),
            _ => None,
        }
    }
}

fn compute_postorder(fn_ir: &FnIR) -> Vec<BlockId> {
    let n = fn_ir.blocks.len();
    let mut out = Vec::with_capacity(n);
    if n == 0 {
        return out;
    }
    let mut seen = vec![false; n];
    // (block, next successor index)
    let mut stack: Vec<(BlockId, usize)> = vec![(fn_ir.entry, 0)];
    seen[fn_ir.entry] = true;
    while let Some((bid, next)) = stack.pop() {
        let succs = fn_ir.blocks[bid].term.successors();
        if next < succs.len() {
            stack.push((bid, next + 1));
            let s = succs[next];
            if s < n && !seen[s] {
                seen[s] = true;
                stack.push((s, 0));
            }
        } else {
            out.push(bid);
        }
    }
    out
}

// Cooper, Harvey, Kennedy: "A Simple, Fast Dominance Algorithm".
fn compute_idoms(
    entry: BlockId,
    rpo: &[BlockId],
    rpo_index: &[Option<usize>],
    preds: &[Vec<BlockId>],
) -> Vec<Option<BlockId>> {
    let mut idom: Vec<Option<BlockId>> = vec![None; preds.len()];
    if rpo.is_empty() {
        return idom;
    }
    idom[entry] = Some(entry);

    let intersect = |idom: &[Option<BlockId>], mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while rpo_index[a] > rpo_index[b] {
                a = idom[a].unwrap_or(entry);
            }
            while rpo_index[b] > rpo_index[a] {
                b = idom[b].unwrap_or(entry);
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter().skip(1) {
            let mut new_idom: Option<BlockId> = None;
            for &p in &preds[b] {
                if idom[p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => p,
                    Some(cur) => intersect(&idom, p, cur),
                });
            }
            if new_idom.is_some() && idom[b] != new_idom {
                idom[b] = new_idom;
                changed = true;
            }
        }
    }

    idom[entry] = None;
    idom
}
