//! Greedy and regret-based construction of bus chains

use super::{schedule_sequence, ScheduleContext};
use crate::types::{DutyItem, RouteKind};

/// An ordered sequence of routes intended for one bus, with computed times
#[derive(Debug, Clone)]
pub struct Chain {
    pub id: usize,
    pub items: Vec<DutyItem>,
}

impl Chain {
    pub fn route_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.route_id.clone()).collect()
    }

    pub fn total_deadhead(&self) -> i32 {
        self.items.iter().map(|i| i.deadhead_minutes).sum()
    }

    pub fn total_shift(&self) -> i32 {
        self.items.iter().map(|i| i.time_shift_minutes).sum()
    }
}

/// A candidate placement of one route into one chain
#[derive(Debug, Clone)]
struct Insertion {
    chain_index: usize,
    position: usize,
    /// Deadhead minutes added to the chain
    delta_deadhead: i32,
    /// Total shift of the chain after insertion
    total_shift: i32,
    items: Vec<DutyItem>,
}

/// Builds feasible chains from the route pool of one day. Entries and
/// exits are chained separately; runs are deterministic for identical
/// input.
pub struct ChainBuilder<'a> {
    ctx: &'a ScheduleContext<'a>,
}

impl<'a> ChainBuilder<'a> {
    pub fn new(ctx: &'a ScheduleContext<'a>) -> Self {
        Self { ctx }
    }

    /// Build chains for all routes of the given kind
    pub fn build(&self, kind: RouteKind) -> Vec<Chain> {
        let mut ids: Vec<String> = self
            .ctx
            .pool
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.id.clone())
            .collect();
        // Ascending anchor time; stable on input order for equal anchors
        ids.sort_by_key(|id| self.ctx.route(id).anchor_time);

        match self.ctx.options.construction {
            crate::types::ConstructionStrategy::Greedy => self.greedy(&ids),
            crate::types::ConstructionStrategy::Regret => {
                self.regret(&ids, self.ctx.options.regret_k.max(2) as usize)
            }
        }
    }

    /// Greedy-by-start: append each route to the cheapest feasible
    /// insertion, opening a new chain when none accepts it
    fn greedy(&self, ids: &[String]) -> Vec<Chain> {
        let mut chains: Vec<Chain> = Vec::new();

        for id in ids {
            match self.best_insertion_over(&chains, id) {
                Some(insertion) => self.apply(&mut chains, id, insertion),
                None => self.open_chain(&mut chains, id),
            }
        }

        chains
    }

    /// Regret-k: repeatedly assign the unplaced route whose best insertion
    /// would degrade the most if delayed
    fn regret(&self, ids: &[String], k: usize) -> Vec<Chain> {
        let mut chains: Vec<Chain> = Vec::new();
        let mut unassigned: Vec<String> = ids.to_vec();

        while !unassigned.is_empty() {
            let mut pick: Option<(usize, i64, Insertion)> = None;

            for (idx, id) in unassigned.iter().enumerate() {
                let mut candidates = self.insertions_over(&chains, id);
                candidates.sort_by_key(|c| (c.delta_deadhead, c.total_shift, c.chain_index));

                let regret = match candidates.len() {
                    // No feasible insertion: force a new chain now
                    0 => i64::MAX,
                    n if n < k => i64::MAX / 2 - candidates[0].delta_deadhead as i64,
                    _ => (candidates[k - 1].delta_deadhead - candidates[0].delta_deadhead) as i64,
                };

                let better = match &pick {
                    None => true,
                    Some((_, best_regret, best)) => {
                        regret > *best_regret
                            || (regret == *best_regret
                                && candidates
                                    .first()
                                    .map(|c| c.delta_deadhead < best.delta_deadhead)
                                    .unwrap_or(false))
                    }
                };
                if better {
                    let insertion = candidates.into_iter().next();
                    match insertion {
                        Some(insertion) => pick = Some((idx, regret, insertion)),
                        None => {
                            // Sentinel insertion meaning "open a new chain"
                            pick = Some((
                                idx,
                                regret,
                                Insertion {
                                    chain_index: usize::MAX,
                                    position: 0,
                                    delta_deadhead: 0,
                                    total_shift: 0,
                                    items: vec![],
                                },
                            ));
                        }
                    }
                }
            }

            let (idx, _, insertion) = pick.expect("unassigned is non-empty");
            let id = unassigned.remove(idx);
            if insertion.chain_index == usize::MAX {
                self.open_chain(&mut chains, &id);
            } else {
                self.apply(&mut chains, &id, insertion);
            }
        }

        chains
    }

    fn open_chain(&self, chains: &mut Vec<Chain>, id: &str) {
        let items = schedule_sequence(&[id.to_string()], self.ctx)
            .expect("single route is always schedulable");
        chains.push(Chain {
            id: chains.len(),
            items,
        });
    }

    fn apply(&self, chains: &mut Vec<Chain>, _id: &str, insertion: Insertion) {
        chains[insertion.chain_index].items = insertion.items;
    }

    /// Cheapest feasible insertion across all chains. Ties broken by
    /// lowest deadhead, then smallest induced shift, then chain id.
    fn best_insertion_over(&self, chains: &[Chain], id: &str) -> Option<Insertion> {
        let mut candidates = self.insertions_over(chains, id);
        candidates.sort_by_key(|c| (c.delta_deadhead, c.total_shift, c.chain_index, c.position));
        candidates.into_iter().next()
    }

    /// Best feasible insertion per chain
    fn insertions_over(&self, chains: &[Chain], id: &str) -> Vec<Insertion> {
        chains
            .iter()
            .enumerate()
            .filter_map(|(chain_index, chain)| self.best_position(chain_index, chain, id))
            .collect()
    }

    fn best_position(&self, chain_index: usize, chain: &Chain, id: &str) -> Option<Insertion> {
        let eval = super::best_position_in(&chain.route_ids(), id, self.ctx)?;
        Some(Insertion {
            chain_index,
            position: eval.position,
            delta_deadhead: eval.delta_deadhead,
            total_shift: eval.total_shift,
            items: eval.items,
        })
    }
}
