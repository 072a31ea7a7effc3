use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PopulationError {
    #[error("no user types configured")]
    Empty,
    #[error("all user type weights are zero")]
    AllWeightsZero,
    #[error("unknown user type: {0}")]
    UnknownType(String),
}

/// One user-type definition and its current live instance count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PopulationEntry {
    pub name: String,
    pub weight: u64,
    pub live: usize,
}

/// The concrete spawn/stop deltas produced by one rebalance call.
///
/// Counts per type are deterministic for a given controller state and
/// target; the order of the action lists is not significant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebalancePlan {
    pub spawn: Vec<(String, usize)>,
    pub stop: Vec<(String, usize)>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.spawn.is_empty() && self.stop.is_empty()
    }
}

/// Keeps the live mix of user types proportional to their configured
/// weights under continuous spawn/kill churn.
///
/// After every [`rebalance`](PopulationController::rebalance) call, each
/// type's live count is within `{floor(p_i * N), ceil(p_i * N)}` for its
/// weight fraction `p_i` and the requested total `N`, and the counts sum to
/// `N` exactly. The two phases below guarantee this regardless of how many
/// successive rebalances have been applied:
///
/// 1. Clamp every type into `[floor(p_i * N), ceil(p_i * N)]` (raising to
///    the floor never overshoots the total, lowering to the ceiling never
///    undershoots it).
/// 2. Settle the remaining difference one unit at a time, spawning into the
///    type with the largest miscount (`p_i * N - live_i`) or stopping from
///    the type with the smallest, breaking ties by stable input order.
pub struct PopulationController {
    entries: Vec<PopulationEntry>,
}

impl PopulationController {
    /// `types` is the `(identifier, weight)` list supplied by the
    /// orchestrator; input order is preserved and used for tie-breaking.
    pub fn new(types: impl IntoIterator<Item = (String, u64)>) -> Self {
        let entries = types
            .into_iter()
            .map(|(name, weight)| PopulationEntry {
                name,
                weight,
                live: 0,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[PopulationEntry] {
        &self.entries
    }

    pub fn live_total(&self) -> usize {
        self.entries.iter().map(|entry| entry.live).sum()
    }

    /// Report a session that died outside a plan (e.g. a fatal task error),
    /// so the next rebalance repairs the mix.
    pub fn mark_stopped(&mut self, name: &str) -> Result<(), PopulationError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.name == name)
            .ok_or_else(|| PopulationError::UnknownType(name.to_owned()))?;
        entry.live = entry.live.saturating_sub(1);
        Ok(())
    }

    /// Compute and apply the spawn/stop deltas that bring the live
    /// population to `target` while preserving proportionality.
    pub fn rebalance(&mut self, target: usize) -> Result<RebalancePlan, PopulationError> {
        if self.entries.is_empty() {
            return Err(PopulationError::Empty);
        }
        let total_weight: u64 = self.entries.iter().map(|entry| entry.weight).sum();
        if total_weight == 0 {
            return Err(PopulationError::AllWeightsZero);
        }

        let before: Vec<usize> = self.entries.iter().map(|entry| entry.live).collect();
        let ideals: Vec<f64> = self
            .entries
            .iter()
            .map(|entry| entry.weight as f64 / total_weight as f64 * target as f64)
            .collect();

        // Phase 1: clamp every type into its [floor, ceil] band.
        for (entry, ideal) in self.entries.iter_mut().zip(&ideals) {
            let floor = ideal.floor() as usize;
            let ceil = ideal.ceil() as usize;
            if entry.live < floor {
                entry.live = floor;
            } else if entry.live > ceil {
                entry.live = ceil;
            }
        }

        // Phase 2: settle the residual one unit at a time by miscount.
        let mut current = self.live_total();
        while current < target {
            let next = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.weight > 0)
                .max_by(|(i, a), (j, b)| {
                    let miss_a = ideals[*i] - a.live as f64;
                    let miss_b = ideals[*j] - b.live as f64;
                    miss_a
                        .partial_cmp(&miss_b)
                        .expect("miscount is finite")
                        // On equal miscount, prefer the earlier input index.
                        .then(j.cmp(i))
                })
                .map(|(i, _)| i)
                .expect("at least one weighted type");
            self.entries[next].live += 1;
            current += 1;
        }
        while current > target {
            let next = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.live > 0)
                .min_by(|(i, a), (j, b)| {
                    let miss_a = ideals[*i] - a.live as f64;
                    let miss_b = ideals[*j] - b.live as f64;
                    miss_a
                        .partial_cmp(&miss_b)
                        .expect("miscount is finite")
                        .then(i.cmp(j))
                })
                .map(|(i, _)| i)
                .expect("live total is positive");
            self.entries[next].live -= 1;
            current -= 1;
        }

        let mut plan = RebalancePlan::default();
        for (entry, was) in self.entries.iter().zip(&before) {
            if entry.live > *was {
                plan.spawn.push((entry.name.clone(), entry.live - was));
            } else if entry.live < *was {
                plan.stop.push((entry.name.clone(), was - entry.live));
            }
        }
        tracing::debug!(
            target = target,
            spawn = plan.spawn.len(),
            stop = plan.stop.len(),
            "rebalanced population"
        );
        Ok(plan)
    }
}
