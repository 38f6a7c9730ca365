use rand::Rng;
use std::str::FromStr;

use crate::message::routing::Priority;
use crate::runner::error::WorkerError;

/// Relative weights of the HIGH/MEDIUM/LOW tiers, written as `"10/3/1"`.
///
/// Each poll draws a weighted-random visiting order, so higher tiers are
/// usually served first while lower tiers still get a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityDistribution {
    weights: [u32; 3],
}

impl Default for PriorityDistribution {
    fn default() -> Self {
        Self { weights: [10, 3, 1] }
    }
}

impl FromStr for PriorityDistribution {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(WorkerError::Config(format!(
                "priority distribution must have three parts (high/medium/low): {s:?}"
            )));
        }
        let mut weights = [0u32; 3];
        for (slot, part) in weights.iter_mut().zip(parts) {
            *slot = part.parse().map_err(|e| {
                WorkerError::Config(format!("invalid priority weight {part:?}: {e}"))
            })?;
        }
        if weights.iter().all(|w| *w == 0) {
            return Err(WorkerError::Config(
                "priority distribution needs at least one non-zero weight".to_string(),
            ));
        }
        Ok(Self { weights })
    }
}

impl PriorityDistribution {
    pub fn weight(&self, priority: Priority) -> u32 {
        self.weights[priority.index()]
    }

    /// Draw the order in which tiers are polled. Zero-weight tiers always come last.
    pub fn visiting_order<R: Rng + ?Sized>(&self, rng: &mut R) -> [Priority; 3] {
        let mut remaining: Vec<Priority> = Priority::ALL.to_vec();
        let mut order = Priority::ALL;
        for slot in order.iter_mut() {
            let total: u64 = remaining.iter().map(|p| u64::from(self.weight(*p))).sum();
            let mut chosen = 0;
            if total > 0 {
                let mut pick = rng.gen_range(0..total);
                for (i, p) in remaining.iter().enumerate() {
                    let w = u64::from(self.weight(*p));
                    if pick < w {
                        chosen = i;
                        break;
                    }
                    pick -= w;
                }
            }
            *slot = remaining.remove(chosen);
        }
        order
    }
}
