use candle_core::Tensor;

use crate::error::{DiffusionError, Result};

/// Precomputed routing of one stage handoff.
///
/// A stage produces its outputs in emission order; the next stage declares
/// its input slots in its own order. The plan is the permutation between the
/// two, resolved once at construction so each call is a plain reindex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPlan {
    /// `order[slot]` is the produced index feeding that slot.
    order: Vec<usize>,
}

impl FeedPlan {
    /// Match each declared slot to the first unclaimed produced tensor of the
    /// same shape, in slot order. Slots that share a shape are therefore
    /// paired with produced tensors in emission order, which is why callers
    /// declare same-shaped slots in that order.
    pub fn by_shape(produced: &[Vec<usize>], slots: &[Vec<usize>]) -> Result<Self> {
        if produced.len() != slots.len() {
            return Err(DiffusionError::Routing(format!(
                "{} tensors produced for {} slots",
                produced.len(),
                slots.len()
            )));
        }
        let mut claimed = vec![false; produced.len()];
        let mut order = Vec::with_capacity(slots.len());
        for slot in slots {
            let found = produced
                .iter()
                .enumerate()
                .find(|(i, shape)| !claimed[*i] && *shape == slot);
            match found {
                Some((i, _)) => {
                    claimed[i] = true;
                    order.push(i);
                }
                None => {
                    return Err(DiffusionError::Routing(format!(
                        "no unclaimed tensor of shape {slot:?}"
                    )));
                }
            }
        }
        Ok(Self { order })
    }

    /// Build a plan from an explicit slot-to-produced-index map.
    pub fn by_index(order: Vec<usize>) -> Result<Self> {
        let mut seen = vec![false; order.len()];
        for &i in &order {
            if i >= order.len() || seen[i] {
                return Err(DiffusionError::Routing(format!(
                    "index map {order:?} is not a permutation"
                )));
            }
            seen[i] = true;
        }
        Ok(Self { order })
    }

    /// Reorder produced tensors into slot order.
    pub fn route(&self, produced: Vec<Tensor>) -> Result<Vec<Tensor>> {
        if produced.len() != self.order.len() {
            return Err(DiffusionError::Routing(format!(
                "{} tensors produced, plan routes {}",
                produced.len(),
                self.order.len()
            )));
        }
        let mut pool: Vec<Option<Tensor>> = produced.into_iter().map(Some).collect();
        let mut routed = Vec::with_capacity(self.order.len());
        for &i in &self.order {
            match pool[i].take() {
                Some(t) => routed.push(t),
                None => {
                    return Err(DiffusionError::Routing(format!(
                        "produced index {i} claimed twice"
                    )));
                }
            }
        }
        Ok(routed)
    }

    #[cfg(test)]
    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_matching_is_stable_for_duplicates() {
        let produced = vec![vec![1, 2], vec![1, 3], vec![1, 2], vec![4]];
        let slots = vec![vec![4], vec![1, 2], vec![1, 2], vec![1, 3]];
        let plan = FeedPlan::by_shape(&produced, &slots).unwrap();
        assert_eq!(plan.order(), [3, 0, 2, 1]);
    }

    #[test]
    fn shape_matching_rejects_missing_shapes() {
        let produced = vec![vec![1, 2]];
        let slots = vec![vec![2, 1]];
        assert!(matches!(
            FeedPlan::by_shape(&produced, &slots),
            Err(DiffusionError::Routing(_))
        ));
    }

    #[test]
    fn index_plans_must_be_permutations() {
        assert!(FeedPlan::by_index(vec![2, 0, 1]).is_ok());
        assert!(FeedPlan::by_index(vec![0, 0, 1]).is_err());
        assert!(FeedPlan::by_index(vec![0, 3]).is_err());
    }

    #[test]
    fn routing_reorders_tensors() {
        let device = Device::Cpu;
        let a = Tensor::zeros(2, candle_core::DType::F32, &device).unwrap();
        let b = Tensor::ones(3, candle_core::DType::F32, &device).unwrap();
        let plan = FeedPlan::by_index(vec![1, 0]).unwrap();
        let routed = plan.route(vec![a, b]).unwrap();
        assert_eq!(routed[0].dims(), [3]);
        assert_eq!(routed[1].dims(), [2]);
    }
}
