use candle_core::{Device, Tensor};

use crate::error::{DiffusionError, Result};
use crate::weights::ModelWeights;

const SCHEDULE_RANGE: usize = 1000;
const COEFFICIENT_COUNT: usize = 160;

/// The timestep schedule for one generation: `steps` timesteps evenly spaced
/// over `[1, 1000)`, consumed high to low.
pub struct Scheduler {
    timesteps: Vec<usize>,
    stride: usize,
    coefficients: Vec<f32>,
    device: Device,
}

impl Scheduler {
    pub fn new(weights: &ModelWeights, device: &Device, steps: usize) -> Result<Self> {
        let coefficients = weights.read_f32_values("temb_coefficients", COEFFICIENT_COUNT)?;
        Self::from_parts(coefficients, device, steps)
    }

    fn from_parts(coefficients: Vec<f32>, device: &Device, steps: usize) -> Result<Self> {
        if steps == 0 || steps > SCHEDULE_RANGE {
            return Err(DiffusionError::InvalidRequest(format!(
                "step count must be in 1..={SCHEDULE_RANGE}, got {steps}"
            )));
        }
        let stride = SCHEDULE_RANGE / steps;
        let timesteps = (0..steps).map(|i| 1 + i * stride).collect();
        Ok(Self {
            timesteps,
            stride,
            coefficients,
            device: device.clone(),
        })
    }

    pub fn count(&self) -> usize {
        self.timesteps.len()
    }

    /// Distance between consecutive timesteps; the sampler steps toward
    /// `t - stride`.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// The timesteps one generation consumes, in consumption (descending)
    /// order. With a strength the schedule is cut to its first
    /// `round(steps * strength)` entries, so strength 0 yields no sampling
    /// steps and strength 1 the full schedule.
    pub fn consumed(&self, strength: Option<f32>) -> Vec<usize> {
        let keep = match strength {
            Some(s) => (self.timesteps.len() as f32 * s).round() as usize,
            None => self.timesteps.len(),
        };
        self.timesteps[..keep].iter().rev().copied().collect()
    }

    /// Sinusoidal `[1, 320]` feature for one timestep: the timestep scaled by
    /// 160 fixed frequencies, cosines then sines.
    pub fn time_feature(&self, timestep: usize) -> Result<Tensor> {
        let t = timestep as f32;
        let mut features = Vec::with_capacity(2 * COEFFICIENT_COUNT);
        features.extend(self.coefficients.iter().map(|c| (t * c).cos()));
        features.extend(self.coefficients.iter().map(|c| (t * c).sin()));
        Ok(Tensor::from_vec(
            features,
            (1, 2 * COEFFICIENT_COUNT),
            &self.device,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler(steps: usize) -> Scheduler {
        Scheduler::from_parts(vec![0.5; COEFFICIENT_COUNT], &Device::Cpu, steps).unwrap()
    }

    #[test]
    fn rejects_step_counts_outside_the_schedule_range() {
        for steps in [0, 1001] {
            assert!(matches!(
                Scheduler::from_parts(vec![0.5; COEFFICIENT_COUNT], &Device::Cpu, steps),
                Err(DiffusionError::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn schedule_length_matches_step_count() {
        for steps in [1, 7, 20, 333, 1000] {
            let s = scheduler(steps);
            assert_eq!(s.count(), steps);
            let consumed = s.consumed(None);
            assert_eq!(consumed.len(), steps);
            assert!(consumed.windows(2).all(|w| w[0] > w[1]));
            assert!(consumed.iter().all(|&t| (1..1000).contains(&t)));
        }
    }

    #[test]
    fn strength_cuts_a_prefix_of_the_schedule() {
        let s = scheduler(20);
        assert_eq!(s.consumed(Some(1.0)), s.consumed(None));
        assert!(s.consumed(Some(0.0)).is_empty());

        let partial = s.consumed(Some(0.5));
        assert_eq!(partial.len(), 10);
        // The kept entries are the low end of the range, still descending.
        assert_eq!(partial[0], 1 + 9 * 50);
        assert_eq!(*partial.last().unwrap(), 1);
    }

    #[test]
    fn time_feature_concatenates_cos_and_sin() {
        let s = scheduler(10);
        let f = s.time_feature(0).unwrap();
        assert_eq!(f.dims(), [1, 320]);
        let values = f.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values[..160].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(values[160..].iter().all(|&v| v.abs() < 1e-6));

        let f = s.time_feature(3).unwrap().flatten_all().unwrap();
        let values = f.to_vec1::<f32>().unwrap();
        assert!((values[0] - (1.5f32).cos()).abs() < 1e-6);
        assert!((values[160] - (1.5f32).sin()).abs() < 1e-6);
    }
}
