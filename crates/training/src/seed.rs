use candle_core::Device;
use rand::{rngs::StdRng, SeedableRng};

use crate::TrainingError;

/// Seeds the device generator (dropout) and returns the host generator used
/// for weight initialisation.
pub fn seed_everything(seed: u64, device: &Device) -> Result<StdRng, TrainingError> {
    if device.is_cpu() {
        tracing::debug!(seed, "cpu device has no seedable generator; dropout masks are not reproducible");
    } else {
        device.set_seed(seed).map_err(|err| {
            TrainingError::initialization(format!("failed to seed device: {err}"))
        })?;
    }
    Ok(StdRng::seed_from_u64(seed))
}

/// Generator driving the sample order of one epoch.
pub fn epoch_rng(seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(epoch as u64))
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = seed_everything(21, &Device::Cpu).unwrap();
        let mut b = seed_everything(21, &Device::Cpu).unwrap();
        assert_eq!(a.gen::<u64>(), b.gen::<u64>());
        assert_ne!(epoch_rng(21, 0).gen::<u64>(), epoch_rng(21, 1).gen::<u64>());
    }
}
