//! Cached causal attention masks
//!
//! Every question has the same length, so a session only ever needs one
//! or two masks. They are cached by `(seq_len, device, dtype)` and handed
//! out as shallow clones.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard, PoisonError};

type CausalMaskCache = LazyLock<Mutex<HashMap<(usize, usize, DType), Tensor>>>;

static CAUSAL_MASK_CACHE: CausalMaskCache = LazyLock::new(|| Mutex::new(HashMap::new()));

fn cache() -> MutexGuard<'static, HashMap<(usize, usize, DType), Tensor>> {
    // A panic while holding the lock cannot leave a half-written mask behind.
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Assumes a single device per type
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// Entry `(i, j)` is `0.0` when query `i` may attend to key `j` (`j <= i`)
/// and `-inf` otherwise:
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_id(device), dtype);

    if let Some(cached) = cache().get(&key) {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    cache().insert(key, mask.clone());
    Ok(mask)
}

pub fn clear_mask_caches() {
    cache().clear();
}

pub fn mask_cache_size() -> usize {
    cache().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_causal_mask_values() {
        let mask = create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        let blocked: Vec<bool> = data.iter().map(|v| v.is_infinite() && *v < 0.0).collect();
        assert_eq!(
            blocked,
            [false, true, true, false, false, true, false, false, false]
        );
    }

    #[test]
    #[serial]
    fn test_causal_mask_caching() {
        clear_mask_caches();
        assert_eq!(mask_cache_size(), 0);

        let _ = create_causal_mask(22, &Device::Cpu, DType::F32).unwrap();
        let _ = create_causal_mask(22, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 1);

        let _ = create_causal_mask(19, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size(), 2);
    }
}
