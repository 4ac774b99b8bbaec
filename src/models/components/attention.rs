//! Building blocks shared by causal self-attention implementations.

use candle_core::{DType, Device, Result, Tensor, D};

/// Repeats a key or value tensor for grouped query attention.
/// The input tensor should have a shape `(batch, num_kv_heads, seq_len, head_dim)`.
pub fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (b_sz, n_kv_head, seq_len, head_dim) = xs.dims4()?;
    // Concatenating avoids a strided copy through broadcast.
    Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((b_sz, n_kv_head * n_rep, seq_len, head_dim))
}

/// Growable key/value cache for one attention layer.
///
/// Keys and values are concatenated along the sequence dimension, so the
/// cache holds exactly as many positions as have been fed.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    keys: Option<Tensor>,
    values: Option<Tensor>,
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `(batch, heads, seq_len, head_dim)` keys and values and return
    /// the full cached tensors.
    pub fn append(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor)> {
        let keys = match &self.keys {
            Some(prev) => Tensor::cat(&[prev, keys], 2)?,
            None => keys.clone(),
        };
        let values = match &self.values {
            Some(prev) => Tensor::cat(&[prev, values], 2)?,
            None => values.clone(),
        };
        self.keys = Some(keys.clone());
        self.values = Some(values.clone());
        Ok((keys, values))
    }

    /// Number of cached positions.
    pub fn len(&self) -> usize {
        self.keys
            .as_ref()
            .and_then(|k| k.dim(2).ok())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.keys = None;
        self.values = None;
    }
}

/// Precomputed rotary position embedding tables (rotate-half layout).
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq_len = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, inv_freq_len), device)?;
        let positions = Tensor::arange(0u32, max_seq_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_seq_len, 1))?;
        let angles = positions.matmul(&inv_freq)?;

        Ok(Self {
            cos: angles.cos()?,
            sin: angles.sin()?,
        })
    }

    /// Rotate queries and keys shaped `(batch, heads, seq_len, head_dim)`
    /// starting at absolute position `offset`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, offset, seq_len)?.to_dtype(q.dtype())?;
        let sin = self.sin.narrow(0, offset, seq_len)?.to_dtype(q.dtype())?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Additive causal mask of shape `(1, 1, seq_len, offset + seq_len)`: zero
/// where a query may attend, negative infinity for future positions.
pub fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let total_len = offset + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|row| {
            (0..total_len).map(move |col| {
                if col > row + offset {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)?
        .unsqueeze(0)?
        .unsqueeze(0)
}

/// Scaled dot-product attention over `(batch, heads, seq, head_dim)` tensors.
pub fn scaled_dot_product(
    queries: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    mask: Option<&Tensor>,
) -> Result<Tensor> {
    let head_dim = queries.dim(D::Minus1)?;
    let scale = (head_dim as f64).sqrt().recip();
    let mut scores = (queries.matmul(&keys.t()?)? * scale)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(mask)?;
    }
    let probs = candle_nn::ops::softmax_last_dim(&scores)?;
    probs.matmul(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_cache_grows_along_sequence() -> Result<()> {
        let device = Device::Cpu;
        let mut cache = KvCache::new();
        assert!(cache.is_empty());

        let step = Tensor::zeros((1, 2, 3, 4), DType::F32, &device)?;
        cache.append(&step, &step)?;
        let one = Tensor::zeros((1, 2, 1, 4), DType::F32, &device)?;
        let (k, v) = cache.append(&one, &one)?;

        assert_eq!(k.dims(), &[1, 2, 4, 4]);
        assert_eq!(v.dims(), &[1, 2, 4, 4]);
        assert_eq!(cache.len(), 4);

        cache.reset();
        assert_eq!(cache.len(), 0);
        Ok(())
    }

    #[test]
    fn test_repeat_kv_expands_heads() -> Result<()> {
        let xs = Tensor::zeros((1, 2, 5, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(repeat_kv(xs, 3)?.dims(), &[1, 6, 5, 8]);
        Ok(())
    }

    #[test]
    fn test_causal_mask_respects_offset() -> Result<()> {
        let mask = causal_mask(2, 3, &Device::Cpu)?;
        assert_eq!(mask.dims(), &[1, 1, 2, 5]);

        let rows = mask.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(rows[0][3], 0.0);
        assert_eq!(rows[0][4], f32::NEG_INFINITY);
        assert!(rows[1].iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn test_rotary_position_zero_is_identity() -> Result<()> {
        let device = Device::Cpu;
        let rope = RotaryEmbedding::new(4, 8, 10_000.0, &device)?;
        let q = Tensor::new(&[1f32, 2., 3., 4.], &device)?.reshape((1, 1, 1, 4))?;

        let (rotated, _) = rope.apply(&q, &q, 0)?;
        assert_eq!(rotated.flatten_all()?.to_vec1::<f32>()?, vec![1., 2., 3., 4.]);
        Ok(())
    }
}
