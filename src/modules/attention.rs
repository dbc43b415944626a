//! Attention kernels used by the reference hooks
//!
//! Tensors are `[rows, tokens, channels]`: one row per frame and batch copy,
//! channels acting as the head dimension.
//!
//! Supports memory-efficient sliced attention for long token sequences.

use burn::prelude::*;
use burn::tensor::activation::softmax;

/// Scaled dot-product attention.
///
/// With `slice_size > 0` queries are processed in chunks of that many tokens
/// against all keys, which bounds the size of the score matrix.
pub fn scaled_attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    slice_size: usize,
) -> Tensor<B, 3> {
    sliced(q, slice_size, |q| {
        let scale = attention_scale(&q);
        let attn = softmax(q.matmul(k.clone().transpose()) * scale, 2);
        attn.matmul(v.clone())
    })
}

/// Attention over the row's own tokens joined with reference tokens.
///
/// Reference logits are offset by `ln(ref_weight)`, so `ref_weight` scales
/// the attention mass the reference receives. A weight of zero reduces to
/// [`scaled_attention`].
pub fn joint_attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    k_ref: Tensor<B, 3>,
    v_ref: Tensor<B, 3>,
    ref_weight: f32,
    slice_size: usize,
) -> Tensor<B, 3> {
    if ref_weight <= 0.0 {
        return scaled_attention(q, k, v, slice_size);
    }

    let bias = ref_weight.ln();
    let values = Tensor::cat(vec![v, v_ref], 1);
    sliced(q, slice_size, |q| {
        let scale = attention_scale(&q);
        let own = q.clone().matmul(k.clone().transpose()) * scale;
        let reference = q.matmul(k_ref.clone().transpose()) * scale + bias;
        let attn = softmax(Tensor::cat(vec![own, reference], 2), 2);
        attn.matmul(values.clone())
    })
}

fn attention_scale<B: Backend>(q: &Tensor<B, 3>) -> f32 {
    let [_, _, dim] = q.dims();
    1.0 / (dim as f32).sqrt()
}

/// Run `attend` over query chunks along the token axis
fn sliced<B: Backend, F>(q: Tensor<B, 3>, slice_size: usize, attend: F) -> Tensor<B, 3>
where
    F: Fn(Tensor<B, 3>) -> Tensor<B, 3>,
{
    let [_, seq_len, _] = q.dims();
    if slice_size == 0 || seq_len <= slice_size {
        return attend(q);
    }

    let outputs: Vec<Tensor<B, 3>> = (0..seq_len)
        .step_by(slice_size)
        .map(|start| {
            let len = slice_size.min(seq_len - start);
            attend(q.clone().narrow(1, start, len))
        })
        .collect();

    Tensor::cat(outputs, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn values(tensor: Tensor<TestBackend, 3>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{a} != {e}");
        }
    }

    #[test]
    fn test_zero_queries_average_values() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 3>::zeros([1, 2, 2], &device);
        let k = Tensor::<TestBackend, 3>::from_floats([[[0.3, -1.0], [2.0, 0.5]]], &device);
        let v = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [3.0, 2.0]]], &device);

        let out = scaled_attention(q, k, v, 0);
        assert_close(&values(out), &[2.0, 1.0, 2.0, 1.0]);
    }

    #[test]
    fn test_sliced_matches_full() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 3>::from_floats(
            [[[0.1, 0.2], [0.5, -0.3], [1.0, 0.0], [-0.7, 0.4], [0.2, 0.9]]],
            &device,
        );
        let k = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]]], &device);
        let v = Tensor::<TestBackend, 3>::from_floats([[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]], &device);

        let full = scaled_attention(q.clone(), k.clone(), v.clone(), 0);
        let chunked = scaled_attention(q, k, v, 2);
        assert_eq!(chunked.dims(), [1, 5, 2]);
        assert_close(&values(chunked), &values(full));
    }

    #[test]
    fn test_joint_attention_without_reference_weight() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 3>::from_floats([[[0.4, -0.2]]], &device);
        let k = Tensor::<TestBackend, 3>::from_floats([[[1.0, 0.0], [0.0, 1.0]]], &device);
        let v = Tensor::<TestBackend, 3>::from_floats([[[1.0, 1.0], [2.0, 0.0]]], &device);
        let k_ref = Tensor::<TestBackend, 3>::from_floats([[[5.0, 5.0]]], &device);
        let v_ref = Tensor::<TestBackend, 3>::from_floats([[[100.0, 100.0]]], &device);

        let plain = scaled_attention(q.clone(), k.clone(), v.clone(), 0);
        let joint = joint_attention(q, k, v, k_ref, v_ref, 0.0, 0);
        assert_close(&values(joint), &values(plain));
    }

    #[test]
    fn test_joint_attention_spreads_over_reference() {
        let device = Default::default();
        let q = Tensor::<TestBackend, 3>::zeros([1, 1, 2], &device);
        let k = Tensor::<TestBackend, 3>::zeros([1, 1, 2], &device);
        let v = Tensor::<TestBackend, 3>::from_floats([[[0.0, 0.0]]], &device);
        let k_ref = Tensor::<TestBackend, 3>::zeros([1, 1, 2], &device);
        let v_ref = Tensor::<TestBackend, 3>::from_floats([[[4.0, 2.0]]], &device);

        // equal logits with unit weight: half of the mass goes to the reference
        let out = joint_attention(q.clone(), k.clone(), v.clone(), k_ref.clone(), v_ref.clone(), 1.0, 0);
        assert_close(&values(out), &[2.0, 1.0]);

        // ln(1/3) offset: a quarter of the mass goes to the reference
        let out = joint_attention(q, k, v, k_ref, v_ref, 1.0 / 3.0, 0);
        assert_close(&values(out), &[1.0, 0.5]);
    }
}
