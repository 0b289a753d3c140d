use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Numerically stable `log(sum(exp(x)))` of a single row.
pub fn log_sum_exp(row: ArrayView1<f32>) -> f32 {
    let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    if !max.is_finite() {
        return max;
    }
    max + row.fold(0.0, |acc, &v| acc + (v - max).exp()).ln()
}

/// Row-wise softmax of `[N, C]` logits.
pub fn softmax_rows(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

/// Elementwise smooth-L1: quadratic below `beta`, linear above. `beta == 0` is plain L1.
pub fn smooth_l1(diff: f32, beta: f32) -> f32 {
    let n = diff.abs();
    if beta > 0.0 && n < beta {
        0.5 * n * n / beta
    } else {
        n - 0.5 * beta
    }
}
