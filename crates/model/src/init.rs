//! Weight initialization policies.
//!
//! Weights are sampled on construction from one of the supported
//! distributions; biases are always zeroed afterwards regardless of the
//! distribution. The orthogonal basis is built with modified Gram-Schmidt on
//! the host since candle exposes no QR decomposition.

use candle_core::{Device, Result, Tensor};

use crate::config::InitDistribution;

/// Samples a `(rows, cols)` weight matrix from `distribution` scaled by
/// `scale`.
pub fn sample_weight(
    distribution: InitDistribution,
    scale: f64,
    rows: usize,
    cols: usize,
    device: &Device,
) -> Result<Tensor> {
    match distribution {
        InitDistribution::Uniform => {
            Tensor::rand(-scale as f32, scale as f32, (rows, cols), device)
        }
        InitDistribution::Normal => Tensor::randn(0f32, scale as f32, (rows, cols), device),
        InitDistribution::Orthogonal => orthogonal_weight(rows, cols, scale, device),
        InitDistribution::Constant => Tensor::full(scale as f32, (rows, cols), device),
    }
}

/// Builds a `(rows, cols)` matrix whose shorter dimension is an orthonormal
/// system, multiplied by `scale`.
pub fn orthogonal_weight(rows: usize, cols: usize, scale: f64, device: &Device) -> Result<Tensor> {
    let transpose = rows < cols;
    let (tall, slim) = if transpose { (cols, rows) } else { (rows, cols) };

    let seed = Tensor::randn(0f32, 1f32, (tall, slim), device)?;
    let mut columns: Vec<Vec<f32>> = transpose_to_columns(&seed.to_vec2::<f32>()?, tall, slim);

    // Modified Gram-Schmidt over the columns of the tall matrix.
    for j in 0..slim {
        for k in 0..j {
            let proj = dot(&columns[j], &columns[k]);
            for i in 0..tall {
                columns[j][i] -= proj * columns[k][i];
            }
        }
        let norm = dot(&columns[j], &columns[j]).sqrt();
        // Degenerate draws are vanishingly rare; fall back to a unit axis.
        if norm < 1e-6 {
            for i in 0..tall {
                columns[j][i] = if i == j { 1.0 } else { 0.0 };
            }
        } else {
            for i in 0..tall {
                columns[j][i] /= norm;
            }
        }
    }

    let mut flat = vec![0f32; rows * cols];
    for j in 0..slim {
        for i in 0..tall {
            let (r, c) = if transpose { (j, i) } else { (i, j) };
            flat[r * cols + c] = columns[j][i] * scale as f32;
        }
    }
    Tensor::from_vec(flat, (rows, cols), device)
}

fn transpose_to_columns(rows: &[Vec<f32>], tall: usize, slim: usize) -> Vec<Vec<f32>> {
    let mut columns = vec![vec![0f32; tall]; slim];
    for (i, row) in rows.iter().enumerate() {
        for j in 0..slim {
            columns[j][i] = row[j];
        }
    }
    columns
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
