use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::VectorError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    L2,
    Cosine,
    InnerProduct,
}

impl FromStr for Metric {
    type Err = VectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            "inner_product" | "ip" => Ok(Metric::InnerProduct),
            other => Err(VectorError::config(format!("unknown metric `{other}`"))),
        }
    }
}

/// Which accelerated kernel family is active for this process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionSet {
    Scalar,
    Avx2,
}

/// Immutable descriptor of the vector-instruction extensions available
/// on this machine. Probed once, then only read.
#[derive(Clone, Copy, Debug)]
pub struct CpuCapability {
    pub avx2: bool,
}

impl CpuCapability {
    fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self {
                avx2: std::is_x86_feature_detected!("avx2"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self { avx2: false }
        }
    }

    pub fn active(&self) -> InstructionSet {
        if self.avx2 {
            InstructionSet::Avx2
        } else {
            InstructionSet::Scalar
        }
    }
}

static CAPABILITY: OnceLock<CpuCapability> = OnceLock::new();

pub fn capability() -> &'static CpuCapability {
    CAPABILITY.get_or_init(CpuCapability::detect)
}

/// Distance for the configured metric. Smaller is always better:
/// L2 is squared Euclidean, cosine is `1 - cos`, inner product is
/// negated so ascending order ranks higher dot products first.
#[inline]
pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    match metric {
        Metric::L2 => l2_sq(a, b),
        Metric::Cosine => {
            let (dot, norm_a, norm_b) = dot_and_norms(a, b);
            if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
            }
        }
        Metric::InnerProduct => -dot(a, b),
    }
}

#[inline]
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if capability().avx2 && a.len() >= 8 {
            unsafe {
                return l2_sq_avx2(a, b);
            }
        }
    }
    l2_sq_scalar(a, b)
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    #[cfg(target_arch = "x86_64")]
    {
        if capability().avx2 && a.len() >= 8 {
            unsafe {
                return dot_avx2(a, b);
            }
        }
    }
    dot_scalar(a, b)
}

#[inline]
pub fn dot_and_norms(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    #[cfg(target_arch = "x86_64")]
    {
        if capability().avx2 && a.len() >= 8 {
            unsafe {
                return accumulate_avx2(a, b);
            }
        }
    }
    accumulate_scalar(a, b)
}

#[inline]
fn l2_sq_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
fn accumulate_scalar(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    (dot, norm_a, norm_b)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn l2_sq_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        let diff = _mm256_sub_ps(va, vb);
        acc = _mm256_add_ps(acc, _mm256_mul_ps(diff, diff));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        let d = a[i] - b[i];
        sum += d * d;
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn dot_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let mut acc = _mm256_setzero_ps();
    let mut i = 0usize;
    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        acc = _mm256_add_ps(acc, _mm256_mul_ps(va, vb));
        i += 8;
    }
    let mut tmp = [0f32; 8];
    _mm256_storeu_ps(tmp.as_mut_ptr(), acc);
    let mut sum = tmp.iter().sum::<f32>();
    while i < a.len() {
        sum += a[i] * b[i];
        i += 1;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn accumulate_avx2(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    use std::arch::x86_64::*;

    let mut dot = _mm256_setzero_ps();
    let mut norm_a = _mm256_setzero_ps();
    let mut norm_b = _mm256_setzero_ps();
    let mut i = 0usize;

    while i + 8 <= a.len() {
        let va = _mm256_loadu_ps(a.as_ptr().add(i));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i));
        dot = _mm256_add_ps(dot, _mm256_mul_ps(va, vb));
        norm_a = _mm256_add_ps(norm_a, _mm256_mul_ps(va, va));
        norm_b = _mm256_add_ps(norm_b, _mm256_mul_ps(vb, vb));
        i += 8;
    }

    let mut dot_tmp = [0f32; 8];
    let mut norm_a_tmp = [0f32; 8];
    let mut norm_b_tmp = [0f32; 8];
    _mm256_storeu_ps(dot_tmp.as_mut_ptr(), dot);
    _mm256_storeu_ps(norm_a_tmp.as_mut_ptr(), norm_a);
    _mm256_storeu_ps(norm_b_tmp.as_mut_ptr(), norm_b);

    let mut dot_sum = dot_tmp.iter().sum::<f32>();
    let mut norm_a_sum = norm_a_tmp.iter().sum::<f32>();
    let mut norm_b_sum = norm_b_tmp.iter().sum::<f32>();

    while i < a.len() {
        let x = a[i];
        let y = b[i];
        dot_sum += x * y;
        norm_a_sum += x * x;
        norm_b_sum += y * y;
        i += 1;
    }

    (dot_sum, norm_a_sum, norm_b_sum)
}
