//! SIMD dot-product kernels
//!
//! Explicit intrinsics for aarch64 (NEON) and x86_64 (AVX2+FMA), with a scalar
//! fallback that LLVM auto-vectorizes with `-C target-cpu=native`.
//!
//! Each kernel keeps a SIMD-width running sum of element-wise products, reduces
//! it horizontally once, then adds the scalar tail when the length is not a
//! multiple of the lane count.
//!
//! | Platform     | ISA        | Width                  | Functions used                          |
//! |-------------|------------|------------------------|-----------------------------------------|
//! | Apple M1+   | NEON       | 128-bit (4×f32)        | `vld1q_f32`, `vfmaq_f32`, `vaddvq_f32`  |
//! | x86_64+AVX2 | AVX2+FMA   | 256-bit (8×f32)        | `_mm256_loadu_ps`, `_mm256_fmadd_ps`    |
//! | other       | scalar     | 1×f32                  | auto-vectorized iterator                |
//!
//! The i8 kernel multiplies in i32 and accumulates in i64; it has no
//! hand-written variant.

// ============================================================================
// aarch64 NEON intrinsics
// ============================================================================

/// NEON dot product over equal-length slices, 4 floats per step
///
/// # Safety
///
/// Loads only touch full 4-element chunks of the two slices.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
unsafe fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::aarch64::*;

    let ca = a.chunks_exact(4);
    let cb = b.chunks_exact(4);
    let tail = dot_product_scalar(ca.remainder(), cb.remainder());

    let mut acc = vdupq_n_f32(0.0);
    for (x, y) in ca.zip(cb) {
        acc = vfmaq_f32(acc, vld1q_f32(x.as_ptr()), vld1q_f32(y.as_ptr()));
    }
    vaddvq_f32(acc) + tail
}

// ============================================================================
// x86_64 AVX2 intrinsics (runtime feature detection)
// ============================================================================

/// AVX2+FMA dot product over equal-length slices, 8 floats per step
///
/// Mapped records start 8 bytes past a 4-byte aligned offset, so loads are
/// always unaligned.
///
/// # Safety
///
/// The CPU must support AVX2 and FMA. Loads only touch full 8-element chunks.
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
#[inline]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    use std::arch::x86_64::*;

    let ca = a.chunks_exact(8);
    let cb = b.chunks_exact(8);
    let tail = dot_product_scalar(ca.remainder(), cb.remainder());

    let mut acc = _mm256_setzero_ps();
    for (x, y) in ca.zip(cb) {
        acc = _mm256_fmadd_ps(_mm256_loadu_ps(x.as_ptr()), _mm256_loadu_ps(y.as_ptr()), acc);
    }
    horizontal_sum_avx(acc) + tail
}

/// Sum of the eight lanes of `v`
#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
#[inline]
unsafe fn horizontal_sum_avx(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;

    let quad = _mm_add_ps(_mm256_castps256_ps128(v), _mm256_extractf128_ps(v, 1));
    let pair = _mm_add_ps(quad, _mm_movehl_ps(quad, quad));
    _mm_cvtss_f32(_mm_add_ss(pair, _mm_shuffle_ps(pair, pair, 0b01)))
}

// ============================================================================
// Scalar fallback (auto-vectorized by LLVM)
// ============================================================================

#[inline(always)]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ============================================================================
// Public dispatch functions
// ============================================================================

/// Compute dot product of two f32 vectors
///
/// For L2-normalized vectors, this equals cosine similarity.
/// Uses NEON on aarch64, AVX2+FMA on x86_64, or scalar fallback.
///
/// # Panics
///
/// Panics if the slices differ in length.
#[inline(always)]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len(), "Vector length mismatch");

    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: NEON is always available on aarch64
        return unsafe { dot_product_neon(a, b) };
    }

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            // SAFETY: features checked above
            return unsafe { dot_product_avx2(a, b) };
        }
    }

    #[allow(unreachable_code)]
    dot_product_scalar(a, b)
}

/// Compute dot product of two i8 vectors
///
/// Accumulated in i64, so any pair of i8 vectors the process can hold is
/// exact, including custom transforms that emit -128.
#[inline]
pub fn dot_product_i8(a: &[i8], b: &[i8]) -> i64 {
    assert_eq!(a.len(), b.len(), "Vector length mismatch");

    const LANES: usize = 16;
    let ca = a.chunks_exact(LANES);
    let cb = b.chunks_exact(LANES);
    let mut sum: i64 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(x, y)| *x as i64 * *y as i64)
        .sum();

    let mut acc = [0i64; LANES];
    for (x, y) in ca.zip(cb) {
        for lane in 0..LANES {
            acc[lane] += (x[lane] as i32 * y[lane] as i32) as i64;
        }
    }
    sum += acc.iter().sum::<i64>();
    sum
}

/// L2 normalize a vector in place
///
/// After normalization, ||v|| = 1. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = dot_product(v, v).sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// L2 normalize a vector, returning a new vector
pub fn l2_normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    l2_normalize(&mut out);
    out
}
