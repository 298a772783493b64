//! 512-bit batched code scoring.
//!
//! One iteration scores 16 neighbors against 4 sub-codebooks: a 64-byte LUT
//! load covers four 16-entry sub-tables (one per 128-bit lane), a 32-byte
//! code load expands to 64 nibbles, and a per-lane byte shuffle performs all
//! 64 table lookups at once. Lookups widen 8->16 with saturating adds into
//! a 32-lane accumulator, widen again to 32 bits, and leave as a single
//! 16-float store per group.

#![cfg(target_arch = "x86_64")]

/// Score `num_groups` groups of 16 neighbors.
///
/// `lut` is `num_blocks * 64` bytes, `codes` is `num_groups * num_blocks *
/// 32` bytes in the packed group layout, `out` has room for `num_groups *
/// 16` floats.
///
/// # Safety
///
/// Caller must have verified `avx512f` and `avx512bw` support.
#[target_feature(enable = "avx512f,avx512bw")]
pub(crate) unsafe fn group_distance(
    lut: &[u8],
    codes: &[u8],
    num_blocks: usize,
    num_groups: usize,
    scale: f32,
    bias: f32,
    out: &mut [f32],
) {
    use std::arch::x86_64::*;

    debug_assert!(lut.len() >= num_blocks * 64);
    debug_assert!(codes.len() >= num_groups * num_blocks * 32);
    debug_assert!(out.len() >= num_groups * 16);

    unsafe {
        let mut code_ptr = codes.as_ptr();
        let mut dst = out.as_mut_ptr();
        let lo_mask = _mm512_set1_epi16(0x000f);
        let hi_mask = _mm512_set1_epi16(0x00f0);
        let scale_v = _mm512_set1_ps(scale);
        let bias_v = _mm512_set1_ps(bias);

        for _ in 0..num_groups {
            let mut lut_ptr = lut.as_ptr();
            let mut sum = _mm512_setzero_si512();

            for _ in 0..num_blocks {
                let table = _mm512_loadu_si512(lut_ptr as *const _);
                // Touch the codes eight blocks ahead; the hint is harmless
                // past the end of the buffer.
                _mm_prefetch::<{ _MM_HINT_T0 }>(code_ptr.add(32 * 8) as *const i8);

                // 32 code bytes -> 32 u16 lanes, then split each byte into
                // its two nibbles: low byte selects for the even neighbor,
                // high byte for the odd one.
                let packed = _mm512_cvtepu8_epi16(_mm256_loadu_si256(code_ptr as *const _));
                let lo = _mm512_and_si512(packed, lo_mask);
                let hi = _mm512_slli_epi16::<4>(_mm512_and_si512(packed, hi_mask));
                let idx = _mm512_or_si512(lo, hi);

                let picked = _mm512_shuffle_epi8(table, idx);
                sum = _mm512_adds_epu16(
                    sum,
                    _mm512_cvtepu8_epi16(_mm512_extracti64x4_epi64::<0>(picked)),
                );
                sum = _mm512_adds_epu16(
                    sum,
                    _mm512_cvtepu8_epi16(_mm512_extracti64x4_epi64::<1>(picked)),
                );

                lut_ptr = lut_ptr.add(64);
                code_ptr = code_ptr.add(32);
            }

            // Lanes 0..16 and 16..32 hold complementary sub-codebook halves
            // of the same 16 neighbors; widen and fold them together.
            let lo32 = _mm512_cvtepu16_epi32(_mm512_extracti64x4_epi64::<0>(sum));
            let hi32 = _mm512_cvtepu16_epi32(_mm512_extracti64x4_epi64::<1>(sum));
            let mut dist = _mm512_cvtepi32_ps(_mm512_add_epi32(lo32, hi32));
            dist = _mm512_add_ps(_mm512_mul_ps(dist, scale_v), bias_v);
            _mm512_storeu_ps(dst, dist);
            dst = dst.add(16);
        }
    }
}
