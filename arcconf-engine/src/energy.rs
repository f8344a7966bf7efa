//! Fixed-point audio frame energy
//!
//! Scaled sum-of-squares over one PCM block. The right-shift is derived
//! from the loudest sample so the running sum fits a signed 32-bit
//! accumulator for any 16-bit input block.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


/// Redundant sign bits of `a` (norm): how far left `a` can be shifted
/// without losing magnitude bits. Zero for zero input.
fn norm_w32(a: i32) -> u32 {
    if a == 0 {
        return 0;
    }
    let v = if a < 0 { !a } else { a };
    (v.leading_zeros()).saturating_sub(1)
}

/// Number of bits needed to represent `n`
fn size_in_bits(n: u32) -> u32 {
    32 - n.leading_zeros()
}

/// Shift amount that keeps `Σ sample²` within i32 for this block: bits
/// needed for the block length, minus the headroom left by the loudest
/// sample squared, clamped at zero.
pub fn scaling_square_shift(block: &[i16]) -> u32 {
    let length_bits = size_in_bits(block.len() as u32);
    let smax = block
        .iter()
        .map(|s| (*s as i32).abs())
        .max()
        .unwrap_or(0);
    if smax == 0 {
        return 0;
    }
    let headroom = norm_w32(smax * smax);
    if headroom > length_bits {
        0
    } else {
        length_bits - headroom
    }
}

/// Energy of one PCM block: `Σ sample² >> shift`.
///
/// All-zero input yields 0; a block with a single full-scale sample yields
/// that sample squared shifted by the block-length scaling.
pub fn frame_energy(block: &[i16]) -> i32 {
    let shift = scaling_square_shift(block);
    let mut energy: i32 = 0;
    for sample in block {
        let s = *sample as i32;
        energy += (s * s) >> shift;
    }
    energy
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silence_is_zero() {
        let block = [0i16; 480];
        assert_eq!(frame_energy(&block), 0);
    }

    #[test]
    fn test_single_max_sample() {
        let mut block = [0i16; 480];
        block[17] = i16::MAX;
        let shift = scaling_square_shift(&block);
        let expected = ((i16::MAX as i32) * (i16::MAX as i32)) >> shift;
        assert_eq!(frame_energy(&block), expected);
        assert!(expected > 0);
    }

    #[test]
    fn test_full_scale_block_does_not_overflow() {
        // Worst case: every sample at the 16-bit extremes
        let mut block = [i16::MAX; 480];
        for (i, s) in block.iter_mut().enumerate() {
            if i % 2 == 0 {
                *s = i16::MIN;
            }
        }
        let energy = frame_energy(&block);
        assert!(energy > 0);
        // i32 sum never wrapped: recompute in i64 and compare
        let shift = scaling_square_shift(&block);
        let wide: i64 = block
            .iter()
            .map(|s| ((*s as i64) * (*s as i64)) >> shift)
            .sum();
        assert_eq!(energy as i64, wide);
        assert!(wide <= i32::MAX as i64);
    }

    #[test]
    fn test_louder_block_has_more_energy() {
        let quiet = [100i16; 480];
        let loud = [10_000i16; 480];
        assert!(frame_energy(&loud) > frame_energy(&quiet));
    }
}
