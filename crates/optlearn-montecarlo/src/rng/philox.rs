//! Philox counter-based PRNG.
//!
//! Philox was introduced in "Parallel Random Numbers: As Easy as 1, 2, 3"
//! by Salmon et al. (2011).
//!
//! Key properties:
//! - Counter-based: state is just a 128-bit counter and 128-bit key
//! - Statistically excellent: passes all BigCrush tests
//! - Fast on GPU: uses only integer operations, no branches
//! - Reproducible: same counter + key always gives same output

use bytemuck::{Pod, Zeroable};

use super::traits::NormalSource;

/// Philox4x32-10 state (32 bytes, GPU-friendly).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct PhiloxState {
    /// 128-bit counter: block index in words 0-1, stream in words 2-3
    pub counter: [u32; 4],
    /// Seed in words 0-1; words 2-3 are unused and stay zero
    pub key: [u32; 4],
}

// SAFETY: PhiloxState is #[repr(C)] with only primitive types and no padding
unsafe impl Zeroable for PhiloxState {}
unsafe impl Pod for PhiloxState {}

impl PhiloxState {
    /// State for `(seed, stream)` with a zero counter.
    pub fn seeded(seed: u64, stream: u64) -> Self {
        Self {
            counter: [0, 0, (stream & 0xFFFF_FFFF) as u32, (stream >> 32) as u32],
            key: [(seed & 0xFFFF_FFFF) as u32, (seed >> 32) as u32, 0, 0],
        }
    }
}

// Philox round constants
const PHILOX_M4X32_0: u32 = 0xD251_1F53;
const PHILOX_M4X32_1: u32 = 0xCD9E_8D57;
const PHILOX_W32_0: u32 = 0x9E37_79B9;
const PHILOX_W32_1: u32 = 0xBB67_AE85;

/// Single round of Philox mixing.
#[inline]
fn philox_round(ctr: &mut [u32; 4], key: &[u32; 2]) {
    let hi0 = ((ctr[0] as u64 * PHILOX_M4X32_0 as u64) >> 32) as u32;
    let lo0 = ctr[0].wrapping_mul(PHILOX_M4X32_0);
    let hi1 = ((ctr[2] as u64 * PHILOX_M4X32_1 as u64) >> 32) as u32;
    let lo1 = ctr[2].wrapping_mul(PHILOX_M4X32_1);

    ctr[0] = hi1 ^ ctr[1] ^ key[0];
    ctr[1] = lo1;
    ctr[2] = hi0 ^ ctr[3] ^ key[1];
    ctr[3] = lo0;
}

/// Full Philox4x32-10 block: returns four outputs and bumps the counter.
pub fn philox4x32_10(state: &mut PhiloxState) -> [u32; 4] {
    let mut ctr = state.counter;
    let mut key = [state.key[0], state.key[1]];

    for _ in 0..10 {
        philox_round(&mut ctr, &key);
        key[0] = key[0].wrapping_add(PHILOX_W32_0);
        key[1] = key[1].wrapping_add(PHILOX_W32_1);
    }

    state.counter[0] = state.counter[0].wrapping_add(1);
    if state.counter[0] == 0 {
        state.counter[1] = state.counter[1].wrapping_add(1);
        if state.counter[1] == 0 {
            state.counter[2] = state.counter[2].wrapping_add(1);
            if state.counter[2] == 0 {
                state.counter[3] = state.counter[3].wrapping_add(1);
            }
        }
    }

    ctr
}

/// Philox PRNG instance.
///
/// Deliberately not `Clone`: a generator handle has exactly one owner, so two
/// evaluation states can never draw from the same sequence.
#[derive(Debug)]
pub struct PhiloxRng {
    state: PhiloxState,
    /// Buffer for generated values (4 per Philox block)
    buffer: [u32; 4],
    /// Index into buffer
    buffer_idx: usize,
}

impl PhiloxRng {
    /// Create new Philox RNG with seed and stream ID.
    pub fn new(seed: u64, stream: u64) -> Self {
        Self::from_state(PhiloxState::seeded(seed, stream))
    }

    /// Create from existing state.
    pub fn from_state(state: PhiloxState) -> Self {
        Self {
            state,
            buffer: [0; 4],
            buffer_idx: 4,
        }
    }

    /// Current counter/key state (for checkpointing).
    pub fn state(&self) -> PhiloxState {
        self.state
    }

    /// Generate next u32 value.
    pub fn next_u32_raw(&mut self) -> u32 {
        if self.buffer_idx >= 4 {
            self.buffer = philox4x32_10(&mut self.state);
            self.buffer_idx = 0;
        }
        let val = self.buffer[self.buffer_idx];
        self.buffer_idx += 1;
        val
    }

    /// Generate next u64 value from two consecutive u32 outputs.
    pub fn next_u64(&mut self) -> u64 {
        let hi = self.next_u32_raw() as u64;
        let lo = self.next_u32_raw() as u64;
        (hi << 32) | lo
    }

    /// Generate next uniform f64 in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}

impl NormalSource for PhiloxRng {
    fn next_open_uniform(&mut self) -> f64 {
        ((self.next_u64() >> 11) + 1) as f64 * (1.0 / (1u64 << 53) as f64)
    }
}
