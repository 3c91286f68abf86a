//! Capacity schedule and double-hash probing.
//!
//! The table only ever holds a prime number of slots. `PRIMES` is read in
//! pairs: the prime at an odd index is a usable capacity and the prime right
//! before it is that capacity's double-hashing modulus. A table's
//! `capacity_index` therefore takes the values 1, 3, ..., 35 and moves by
//! two on every resize.
//!
//! | Index | Modulus    | Capacity   |
//! |-------|------------|------------|
//! | 1     | 101        | 103        |
//! | 3     | 199        | 211        |
//! | ...   | ...        | ...        |
//! | 35    | 15,200,011 | 15,200,021 |

/// Prime pairs, `(modulus, capacity)` flattened.
pub const PRIMES: [u32; 36] = [
    101, 103, 199, 211, 419, 421, 829, 839, 1637, 1657, 3301, 3307, 6559, 6607, 13217, 13219,
    26437, 26449, 53003, 53017, 109987, 110017, 220009, 220013, 440009, 440023, 880001, 880007,
    1900009, 1900037, 3800021, 3800051, 7600013, 7600031, 15200011, 15200021,
];

/// Capacity index of a freshly created table (103 slots).
pub const INITIAL_CAPACITY_INDEX: u32 = 1;

/// Capacity index of the largest step (15,200,021 slots).
pub const LAST_CAPACITY_INDEX: u32 = 35;

/// Distance between two neighbouring capacity steps in `PRIMES`.
pub const CAPACITY_STEP: u32 = 2;

const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// Whether `index` names a capacity step.
pub const fn is_capacity_index(index: u32) -> bool {
    index >= INITIAL_CAPACITY_INDEX && index <= LAST_CAPACITY_INDEX && index % 2 == 1
}

/// Slot count for a capacity index.
pub const fn capacity(index: u32) -> u32 {
    PRIMES[index as usize]
}

/// Double-hashing modulus paired with a capacity index.
pub const fn hash_prime(index: u32) -> u32 {
    PRIMES[index as usize - 1]
}

/// FNV-1 over the eight native-endian bytes of `key`.
pub const fn fnv1(key: u64) -> u64 {
    let bytes = key.to_ne_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= bytes[i] as u64;
        i += 1;
    }
    hash
}

/// Probe sequence for one key at one capacity step.
///
/// `probe(i) = (fnv1(key) + i * (prime - key % prime)) % capacity`. The hash
/// is reduced modulo the capacity up front so the sum never wraps. With a
/// prime capacity and a step in `1..=prime < capacity`, the first `capacity`
/// probes visit every slot exactly once.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    base: u64,
    step: u64,
    capacity: u64,
}

impl Probe {
    /// Probe sequence for `key` at `capacity_index`.
    pub const fn new(key: u64, capacity_index: u32) -> Self {
        let prime = hash_prime(capacity_index) as u64;
        let capacity = capacity(capacity_index) as u64;
        Self {
            base: fnv1(key) % capacity,
            step: prime - key % prime,
            capacity,
        }
    }

    /// Slot index of probe number `i`.
    pub const fn slot(&self, i: u64) -> usize {
        ((self.base + i * self.step) % self.capacity) as usize
    }

    /// Number of probes in one full cycle.
    pub const fn cycle_len(&self) -> u64 {
        self.capacity
    }

    /// Iterate over one full probe cycle.
    pub fn slots(self) -> impl Iterator<Item = usize> {
        (0..self.cycle_len()).map(move |i| self.slot(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_shape() {
        let steps: Vec<u32> = (INITIAL_CAPACITY_INDEX..=LAST_CAPACITY_INDEX)
            .step_by(CAPACITY_STEP as usize)
            .collect();
        assert_eq!(steps.len(), 18);
        assert_eq!(capacity(INITIAL_CAPACITY_INDEX), 103);
        assert_eq!(capacity(LAST_CAPACITY_INDEX), 15_200_021);

        for index in steps {
            assert!(is_capacity_index(index));
            assert!(hash_prime(index) < capacity(index));
        }
        assert!(PRIMES.windows(2).all(|w| w[0] < w[1]));
        assert!(!is_capacity_index(0));
        assert!(!is_capacity_index(2));
        assert!(!is_capacity_index(37));
    }

    #[test]
    fn test_fnv1_known_values() {
        // FNV-1 of eight zero bytes is the offset basis multiplied eight times
        let mut expected = FNV_OFFSET_BASIS;
        for _ in 0..8 {
            expected = expected.wrapping_mul(FNV_PRIME);
        }
        assert_eq!(fnv1(0), expected);
        assert_ne!(fnv1(1), fnv1(2));
    }

    #[test]
    fn test_probe_zero_is_hash_mod_capacity() {
        let probe = Probe::new(12345, INITIAL_CAPACITY_INDEX);
        assert_eq!(probe.slot(0), (fnv1(12345) % 103) as usize);
    }

    #[test]
    fn test_probe_cycle_covers_every_slot() {
        for key in [1u64, 33, 0xDEAD_BEEF, u64::MAX - 1] {
            for index in [1, 3, 5] {
                let probe = Probe::new(key, index);
                let mut seen = vec![false; capacity(index) as usize];
                for slot in probe.slots() {
                    assert!(!seen[slot], "slot {slot} visited twice");
                    seen[slot] = true;
                }
                assert!(seen.iter().all(|&s| s));
            }
        }
    }

    #[test]
    fn test_probe_matches_exact_arithmetic() {
        for index in [INITIAL_CAPACITY_INDEX, LAST_CAPACITY_INDEX] {
            let c = u128::from(capacity(index));
            let p = u128::from(hash_prime(index));
            for key in [1u64, 0xdead_beef, u64::MAX - 1] {
                let probe = Probe::new(key, index);
                let step = p - u128::from(key) % p;
                for i in [0u64, 1, 2, capacity(index) as u64 - 1] {
                    let expected = (u128::from(fnv1(key)) + u128::from(i) * step) % c;
                    assert_eq!(probe.slot(i) as u128, expected, "key {key:#x} i {i}");
                }
            }
        }
    }

    #[test]
    fn test_probe_step_depends_on_key() {
        let a = Probe::new(101 * 3 + 1, INITIAL_CAPACITY_INDEX);
        let b = Probe::new(101 * 3 + 2, INITIAL_CAPACITY_INDEX);
        assert_ne!(a.step, b.step);
    }
}
