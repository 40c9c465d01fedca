//! Module numbers.
//!
//! Each loaded image gets a small positive integer from a dynamically grown
//! bitmap. Index 0 is reserved as a sentinel. The generation counter bumps
//! on every allocation and release, so TLS vectors can tell when the module
//! space moved under them.

use alloc::vec::Vec;

const WORD_BITS: usize = usize::BITS as usize;

pub struct ModuleBitmap {
    bits: Vec<usize>,
    generation: u64,
}

impl ModuleBitmap {
    pub fn new() -> Self {
        Self {
            // Bit 0 reserved.
            bits: alloc::vec![1],
            generation: 0,
        }
    }

    /// First clear bit, set and returned.
    pub fn allocate(&mut self) -> usize {
        for (word_index, word) in self.bits.iter_mut().enumerate() {
            if *word != usize::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                *word |= 1 << bit;
                self.generation += 1;
                return word_index * WORD_BITS + bit;
            }
        }
        let module = self.bits.len() * WORD_BITS;
        self.bits.push(1);
        self.generation += 1;
        module
    }

    pub fn release(&mut self, module: usize) {
        let word = module / WORD_BITS;
        if word < self.bits.len() {
            self.bits[word] &= !(1 << (module % WORD_BITS));
            self.generation += 1;
        }
    }

    pub fn contains(&self, module: usize) -> bool {
        let word = module / WORD_BITS;
        word < self.bits.len() && self.bits[word] & (1 << (module % WORD_BITS)) != 0
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Keep the counter monotonic when the bitmap is rebuilt wholesale
    /// (interpreter-mode renumbering).
    pub fn advance_to(&mut self, floor: u64) {
        if self.generation < floor {
            self.generation = floor;
        }
    }

    /// Highest set module number; 0 when only the sentinel is set.
    pub fn highest(&self) -> usize {
        for (word_index, word) in self.bits.iter().enumerate().rev() {
            if *word != 0 {
                let bit = WORD_BITS - 1 - word.leading_zeros() as usize;
                return word_index * WORD_BITS + bit;
            }
        }
        0
    }

    /// Modules a full TLS vector must cover: highest plus one.
    pub fn module_count(&self) -> usize {
        self.highest() + 1
    }
}

impl Default for ModuleBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_reserved() {
        let mut bitmap = ModuleBitmap::new();
        assert!(bitmap.contains(0));
        assert_eq!(bitmap.allocate(), 1);
    }

    #[test]
    fn first_clear_bit_reused_after_release() {
        let mut bitmap = ModuleBitmap::new();
        assert_eq!(bitmap.allocate(), 1);
        assert_eq!(bitmap.allocate(), 2);
        assert_eq!(bitmap.allocate(), 3);
        bitmap.release(2);
        assert!(!bitmap.contains(2));
        assert_eq!(bitmap.allocate(), 2);
        assert_eq!(bitmap.highest(), 3);
    }

    #[test]
    fn generation_bumps_on_allocate_and_release() {
        let mut bitmap = ModuleBitmap::new();
        let g0 = bitmap.generation();
        bitmap.allocate();
        let g1 = bitmap.generation();
        assert!(g1 > g0);
        bitmap.release(1);
        let g2 = bitmap.generation();
        assert!(g2 > g1);
        bitmap.allocate();
        assert!(bitmap.generation() > g2);
    }

    #[test]
    fn grows_past_one_word() {
        let mut bitmap = ModuleBitmap::new();
        for expected in 1..WORD_BITS * 2 {
            assert_eq!(bitmap.allocate(), expected);
        }
        assert_eq!(bitmap.module_count(), WORD_BITS * 2);
    }
}
