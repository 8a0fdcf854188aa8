use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;

/// 64 MiB, igual que el default de SPLIT_SIZE.
pub const DEFAULT_SPLIT_SIZE: u64 = 64 * 1024 * 1024;

/// Rango de bytes [offset, offset + length) de la entrada de un job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Split {
    pub index: u64,
    pub offset: u64,
    pub length: u64,
}

impl Split {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Divide una entrada en splits de tamaño fijo.
/// Función pura del largo de la entrada y del tamaño de split: los ids de
/// tareas map salen del índice, así que tienen que ser estables entre reinicios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPlanner {
    split_size: NonZeroU64,
}

impl SplitPlanner {
    pub fn new(split_size: NonZeroU64) -> Self {
        Self { split_size }
    }

    /// `None` si split_size == 0.
    pub fn with_size(split_size: u64) -> Option<Self> {
        NonZeroU64::new(split_size).map(Self::new)
    }

    pub fn split_size(&self) -> u64 {
        self.split_size.get()
    }

    /// Cantidad de splits para una entrada de `input_len` bytes.
    pub fn count(&self, input_len: u64) -> u64 {
        input_len.div_ceil(self.split_size.get())
    }

    /// Secuencia perezosa de splits cubriendo [0, input_len).
    pub fn plan(&self, input_len: u64) -> Splits {
        Splits {
            input_len,
            split_size: self.split_size.get(),
            next_offset: 0,
            next_index: 0,
        }
    }
}

impl Default for SplitPlanner {
    fn default() -> Self {
        Self::new(NonZeroU64::new(DEFAULT_SPLIT_SIZE).unwrap_or(NonZeroU64::MIN))
    }
}

#[derive(Debug, Clone)]
pub struct Splits {
    input_len: u64,
    split_size: u64,
    next_offset: u64,
    next_index: u64,
}

impl Iterator for Splits {
    type Item = Split;

    fn next(&mut self) -> Option<Split> {
        if self.next_offset >= self.input_len {
            return None;
        }
        let length = self.split_size.min(self.input_len - self.next_offset);
        let split = Split {
            index: self.next_index,
            offset: self.next_offset,
            length,
        };
        self.next_offset += length;
        self.next_index += 1;
        Some(split)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.input_len.saturating_sub(self.next_offset);
        let n = remaining.div_ceil(self.split_size);
        let n = usize::try_from(n).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}
