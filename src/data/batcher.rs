// ============================================================
// Layer 4: Spectrum Batcher
// ============================================================
// Groups dataset records into batches for the model.
//
// Ordering:
//   - validation / test / predict read the store in storage
//     order, so two passes always yield identical batches
//   - training streams through a bounded shuffle buffer
//
// How the shuffle buffer works:
//   The buffer is filled to `capacity` records. From then on,
//   each incoming record replaces a uniformly chosen buffered
//   record, which is emitted. When the input is exhausted the
//   remaining buffer is drained in random order. Memory stays
//   O(capacity) no matter how large the store is, and with an
//   explicit seed the order is fully reproducible.
//
//   Each epoch derives its generator from seed + epoch so
//   consecutive epochs see different (but reproducible) orders.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::dataset::SpectrumDataset;
use crate::domain::error::Result;
use crate::domain::spectrum::SpectrumRecord;
use crate::infra::store::StoreIter;

// ─── SpectrumBatch ────────────────────────────────────────────────────────────
/// A batch of spectra ready for the model forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumBatch {
    pub spectra: Vec<SpectrumRecord>,
}

impl SpectrumBatch {
    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    /// Ground-truth peptides, present only when every spectrum carries one.
    pub fn annotations(&self) -> Option<Vec<&str>> {
        self.spectra
            .iter()
            .map(|s| s.annotation.as_deref())
            .collect()
    }
}

// ─── ShuffleBuffer ────────────────────────────────────────────────────────────
/// Bounded reservoir that shuffles any iterator in O(capacity) memory.
pub struct ShuffleBuffer<I: Iterator> {
    inner: I,
    buffer: Vec<I::Item>,
    capacity: usize,
    rng: StdRng,
    exhausted: bool,
}

impl<I: Iterator> ShuffleBuffer<I> {
    pub fn new(inner: I, capacity: usize, rng: StdRng) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buffer: Vec::with_capacity(capacity),
            capacity,
            rng,
            exhausted: false,
        }
    }
}

impl<I: Iterator> Iterator for ShuffleBuffer<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        // ── Fill ──
        while !self.exhausted && self.buffer.len() < self.capacity {
            match self.inner.next() {
                Some(item) => self.buffer.push(item),
                None => self.exhausted = true,
            }
        }
        if self.buffer.is_empty() {
            return None;
        }

        // ── Emit one, refill its slot ──
        let i = self.rng.gen_range(0..self.buffer.len());
        let out = self.buffer.swap_remove(i);
        if !self.exhausted {
            match self.inner.next() {
                Some(item) => self.buffer.push(item),
                None => self.exhausted = true,
            }
        }
        Some(out)
    }
}

// ─── BatchSource ──────────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShuffleConfig {
    pub capacity: usize,
    /// `None` draws fresh entropy for every epoch.
    pub seed: Option<u64>,
}

/// Yields batches over a dataset, optionally shuffled.
pub struct BatchSource<'a> {
    dataset: &'a SpectrumDataset,
    batch_size: usize,
    shuffle: Option<ShuffleConfig>,
}

impl<'a> BatchSource<'a> {
    pub fn new(dataset: &'a SpectrumDataset, shuffle: Option<ShuffleConfig>) -> Self {
        Self {
            dataset,
            batch_size: dataset.batch_size(),
            shuffle,
        }
    }

    pub fn dataset(&self) -> &SpectrumDataset {
        self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle.is_some()
    }

    /// Number of batches per pass.
    pub fn n_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Batches for one epoch.
    pub fn iter(&self, epoch: usize) -> Result<Batches> {
        let records = self.dataset.iter()?;
        let records: Box<dyn Iterator<Item = Result<SpectrumRecord>>> = match self.shuffle {
            None => Box::new(records),
            Some(cfg) => {
                let rng = match cfg.seed {
                    Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
                    None => StdRng::from_entropy(),
                };
                Box::new(ShuffleBuffer::<StoreIter>::new(records, cfg.capacity, rng))
            }
        };
        Ok(Batches {
            records,
            batch_size: self.batch_size,
            failed: false,
        })
    }
}

/// Iterator over the batches of one epoch.
pub struct Batches {
    records: Box<dyn Iterator<Item = Result<SpectrumRecord>>>,
    batch_size: usize,
    failed: bool,
}

impl Iterator for Batches {
    type Item = Result<SpectrumBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let mut spectra = Vec::with_capacity(self.batch_size);
        for record in self.records.by_ref() {
            match record {
                Ok(r) => spectra.push(r),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
            if spectra.len() == self.batch_size {
                break;
            }
        }
        if spectra.is_empty() {
            None
        } else {
            Some(Ok(SpectrumBatch { spectra }))
        }
    }
}
