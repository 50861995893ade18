//! Bounded-memory external sort.
//!
//! Items are buffered up to a fixed count. A full buffer is sorted and
//! written to a spill run in a temporary directory. `finish` merges all runs
//! and the residual buffer lazily, holding one item per run in memory.

mod codec;

pub use codec::{
    BamCodec, BamRunReader, BamRunWriter, BincodeCodec, BincodeRunReader, BincodeRunWriter,
    RunCodec, RunReader, RunWriter,
};

use std::cmp::Ordering;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, warn};
use rayon::slice::ParallelSliceMut;
use tempfile::TempDir;

pub struct ExternalSorter<C: RunCodec, F> {
    codec: C,
    compare: F,
    capacity: usize,
    buffer: Vec<C::Item>,
    tmp_dir: Option<PathBuf>,
    spill_dir: Option<TempDir>,
    runs: Vec<PathBuf>,
}

impl<C, F> ExternalSorter<C, F>
where
    C: RunCodec,
    C::Item: Send,
    F: Fn(&C::Item, &C::Item) -> Ordering + Sync,
{
    /// `capacity` is the maximum number of items held in memory.
    pub fn new(codec: C, capacity: usize, compare: F) -> Self {
        let capacity = capacity.max(1);
        Self {
            codec,
            compare,
            capacity,
            buffer: Vec::with_capacity(capacity.min(1 << 20)),
            tmp_dir: None,
            spill_dir: None,
            runs: Vec::new(),
        }
    }

    /// Create spill runs under `dir` instead of the system temporary directory.
    pub fn with_tmp_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.tmp_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn add(&mut self, item: C::Item) -> Result<()> {
        self.buffer.push(item);
        if self.buffer.len() >= self.capacity {
            self.spill()?;
        }
        Ok(())
    }

    /// Number of sorted runs: spilled runs plus a non-empty in-memory buffer.
    pub fn num_runs(&self) -> usize {
        self.runs.len() + usize::from(!self.buffer.is_empty())
    }

    /// Number of items currently held in memory.
    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn sort_buffer(&mut self) {
        let compare = &self.compare;
        self.buffer.par_sort_by(|a, b| compare(a, b));
    }

    fn spill(&mut self) -> Result<()> {
        self.sort_buffer();
        let num_items = self.buffered();

        if self.spill_dir.is_none() {
            let dir = match &self.tmp_dir {
                Some(root) => tempfile::Builder::new().prefix("matefix.").tempdir_in(root),
                None => tempfile::Builder::new().prefix("matefix.").tempdir(),
            }
            .context("cannot create temporary directory for sorting")?;
            debug!("Spilling sorted runs to {}", dir.path().display());
            self.spill_dir = Some(dir);
        }
        let path = self
            .spill_dir
            .as_ref()
            .map(|dir| dir.path().join(format!("run_{:06}", self.runs.len())))
            .context("spill directory is not available")?;

        let file = File::create(&path)
            .with_context(|| format!("cannot create spill run: {}", path.display()))?;
        let mut writer = self.codec.writer(file)?;
        for item in self.buffer.drain(..) {
            writer
                .write_item(&item)
                .with_context(|| format!("cannot write spill run: {}", path.display()))?;
        }
        writer
            .finish()
            .with_context(|| format!("cannot write spill run: {}", path.display()))?;

        self.runs.push(path);
        debug!("Spilled run {} ({} items)", self.runs.len(), num_items);
        Ok(())
    }

    /// Sort whatever remains in memory and merge it with the spilled runs.
    pub fn finish(mut self) -> Result<SortedIter<C::Item>>
    where
        C::Item: 'static,
        C::Reader: 'static,
        F: 'static,
    {
        self.sort_buffer();
        let Self {
            codec,
            compare,
            buffer,
            spill_dir,
            runs,
            ..
        } = self;

        if runs.is_empty() {
            return Ok(SortedIter {
                inner: Box::new(buffer.into_iter().map(Ok)),
                _spill_dir: spill_dir,
            });
        }

        let mut sources = runs
            .into_iter()
            .map(|path| {
                let file = File::open(&path)
                    .with_context(|| format!("cannot open spill run: {}", path.display()))?;
                let reader = codec.reader(file)?;
                Ok(Run::Disk {
                    reader,
                    path,
                    done: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if !buffer.is_empty() {
            sources.push(Run::Memory(buffer.into_iter()));
        }

        let merged = sources.into_iter().kmerge_by(move |a, b| match (a, b) {
            (Ok(a), Ok(b)) => compare(a, b) == Ordering::Less,
            (Err(_), _) => true,
            (Ok(_), Err(_)) => false,
        });
        Ok(SortedIter {
            inner: Box::new(merged),
            _spill_dir: spill_dir,
        })
    }
}

enum Run<R: RunReader> {
    Memory(std::vec::IntoIter<R::Item>),
    Disk { reader: R, path: PathBuf, done: bool },
}

impl<R: RunReader> Iterator for Run<R> {
    type Item = io::Result<R::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Run::Memory(items) => items.next().map(Ok),
            Run::Disk { reader, path, done } => {
                if *done {
                    return None;
                }
                match reader.read_item() {
                    Ok(Some(item)) => Some(Ok(item)),
                    Ok(None) => {
                        *done = true;
                        if let Err(e) = std::fs::remove_file(&*path) {
                            warn!("cannot remove spill run {}: {}", path.display(), e);
                        }
                        None
                    }
                    Err(e) => {
                        *done = true;
                        Some(Err(e))
                    }
                }
            }
        }
    }
}

/// Globally sorted items. Owns the spill directory, which is removed when the
/// iterator is dropped.
pub struct SortedIter<T> {
    inner: Box<dyn Iterator<Item = io::Result<T>>>,
    _spill_dir: Option<TempDir>,
}

impl<T> Iterator for SortedIter<T> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Item = (String, u32);

    fn by_name(a: &Item, b: &Item) -> Ordering {
        a.0.cmp(&b.0)
    }

    fn sorter(capacity: usize) -> ExternalSorter<BincodeCodec<Item>, fn(&Item, &Item) -> Ordering> {
        ExternalSorter::new(BincodeCodec::new(), capacity, by_name)
    }

    fn names(n: u32) -> Vec<Item> {
        // A fixed permutation of n names with duplicates.
        (0..n).map(|i| (format!("read{}", (i * 7919) % (n / 2 + 1)), i)).collect()
    }

    #[test]
    fn test_in_memory() {
        let mut sorter = sorter(100);
        for item in names(20) {
            sorter.add(item).unwrap();
        }
        assert_eq!(sorter.num_runs(), 1);
        let sorted: Vec<_> = sorter.finish().unwrap().map(Result::unwrap).collect();
        assert_eq!(sorted.len(), 20);
        assert!(sorted.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_spill_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = sorter(7).with_tmp_dir(dir.path());
        let input = names(100);
        for item in input.iter().cloned() {
            sorter.add(item).unwrap();
            assert!(sorter.buffered() < 7);
        }
        assert_eq!(sorter.num_runs(), 15); // ceil(100 / 7)

        let mut sorted: Vec<_> = sorter.finish().unwrap().map(Result::unwrap).collect();
        assert!(sorted.windows(2).all(|w| w[0].0 <= w[1].0));

        let mut expected = input;
        expected.sort();
        sorted.sort();
        assert_eq!(sorted, expected);

        // Spill storage is released.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_exact_multiple_of_capacity() {
        let mut sorter = sorter(5);
        for item in names(20) {
            sorter.add(item).unwrap();
        }
        assert_eq!(sorter.buffered(), 0);
        assert_eq!(sorter.num_runs(), 4);
        assert_eq!(sorter.finish().unwrap().count(), 20);
    }

    #[test]
    fn test_equal_keys_are_adjacent() {
        let mut sorter = sorter(3);
        for (i, name) in ["b", "a", "c", "a", "b", "a", "c", "b"].into_iter().enumerate() {
            sorter.add((name.to_string(), i as u32)).unwrap();
        }
        let keys: Vec<_> = sorter.finish().unwrap().map(|x| x.unwrap().0).collect();
        assert_eq!(keys, vec!["a", "a", "a", "b", "b", "b", "c", "c"]);
    }

    #[test]
    fn test_corrupt_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut sorter = sorter(2).with_tmp_dir(dir.path());
        for item in names(7) {
            sorter.add(item).unwrap();
        }
        assert_eq!(sorter.num_runs(), 4);

        // Cut the first run short.
        let spill_dir = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap().path();
        let mut runs: Vec<_> = std::fs::read_dir(&spill_dir)
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect();
        runs.sort();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&runs[0])
            .unwrap()
            .set_len(3)
            .unwrap();

        let merged: Vec<_> = sorter.finish().unwrap().collect();
        assert!(merged[0].is_err());
        assert_eq!(merged.iter().filter(|item| item.is_err()).count(), 1);
        // The remaining runs still merge in order.
        let good: Vec<_> = merged.iter().filter_map(|item| item.as_ref().ok()).collect();
        assert_eq!(good.len(), 5);
        assert!(good.windows(2).all(|w| w[0].0 <= w[1].0));

        // Spill storage is released.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty() {
        let sorter = sorter(3);
        assert_eq!(sorter.num_runs(), 0);
        assert_eq!(sorter.finish().unwrap().count(), 0);
    }
}
