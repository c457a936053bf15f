//! Write coalescing for hyperslab containers.
//!
//! Every `put_vara` on a chunked-array container is expensive, more so under
//! collective I/O where all processes take part in each call. The coalescer
//! gathers hyperslabs that are adjacent in linear storage into one buffer
//! and issues a single write per contiguous run.

use crate::container::{SlabContainer, WriteMode};
use crate::error::{Result, VdfError};
use std::sync::Arc;
use tracing::trace;

/// Counters of the writes issued to the container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceStats {
    /// `put_vara` calls received
    pub puts: u64,
    /// Writes issued from the buffer
    pub buffered_writes: u64,
    /// Writes that bypassed the buffer
    pub direct_writes: u64,
}

impl CoalesceStats {
    pub fn total_writes(&self) -> u64 {
        self.buffered_writes + self.direct_writes
    }
}

pub struct WriteCoalescer {
    container: Arc<dyn SlabContainer>,
    var: String,
    /// Dimension lengths, slowest first
    dims: Vec<usize>,
    elem_size: usize,
    /// Buffer capacity in bytes
    capacity: usize,
    mode: WriteMode,
    buf: Vec<u8>,
    /// Start of the buffered hyperslab
    start: Vec<usize>,
    /// Elements buffered
    lcount: usize,
    stats: CoalesceStats,
}

impl WriteCoalescer {
    pub fn new(
        container: Arc<dyn SlabContainer>,
        var: impl Into<String>,
        dims: Vec<usize>,
        elem_size: usize,
        capacity: usize,
        mode: WriteMode,
    ) -> Result<Self> {
        if dims.is_empty() || dims.iter().any(|&d| d == 0) {
            return Err(VdfError::InvalidArgument(format!(
                "coalescer needs non-empty dimensions, got {:?}",
                dims
            )));
        }
        if elem_size == 0 || capacity < elem_size {
            return Err(VdfError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold elements of {} bytes",
                capacity, elem_size
            )));
        }
        let rank = dims.len();
        Ok(Self {
            container,
            var: var.into(),
            dims,
            elem_size,
            capacity,
            mode,
            buf: Vec::with_capacity(capacity),
            start: vec![0; rank],
            lcount: 0,
            stats: CoalesceStats::default(),
        })
    }

    pub fn stats(&self) -> CoalesceStats {
        self.stats
    }

    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    pub fn variable(&self) -> &str {
        &self.var
    }

    /// Queue a hyperslab write; may issue zero, one or two container writes
    pub async fn put_vara(&mut self, start: &[usize], count: &[usize], data: &[u8]) -> Result<()> {
        if start.len() != self.dims.len() || count.len() != self.dims.len() {
            return Err(VdfError::InvalidArgument(format!(
                "hyperslab rank does not match {} dimensions of {}",
                self.dims.len(),
                self.var
            )));
        }
        let (lstart, lcount) = self.linearize(start, count);
        if data.len() != lcount * self.elem_size {
            return Err(VdfError::InvalidArgument(format!(
                "hyperslab of {} elements given {} bytes",
                lcount,
                data.len()
            )));
        }
        if lcount == 0 {
            return Ok(());
        }
        self.stats.puts += 1;

        if !self.contiguous(count) || data.len() > self.capacity {
            // keep container writes in call order
            self.flush().await?;
            trace!(var = %self.var, ?start, ?count, mode = ?self.mode, "direct write");
            self.stats.direct_writes += 1;
            return self
                .container
                .put_vara(&self.var, start, count, data, self.mode)
                .await;
        }

        if !self.buf.is_empty() {
            let (mylstart, _) = self.linearize(&self.start, &self.dims);
            let total = self.lcount + lcount;
            let adjacent = mylstart + self.lcount == lstart;
            let fits = self.buf.len() + data.len() <= self.capacity;
            if !adjacent
                || !fits
                || total > self.max_region(&self.start)
                || !self.describable(&self.start, total)
            {
                self.flush().await?;
            }
        }

        if self.buf.is_empty() {
            self.start.copy_from_slice(start);
            self.lcount = 0;
        }
        self.buf.extend_from_slice(data);
        self.lcount += lcount;
        Ok(())
    }

    /// Write out whatever is buffered as one hyperslab
    pub async fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let count = self.delinearize(&self.start, self.lcount);
        let start = std::mem::replace(&mut self.start, vec![0; self.dims.len()]);
        trace!(
            var = %self.var,
            ?start,
            ?count,
            bytes = self.buf.len(),
            mode = ?self.mode,
            "buffered write"
        );
        let result = self
            .container
            .put_vara(&self.var, &start, &count, &self.buf, self.mode)
            .await;
        self.buf.clear();
        self.lcount = 0;
        self.stats.buffered_writes += 1;
        result
    }

    /// Row-major contiguity: every axis slower than the fastest partial
    /// axis must have count 1.
    pub fn contiguous(&self, count: &[usize]) -> bool {
        let partial = (0..self.dims.len())
            .rev()
            .find(|&i| count[i] != self.dims[i])
            .unwrap_or(0);
        count[..partial].iter().all(|&c| c == 1)
    }

    /// Largest element count one hyperslab starting at `start` can cover
    /// without exceeding the buffer. Scanning stops after the first axis
    /// (from the fastest) with a non-zero start offset.
    pub fn max_region(&self, start: &[usize]) -> usize {
        let max_elems = self.capacity / self.elem_size;
        let mut lcount = 1usize;
        for i in (0..self.dims.len()).rev() {
            let mut d = self.dims[i] - start[i].min(self.dims[i]);
            let room = (max_elems / lcount).max(1);
            if d > room {
                d = room;
            }
            lcount *= d.max(1);
            if start[i] != 0 {
                break;
            }
        }
        lcount
    }

    /// Scalar offset and element count of a hyperslab
    pub fn linearize(&self, start: &[usize], count: &[usize]) -> (usize, usize) {
        let mut lstart = 0;
        let mut lcount = 1;
        let mut stride = 1;
        for i in (0..self.dims.len()).rev() {
            lstart += start[i] * stride;
            lcount *= count[i];
            stride *= self.dims[i];
        }
        (lstart, lcount)
    }

    /// Whether `lcount` elements from `start` form a single hyperslab
    fn describable(&self, start: &[usize], lcount: usize) -> bool {
        let mut rem = lcount;
        for i in (0..self.dims.len()).rev() {
            if rem <= self.dims[i] - start[i] {
                return true;
            }
            if start[i] != 0 || rem % self.dims[i] != 0 {
                return false;
            }
            rem /= self.dims[i];
        }
        rem <= 1
    }

    /// Count vector of `lcount` elements from `start`; the fastest axes
    /// absorb whole rows first.
    pub fn delinearize(&self, start: &[usize], lcount: usize) -> Vec<usize> {
        let mut count = vec![1; self.dims.len()];
        let mut rem = lcount;
        for i in (0..self.dims.len()).rev() {
            if rem <= 1 {
                break;
            }
            if start[i] == 0 && rem > self.dims[i] && rem % self.dims[i] == 0 {
                count[i] = self.dims[i];
                rem /= self.dims[i];
            } else {
                count[i] = rem;
                rem = 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::VarShape;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    type Call = (Vec<usize>, Vec<usize>, Vec<u8>, WriteMode);

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    #[async_trait]
    impl SlabContainer for Recorder {
        async fn define_var(&self, _name: &str, _dims: &[usize], _elem_size: usize) -> Result<()> {
            Ok(())
        }

        async fn var_shape(&self, _name: &str) -> Result<Option<VarShape>> {
            Ok(None)
        }

        async fn put_vara(
            &self,
            _name: &str,
            start: &[usize],
            count: &[usize],
            data: &[u8],
            mode: WriteMode,
        ) -> Result<()> {
            if self.fail {
                return Err(VdfError::StorageBackend("disk full".into()));
            }
            self.calls
                .lock()
                .push((start.to_vec(), count.to_vec(), data.to_vec(), mode));
            Ok(())
        }

        async fn get_vara(&self, _name: &str, _start: &[usize], _count: &[usize]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn coalescer(rec: &Arc<Recorder>, dims: Vec<usize>, capacity: usize) -> WriteCoalescer {
        WriteCoalescer::new(rec.clone(), "v", dims, 1, capacity, WriteMode::Collective).unwrap()
    }

    #[tokio::test]
    async fn test_adjacent_rows_become_one_write() {
        let rec = Arc::new(Recorder::default());
        let mut c = coalescer(&rec, vec![4, 3, 8], 1024);
        for y in 0..3 {
            let row = vec![y as u8; 8];
            c.put_vara(&[1, y, 0], &[1, 1, 8], &row).await.unwrap();
        }
        assert!(rec.calls.lock().is_empty());
        c.flush().await.unwrap();
        c.flush().await.unwrap(); // empty flush is a no-op

        let calls = rec.calls.lock();
        assert_eq!(calls.len(), 1);
        let (start, count, data, mode) = &calls[0];
        assert_eq!(start, &vec![1, 0, 0]);
        assert_eq!(count, &vec![1, 3, 8]);
        assert_eq!(data.len(), 24);
        assert_eq!(data[8], 1);
        assert_eq!(*mode, WriteMode::Collective);
        assert_eq!(c.stats().total_writes(), 1);
    }

    #[tokio::test]
    async fn test_non_contiguous_goes_direct() {
        let rec = Arc::new(Recorder::default());
        let mut c = coalescer(&rec, vec![4, 3, 8], 1024);
        c.put_vara(&[0, 0, 0], &[1, 1, 8], &[0; 8]).await.unwrap();
        // 2x2 patch is not contiguous in row-major storage
        c.put_vara(&[0, 1, 0], &[1, 2, 2], &[9; 4]).await.unwrap();
        {
            let calls = rec.calls.lock();
            assert_eq!(calls.len(), 2);
            assert_eq!(calls[1].1, vec![1, 2, 2]);
        }
        assert_eq!(c.pending_bytes(), 0);
        assert_eq!(c.stats().direct_writes, 1);
        assert_eq!(c.stats().buffered_writes, 1);
    }

    #[tokio::test]
    async fn test_gap_and_overflow_flush() {
        let rec = Arc::new(Recorder::default());
        let mut c = coalescer(&rec, vec![10, 8], 16);
        c.put_vara(&[0, 0], &[1, 8], &[1; 8]).await.unwrap();
        // not adjacent: flush, then start a new run
        c.put_vara(&[2, 0], &[1, 8], &[2; 8]).await.unwrap();
        assert_eq!(rec.calls.lock().len(), 1);
        c.put_vara(&[3, 0], &[1, 8], &[3; 8]).await.unwrap();
        // buffer is full, the next row overflows it
        c.put_vara(&[4, 0], &[1, 8], &[4; 8]).await.unwrap();
        c.flush().await.unwrap();

        let calls = rec.calls.lock();
        let shapes: Vec<_> = calls.iter().map(|c| (c.0.clone(), c.1.clone())).collect();
        assert_eq!(
            shapes,
            vec![
                (vec![0, 0], vec![1, 8]),
                (vec![2, 0], vec![2, 8]),
                (vec![4, 0], vec![1, 8]),
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_slab_goes_direct() {
        let rec = Arc::new(Recorder::default());
        let mut c = coalescer(&rec, vec![4, 8], 8);
        c.put_vara(&[0, 0], &[2, 8], &[5; 16]).await.unwrap();
        assert_eq!(rec.calls.lock().len(), 1);
        assert_eq!(c.stats().direct_writes, 1);
    }

    #[tokio::test]
    async fn test_partial_rows_stay_describable() {
        let rec = Arc::new(Recorder::default());
        let mut c = coalescer(&rec, vec![4, 16], 64);
        c.put_vara(&[0, 0], &[1, 16], &[0; 16]).await.unwrap();
        // a row and a half is no single hyperslab
        c.put_vara(&[1, 0], &[1, 8], &[1; 8]).await.unwrap();
        c.put_vara(&[1, 8], &[1, 8], &[2; 8]).await.unwrap();
        c.flush().await.unwrap();

        let calls = rec.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!((calls[0].0.clone(), calls[0].1.clone()), (vec![0, 0], vec![1, 16]));
        assert_eq!((calls[1].0.clone(), calls[1].1.clone()), (vec![1, 0], vec![1, 16]));
    }

    #[tokio::test]
    async fn test_failure_propagates() {
        let rec = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let mut c = coalescer(&rec, vec![4, 8], 64);
        c.put_vara(&[0, 0], &[1, 8], &[0; 8]).await.unwrap();
        let err = c.flush().await.unwrap_err();
        assert!(matches!(err, VdfError::StorageBackend(ref m) if m == "disk full"));
        assert_eq!(c.pending_bytes(), 0);
    }

    #[test]
    fn test_contiguity_and_regions() {
        let rec = Arc::new(Recorder::default());
        let c = coalescer(&rec, vec![4, 8, 16], 64);
        assert!(c.contiguous(&[1, 1, 5]));
        assert!(c.contiguous(&[1, 3, 16]));
        assert!(c.contiguous(&[2, 8, 16]));
        assert!(c.contiguous(&[4, 8, 16]));
        assert!(!c.contiguous(&[1, 2, 5]));
        assert!(!c.contiguous(&[2, 3, 16]));

        // buffer caps the region at 64 elements
        assert_eq!(c.max_region(&[0, 0, 0]), 64);
        // a non-zero fastest offset stops the scan
        assert_eq!(c.max_region(&[0, 0, 10]), 6);
        assert_eq!(c.max_region(&[1, 6, 0]), 32);

        assert_eq!(c.linearize(&[1, 2, 3], &[1, 1, 4]), (128 + 32 + 3, 4));
        assert_eq!(c.delinearize(&[0, 2, 0], 48), vec![1, 3, 16]);
        assert_eq!(c.delinearize(&[1, 0, 0], 256), vec![2, 8, 16]);
        assert_eq!(c.delinearize(&[0, 0, 3], 5), vec![1, 1, 5]);
    }
}
