//! A partition of columnar data

use arrow::record_batch::RecordBatch;

/// A partition of data
#[derive(Debug, Clone)]
pub struct Partition {
    /// Partition index
    pub index: usize,
    /// Data in this partition
    pub batches: Vec<RecordBatch>,
}

impl Partition {
    /// Create a new empty partition
    pub fn new(index: usize) -> Self {
        Self {
            index,
            batches: Vec::new(),
        }
    }

    /// Create a partition holding the given batches
    pub fn with_batches(index: usize, batches: Vec<RecordBatch>) -> Self {
        Self { index, batches }
    }

    /// Add a batch to this partition
    pub fn add_batch(&mut self, batch: RecordBatch) {
        self.batches.push(batch);
    }

    /// Get total row count
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }
}
