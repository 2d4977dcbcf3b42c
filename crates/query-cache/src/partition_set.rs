//! Materialized, partitioned query results
//!
//! A [`MaterializedPartitionSet`] is created empty when a plan is cached and
//! is filled exactly once, either eagerly by the cache manager or lazily by
//! the first reader. Concurrent first readers share one computation: the
//! first becomes the leader and runs the plan outside the state lock, the
//! others attach to its [`Flight`] and wait for the outcome.

use crate::accumulator::{AccumulatorRegistry, EntryAccumulators};
use crate::size::estimate_partition_size;
use crate::stats::CacheStats;
use crate::storage::{BlockId, BlockStore, EntryId, StorageLevel, StoredBlock};
use parking_lot::{Condvar, Mutex};
use query_core::{Partition, Partitioning, QueryError, Result, Schema, SortKey};
use query_planner::{CachedRelation, LogicalPlan, LogicalPlanKey, PlanExecutor};
use std::sync::Arc;

/// Engine-wide resources shared by every cache entry
#[derive(Debug, Clone, Default)]
pub struct CacheResources {
    pub blocks: Arc<BlockStore>,
    pub accumulators: Arc<AccumulatorRegistry>,
    pub stats: Arc<CacheStats>,
}

/// Stored contents of a set once materialization completed
#[derive(Debug)]
pub struct MaterializedData {
    blocks: Vec<StoredBlock>,
    size_in_bytes: u64,
    rows: usize,
    batches: usize,
}

impl MaterializedData {
    /// Bytes of the stored rows, as estimated at materialization
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// Total rows over all partitions
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Number of stored partitions
    pub fn num_partitions(&self) -> usize {
        self.blocks.len()
    }

    /// Read every partition in index order
    pub fn partitions(&self) -> Result<Arc<[Partition]>> {
        let partitions = self
            .blocks
            .iter()
            .map(StoredBlock::read)
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::from(partitions))
    }
}

type FlightOutcome = std::result::Result<Arc<MaterializedData>, String>;

/// Promise for one in-progress materialization
#[derive(Debug, Default)]
struct Flight {
    outcome: Mutex<Option<FlightOutcome>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, outcome: FlightOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.done.notify_all();
    }

    fn wait(&self) -> FlightOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }
}

#[derive(Debug)]
enum SetState {
    Pending,
    InFlight(Arc<Flight>),
    Ready(Arc<MaterializedData>),
    /// Removed from the cache; keeps the data it had for readers that
    /// captured the set before release
    Released(Option<Arc<MaterializedData>>),
}

enum Role {
    Done(Arc<MaterializedData>),
    Follow(Arc<Flight>),
    Lead(Arc<Flight>),
}

/// Completes the flight if the leader unwinds before committing
struct FlightGuard<'a> {
    set: &'a MaterializedPartitionSet,
    flight: &'a Arc<Flight>,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.set.abandon(self.flight);
        }
    }
}

/// Partitions of one cached plan, shared by the cache entry and every reader
#[derive(Debug)]
pub struct MaterializedPartitionSet {
    id: EntryId,
    key: LogicalPlanKey,
    plan: LogicalPlan,
    partitioning: Partitioning,
    ordering: Vec<SortKey>,
    storage_level: StorageLevel,
    state: Mutex<SetState>,
    resources: CacheResources,
    accumulators: EntryAccumulators,
}

impl MaterializedPartitionSet {
    /// Create an empty set for `plan`, to be laid out as `partitioning`
    pub fn new(
        plan: LogicalPlan,
        key: LogicalPlanKey,
        partitioning: Partitioning,
        ordering: Vec<SortKey>,
        storage_level: StorageLevel,
        resources: &CacheResources,
    ) -> Self {
        let id = EntryId::new();
        let accumulators = EntryAccumulators::register(&resources.accumulators, id);
        Self {
            id,
            key,
            plan,
            partitioning,
            ordering,
            storage_level,
            state: Mutex::new(SetState::Pending),
            resources: resources.clone(),
            accumulators,
        }
    }

    /// Get the id of the owning entry
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Get the storage level
    pub fn storage_level(&self) -> StorageLevel {
        self.storage_level
    }

    /// Partition count of the recorded layout
    pub fn num_partitions(&self) -> usize {
        self.partitioning.num_partitions()
    }

    /// Counters filled while materializing
    pub fn accumulators(&self) -> &EntryAccumulators {
        &self.accumulators
    }

    /// Whether the set has been taken out of service
    pub fn is_released(&self) -> bool {
        matches!(*self.state.lock(), SetState::Released(_))
    }

    /// Bytes `data` keeps in memory; nothing for disk-only sets
    pub(crate) fn memory_bytes(&self, data: &MaterializedData) -> u64 {
        if self.storage_level.uses_memory() {
            data.size_in_bytes
        } else {
            0
        }
    }

    /// Block ids currently registered for this set
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.resources.blocks.blocks_for(self.id)
    }

    /// Compute and store the partitions unless that already happened.
    ///
    /// Exactly one caller computes; concurrent callers wait for it and share
    /// its outcome. A failed computation leaves the set pending so a later
    /// call can retry.
    pub fn materialize(&self, executor: &dyn PlanExecutor) -> Result<Arc<MaterializedData>> {
        let role = {
            let mut state = self.state.lock();
            if matches!(*state, SetState::Pending) {
                let flight = Arc::new(Flight::default());
                *state = SetState::InFlight(flight.clone());
                Role::Lead(flight)
            } else {
                match &*state {
                    SetState::Ready(data) | SetState::Released(Some(data)) => {
                        Role::Done(data.clone())
                    }
                    SetState::InFlight(flight) => Role::Follow(flight.clone()),
                    SetState::Released(None) | SetState::Pending => {
                        return Err(QueryError::CacheError(format!(
                            "cached relation {} was released",
                            self.id
                        )))
                    }
                }
            }
        };

        match role {
            Role::Done(data) => Ok(data),
            Role::Follow(flight) => {
                tracing::debug!("Waiting for in-flight materialization of {}", self.id);
                flight.wait().map_err(QueryError::MaterializationFailed)
            }
            Role::Lead(flight) => {
                let mut guard = FlightGuard {
                    set: self,
                    flight: &flight,
                    armed: true,
                };
                tracing::debug!("Materializing {} ({})", self.id, self.storage_level);
                let computed = self.compute(executor);
                let outcome = self.commit(&flight, computed);
                guard.armed = false;
                outcome
            }
        }
    }

    fn compute(&self, executor: &dyn PlanExecutor) -> Result<MaterializedData> {
        let mut partitions = executor.execute_partitions(&self.plan, &self.key, &self.partitioning)?;
        let expected = self.partitioning.num_partitions();
        if partitions.len() != expected {
            return Err(QueryError::MaterializationFailed(format!(
                "expected {} partitions for {}, got {}",
                expected,
                self.partitioning,
                partitions.len()
            )));
        }
        partitions.sort_by_key(|p| p.index);

        let plan_schema = self.plan.schema().to_arrow_ref();
        let mut blocks = Vec::with_capacity(partitions.len());
        let mut size_in_bytes = 0;
        let mut rows = 0;
        let mut batches = 0;
        for partition in &partitions {
            let schema = partition
                .batches
                .first()
                .map(|batch| batch.schema())
                .unwrap_or_else(|| plan_schema.clone());
            let size = estimate_partition_size(partition);
            let id = BlockId {
                entry: self.id,
                partition: partition.index,
            };
            blocks.push(self.resources.blocks.write_block(
                id,
                self.storage_level,
                &schema,
                partition,
                size,
            )?);
            size_in_bytes += size;
            rows += partition.row_count();
            batches += partition.batches.len();
        }

        Ok(MaterializedData {
            blocks,
            size_in_bytes,
            rows,
            batches,
        })
    }

    /// Publish the leader's result; discarded from the set if it was
    /// released while computing
    fn commit(
        &self,
        flight: &Arc<Flight>,
        computed: Result<MaterializedData>,
    ) -> Result<Arc<MaterializedData>> {
        let mut state = self.state.lock();
        let current = matches!(&*state, SetState::InFlight(f) if Arc::ptr_eq(f, flight));

        match computed {
            Ok(data) => {
                let data = Arc::new(data);
                if current {
                    self.resources.blocks.register(&data.blocks);
                    self.accumulators.rows.add(data.rows as u64);
                    self.accumulators.bytes.add(data.size_in_bytes);
                    self.accumulators.batches.add(data.batches as u64);
                    self.resources
                        .stats
                        .record_materialization(self.memory_bytes(&data));
                    *state = SetState::Ready(data.clone());
                    tracing::info!(
                        "Materialized {}: {} partitions, {} rows, {} bytes",
                        self.id,
                        data.num_partitions(),
                        data.rows,
                        data.size_in_bytes
                    );
                } else {
                    tracing::debug!("{} released during materialization, result discarded", self.id);
                }
                drop(state);
                flight.complete(Ok(data.clone()));
                Ok(data)
            }
            Err(e) => {
                if current {
                    *state = SetState::Pending;
                }
                drop(state);
                self.resources.stats.record_materialization_failure();
                let message = match e {
                    QueryError::MaterializationFailed(message) => message,
                    other => other.to_string(),
                };
                tracing::warn!("Materialization of {} failed: {}", self.id, message);
                flight.complete(Err(message.clone()));
                Err(QueryError::MaterializationFailed(message))
            }
        }
    }

    fn abandon(&self, flight: &Arc<Flight>) {
        {
            let mut state = self.state.lock();
            if matches!(&*state, SetState::InFlight(f) if Arc::ptr_eq(f, flight)) {
                *state = SetState::Pending;
            }
        }
        self.resources.stats.record_materialization_failure();
        flight.complete(Err(format!("materialization of {} was abandoned", self.id)));
    }

    /// Remove the set from service and unregister its blocks.
    ///
    /// Readers that already hold the set keep the data it had. When
    /// `blocking`, an in-flight computation is waited for before returning.
    /// Returns the bytes the set had registered.
    pub fn release(&self, blocking: bool) -> u64 {
        let previous = {
            let mut state = self.state.lock();
            let previous = std::mem::replace(&mut *state, SetState::Released(None));
            if let SetState::Ready(data) | SetState::Released(Some(data)) = &previous {
                *state = SetState::Released(Some(data.clone()));
            }
            previous
        };

        match previous {
            SetState::Ready(data) => {
                let blocks = self.resources.blocks.unregister_entry(self.id);
                tracing::debug!("Released {} ({} blocks)", self.id, blocks);
                data.size_in_bytes
            }
            SetState::InFlight(flight) => {
                if blocking {
                    let _ = flight.wait();
                }
                0
            }
            SetState::Pending | SetState::Released(_) => 0,
        }
    }
}

impl CachedRelation for MaterializedPartitionSet {
    fn key(&self) -> &LogicalPlanKey {
        &self.key
    }

    fn plan(&self) -> &LogicalPlan {
        &self.plan
    }

    fn schema(&self) -> &Schema {
        self.plan.schema()
    }

    fn output_partitioning(&self) -> Partitioning {
        self.partitioning.clone()
    }

    fn output_ordering(&self) -> Vec<SortKey> {
        self.ordering.clone()
    }

    fn size_in_bytes(&self) -> Option<u64> {
        match &*self.state.lock() {
            SetState::Ready(data) | SetState::Released(Some(data)) => Some(data.size_in_bytes),
            _ => None,
        }
    }

    fn is_materialized(&self) -> bool {
        matches!(*self.state.lock(), SetState::Ready(_))
    }

    fn scan(&self, executor: &dyn PlanExecutor) -> Result<Arc<[Partition]>> {
        let data = self.materialize(executor)?;
        self.accumulators.reads.add(1);
        data.partitions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow::record_batch::RecordBatch;
    use query_core::{DataType, Field};
    use query_planner::fingerprint;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingExecutor {
        calls: AtomicUsize,
        fail: AtomicBool,
        delay: Duration,
        partitions: usize,
    }

    impl CountingExecutor {
        fn new(partitions: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                delay: Duration::ZERO,
                partitions,
            }
        }
    }

    impl PlanExecutor for CountingExecutor {
        fn output_properties(
            &self,
            _plan: &LogicalPlan,
            _populating: &LogicalPlanKey,
        ) -> Result<(Partitioning, Vec<SortKey>)> {
            Ok((
                Partitioning::RoundRobin {
                    num_partitions: self.partitions,
                },
                vec![],
            ))
        }

        fn execute_partitions(
            &self,
            plan: &LogicalPlan,
            _populating: &LogicalPlanKey,
            _partitioning: &Partitioning,
        ) -> Result<Vec<Partition>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueryError::ExecutionError("source unavailable".into()));
            }
            let schema = plan.schema().to_arrow_ref();
            Ok((0..self.partitions)
                .map(|i| {
                    let batch = RecordBatch::try_new(
                        schema.clone(),
                        vec![Arc::new(Int64Array::from(vec![i as i64, i as i64 + 1]))],
                    )
                    .unwrap();
                    Partition::with_batches(i, vec![batch])
                })
                .collect())
        }
    }

    fn scan_plan() -> LogicalPlan {
        LogicalPlan::TableScan {
            table_name: "t".to_string(),
            schema: Schema::new(vec![Field::new("a", DataType::Int64, false)]),
        }
    }

    fn new_set(resources: &CacheResources, partitions: usize, level: StorageLevel) -> MaterializedPartitionSet {
        let plan = scan_plan();
        let key = fingerprint(&plan);
        MaterializedPartitionSet::new(
            plan,
            key,
            Partitioning::RoundRobin {
                num_partitions: partitions,
            },
            vec![],
            level,
            resources,
        )
    }

    #[test]
    fn test_lazy_materialization_on_first_scan() {
        let resources = CacheResources::default();
        let set = new_set(&resources, 2, StorageLevel::MemoryOnly);
        let executor = CountingExecutor::new(2);

        assert!(!set.is_materialized());
        assert!(set.size_in_bytes().is_none());
        assert!(set.block_ids().is_empty());

        let first = set.scan(&executor).unwrap();
        let second = set.scan(&executor).unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.len(), 2);
        assert_eq!(second[1].row_count(), 2);
        assert!(set.is_materialized());
        assert_eq!(set.size_in_bytes(), Some(32));
        assert_eq!(set.block_ids().len(), 2);
        assert_eq!(set.accumulators().rows.value(), 4);
        assert_eq!(set.accumulators().reads.value(), 2);
    }

    #[test]
    fn test_concurrent_first_reads_compute_once() {
        let resources = CacheResources::default();
        let set = Arc::new(new_set(&resources, 3, StorageLevel::MemoryAndDisk));
        let mut executor = CountingExecutor::new(3);
        executor.delay = Duration::from_millis(50);
        let executor = Arc::new(executor);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                let executor = executor.clone();
                std::thread::spawn(move || set.scan(executor.as_ref()).unwrap().len())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 3);
        }
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resources.stats.materializations(), 1);
    }

    #[test]
    fn test_failure_is_retryable() {
        let resources = CacheResources::default();
        let set = new_set(&resources, 1, StorageLevel::MemoryOnly);
        let executor = CountingExecutor::new(1);
        executor.fail.store(true, Ordering::SeqCst);

        let err = set.scan(&executor).unwrap_err();
        assert!(err.is_materialization_failure());
        assert!(!set.is_materialized());
        assert_eq!(resources.stats.materialization_failures(), 1);

        executor.fail.store(false, Ordering::SeqCst);
        assert_eq!(set.scan(&executor).unwrap().len(), 1);
        assert!(set.is_materialized());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_partition_count_mismatch_fails() {
        let resources = CacheResources::default();
        let set = new_set(&resources, 4, StorageLevel::MemoryOnly);
        let executor = CountingExecutor::new(2);

        assert!(set.scan(&executor).unwrap_err().is_materialization_failure());
        assert!(set.block_ids().is_empty());
    }

    #[test]
    fn test_release_keeps_snapshot_for_holders() {
        let resources = CacheResources::default();
        let set = new_set(&resources, 2, StorageLevel::MemoryOnly);
        let executor = CountingExecutor::new(2);
        set.materialize(&executor).unwrap();

        let released = set.release(true);
        assert_eq!(released, 32);
        assert!(set.is_released());
        assert!(set.block_ids().is_empty());

        // a holder of the set still reads the same data without recomputing
        assert_eq!(set.scan(&executor).unwrap().len(), 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_before_materialization_rejects_reads() {
        let resources = CacheResources::default();
        let set = new_set(&resources, 1, StorageLevel::MemoryOnly);
        let executor = CountingExecutor::new(1);

        assert_eq!(set.release(false), 0);
        assert!(matches!(
            set.scan(&executor),
            Err(QueryError::CacheError(_))
        ));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_release_during_flight_discards_result() {
        let resources = CacheResources::default();
        let set = Arc::new(new_set(&resources, 1, StorageLevel::MemoryOnly));
        let mut executor = CountingExecutor::new(1);
        executor.delay = Duration::from_millis(100);
        let executor = Arc::new(executor);

        let reader = {
            let set = set.clone();
            let executor = executor.clone();
            std::thread::spawn(move || set.scan(executor.as_ref()).map(|p| p.len()))
        };
        while executor.calls.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        set.release(true);

        // the in-flight reader still gets its result
        assert_eq!(reader.join().unwrap().unwrap(), 1);
        assert!(set.block_ids().is_empty());
        assert!(!set.is_materialized());
        assert!(set.scan(executor.as_ref()).is_err());
    }

    #[test]
    fn test_disk_only_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let resources = CacheResources {
            blocks: Arc::new(BlockStore::new(Some(dir.path().to_path_buf()))),
            ..Default::default()
        };
        let set = new_set(&resources, 2, StorageLevel::DiskOnly);
        let executor = CountingExecutor::new(2);

        let partitions = set.scan(&executor).unwrap();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[1].index, 1);
        assert_eq!(resources.blocks.disk_bytes(), 32);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

        drop(partitions);
        set.release(true);
        drop(set);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
