use arrow::array::{Array, Int64Array, StringArray};
use arrow::record_batch::RecordBatch;
use query_cache::{CacheConfig, StorageLevel};
use query_core::{DataType, Field, Partition, Partitioning, QueryError, Result, Schema};
use query_executor::{DataSource, MemoryTable};
use query_planner::{col, lit, JoinType};
use query_session::{CacheStatement, Session};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn users_schema() -> Schema {
    Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, false),
    ])
}

fn orders_schema() -> Schema {
    Schema::new(vec![
        Field::new("order_id", DataType::Int64, false),
        Field::new("user_id", DataType::Int64, false),
    ])
}

fn users_batch(n: i64) -> RecordBatch {
    let names: Vec<String> = (0..n).map(|i| "x".repeat(i as usize)).collect();
    RecordBatch::try_new(
        users_schema().to_arrow_ref(),
        vec![
            Arc::new(Int64Array::from((0..n).collect::<Vec<_>>())),
            Arc::new(StringArray::from(names)),
        ],
    )
    .unwrap()
}

fn orders_batch() -> RecordBatch {
    RecordBatch::try_new(
        orders_schema().to_arrow_ref(),
        vec![
            Arc::new(Int64Array::from(vec![100, 101, 102, 103, 104, 105])),
            Arc::new(Int64Array::from(vec![0, 1, 1, 3, 3, 3])),
        ],
    )
    .unwrap()
}

/// Memory table that counts how often it is scanned
#[derive(Debug)]
struct CountingTable {
    inner: MemoryTable,
    scans: AtomicUsize,
}

impl CountingTable {
    fn new(schema: Schema, batch: RecordBatch) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryTable::new(schema, vec![batch]),
            scans: AtomicUsize::new(0),
        })
    }

    fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl DataSource for CountingTable {
    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn partitioning(&self) -> Partitioning {
        self.inner.partitioning()
    }

    fn scan(&self) -> Result<Vec<Partition>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.scan()
    }
}

/// Table whose first `failures` scans fail
#[derive(Debug)]
struct FlakyTable {
    inner: MemoryTable,
    failures: AtomicUsize,
}

impl DataSource for FlakyTable {
    fn schema(&self) -> &Schema {
        self.inner.schema()
    }

    fn partitioning(&self) -> Partitioning {
        self.inner.partitioning()
    }

    fn scan(&self) -> Result<Vec<Partition>> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(QueryError::ExecutionError("source unavailable".to_string()));
        }
        self.inner.scan()
    }
}

fn session_with_users(rows: i64) -> (Session, Arc<CountingTable>) {
    init_tracing();
    let session = Session::new();
    let users = CountingTable::new(users_schema(), users_batch(rows));
    session.register_table("users", users.clone());
    session.register_table(
        "orders",
        Arc::new(MemoryTable::new(orders_schema(), vec![orders_batch()])),
    );
    (session, users)
}

#[test]
fn test_caching_twice_is_idempotent() {
    let (session, _) = session_with_users(10);

    session
        .execute_statement(CacheStatement::cache_table("users"))
        .unwrap();
    let first = session.cache_manager().entries();
    session
        .execute_statement(CacheStatement::cache_table("users"))
        .unwrap();
    let second = session.cache_manager().entries();

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].id, second[0].id);
    assert_eq!(second[0].names, vec!["users".to_string()]);
    assert_eq!(session.cache_manager().stats().materializations(), 1);
}

#[test]
fn test_concurrent_readers_materialize_once() {
    let (session, users) = session_with_users(50);
    let dataset = session
        .table("users")
        .unwrap()
        .filter(col("id").lt(lit(20i64)))
        .unwrap();
    dataset.cache().unwrap();

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| dataset.count())).collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), 20);
        }
    });

    assert_eq!(session.cache_manager().stats().materializations(), 1);
    assert_eq!(users.scans(), 1);
}

#[test]
fn test_uncache_removes_everything() {
    let (session, _) = session_with_users(10);
    let users = session.table("users").unwrap();
    session
        .execute_statement(CacheStatement::cache_table("users"))
        .unwrap();
    let id = session.cache_manager().entry_info(users.plan()).unwrap().id;

    session
        .execute_statement(CacheStatement::uncache("users"))
        .unwrap();

    let cache = session.cache_manager();
    assert!(cache.lookup(users.plan()).is_none());
    assert!(cache.block_store().blocks_for(id).is_empty());
    assert_eq!(cache.accumulators().count_for(id), 0);
    assert!(matches!(
        session.execute_statement(CacheStatement::uncache("users")),
        Err(QueryError::NotCached(_))
    ));
}

#[test]
fn test_uncache_cascades_to_dependent_entries() {
    let (session, _) = session_with_users(10);
    session
        .execute_statement(CacheStatement::cache_table("users"))
        .unwrap();
    let adults = session
        .table("users")
        .unwrap()
        .filter(col("id").gt_eq(lit(5i64)))
        .unwrap();
    session
        .execute_statement(CacheStatement::cache_as("late_users", adults.plan().clone()))
        .unwrap();
    assert_eq!(session.cache_manager().len(), 2);

    session
        .execute_statement(CacheStatement::uncache("users"))
        .unwrap();

    assert!(!session.is_cached("late_users"));
    assert!(session.cache_manager().is_empty());
    // The view survives; only its cache entry went away.
    assert_eq!(session.table("late_users").unwrap().count().unwrap(), 5);
}

#[test]
fn test_co_partitioned_cached_inputs_join_without_exchange() {
    let (session, _) = session_with_users(10);
    let users = session.table("users").unwrap().repartition(4, &["id"]).unwrap();
    let orders = session
        .table("orders")
        .unwrap()
        .repartition(4, &["user_id"])
        .unwrap();
    users.cache().unwrap();
    orders.cache().unwrap();

    let joined = users
        .join(&orders, JoinType::Inner, &["id"], &["user_id"])
        .unwrap();
    let physical = joined.physical_plan().unwrap();

    assert_eq!(physical.cached_scans().len(), 2);
    assert_eq!(physical.exchange_count(), 0);
    assert_eq!(joined.count().unwrap(), 6);
}

#[test]
fn test_one_cached_input_reshuffles_the_other_side() {
    let (session, _) = session_with_users(10);
    let users = session.table("users").unwrap().repartition(4, &["id"]).unwrap();
    users.cache().unwrap();
    let orders = session.table("orders").unwrap();

    let joined = users
        .join(&orders, JoinType::Inner, &["id"], &["user_id"])
        .unwrap();
    let physical = joined.physical_plan().unwrap();

    assert_eq!(physical.cached_scans().len(), 1);
    assert_eq!(physical.exchange_count(), 1);
    assert_eq!(joined.count().unwrap(), 6);
}

#[test]
fn test_mismatched_cached_layouts_reshuffle_both_sides() {
    let (session, _) = session_with_users(10);
    let users = session
        .table("users")
        .unwrap()
        .repartition(4, &["name"])
        .unwrap();
    let orders = session.table("orders").unwrap().repartition(3, &[]).unwrap();
    users.cache().unwrap();
    orders.cache().unwrap();

    let joined = users
        .join(&orders, JoinType::Inner, &["id"], &["user_id"])
        .unwrap();
    let physical = joined.physical_plan().unwrap();

    assert_eq!(physical.cached_scans().len(), 2);
    assert_eq!(physical.exchange_count(), 2);
    assert_eq!(joined.count().unwrap(), 6);
}

#[test]
fn test_self_join_reads_one_materialization() {
    let (session, source) = session_with_users(10);
    let users = session.table("users").unwrap();
    users.cache().unwrap();

    let joined = users
        .join(&users, JoinType::Inner, &["id"], &["id"])
        .unwrap();
    let physical = joined.physical_plan().unwrap();
    let scans = physical.cached_scans();
    assert_eq!(scans.len(), 2);
    assert_ne!(scans[0].scan_id(), scans[1].scan_id());

    assert_eq!(joined.count().unwrap(), 10);
    assert_eq!(session.cache_manager().stats().materializations(), 1);
    assert_eq!(source.scans(), 1);
}

#[test]
fn test_size_in_bytes_is_exact() {
    let (session, _) = session_with_users(100);
    session
        .execute_statement(CacheStatement::cache_table("users"))
        .unwrap();

    let users = session.table("users").unwrap();
    let info = session.cache_manager().entry_info(users.plan()).unwrap();
    // 100 * (8 byte id + 4 byte offset) + 0 + 1 + ... + 99 name bytes
    assert_eq!(info.size_in_bytes, Some(6150));
}

#[test]
fn test_lazy_cache_block_lifecycle() {
    let (session, source) = session_with_users(10);
    session
        .execute_statement(CacheStatement::cache_lazy("users"))
        .unwrap();
    let users = session.table("users").unwrap();
    let cache = session.cache_manager();
    let info = cache.entry_info(users.plan()).unwrap();

    assert!(!info.materialized);
    assert!(cache.block_store().blocks_for(info.id).is_empty());
    assert_eq!(source.scans(), 0);

    assert_eq!(users.count().unwrap(), 10);
    assert_eq!(
        cache.block_store().blocks_for(info.id).len(),
        info.num_partitions
    );
    assert!(cache.accumulators().count_for(info.id) > 0);

    users.unpersist(true);
    assert!(cache.block_store().is_empty());
    assert_eq!(cache.accumulators().count_for(info.id), 0);
}

#[test]
fn test_disk_only_round_trip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let session =
        Session::with_config(CacheConfig::default().with_spill_dir(dir.path())).unwrap();
    session.register_table(
        "users",
        Arc::new(MemoryTable::new(users_schema(), vec![users_batch(30)])),
    );

    let users = session.table("users").unwrap().repartition(3, &["id"]).unwrap();
    users.persist(StorageLevel::DiskOnly).unwrap();
    assert_eq!(users.count().unwrap(), 30);

    let cache = session.cache_manager();
    assert!(cache.block_store().disk_bytes() > 0);
    assert_eq!(cache.block_store().memory_bytes(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);

    // Served from disk on the second read.
    let ids: i64 = users
        .collect()
        .unwrap()
        .iter()
        .map(|b| {
            b.column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .unwrap()
                .iter()
                .flatten()
                .sum::<i64>()
        })
        .sum();
    assert_eq!(ids, (0..30).sum::<i64>());

    users.unpersist(true);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn test_disabled_cache_registers_but_never_serves() {
    init_tracing();
    let session = Session::with_config(CacheConfig::disabled()).unwrap();
    let users = CountingTable::new(users_schema(), users_batch(10));
    session.register_table("users", users.clone());

    session
        .execute_statement(CacheStatement::cache_lazy("users"))
        .unwrap();
    assert_eq!(session.cache_manager().len(), 1);

    let dataset = session.table("users").unwrap();
    assert!(dataset.physical_plan().unwrap().cached_scans().is_empty());
    dataset.count().unwrap();
    dataset.count().unwrap();
    assert_eq!(users.scans(), 2);
}

#[test]
fn test_failed_materialization_can_be_retried() {
    init_tracing();
    let session = Session::new();
    session.register_table(
        "users",
        Arc::new(FlakyTable {
            inner: MemoryTable::new(users_schema(), vec![users_batch(10)]),
            failures: AtomicUsize::new(1),
        }),
    );
    session
        .execute_statement(CacheStatement::cache_lazy("users"))
        .unwrap();
    let users = session.table("users").unwrap();

    assert!(users.count().is_err());
    let cache = session.cache_manager();
    assert_eq!(cache.stats().materialization_failures(), 1);
    assert!(users.is_cached());

    assert_eq!(users.count().unwrap(), 10);
    assert_eq!(cache.stats().materializations(), 1);
}

#[test]
fn test_eager_failure_leaves_no_entry() {
    init_tracing();
    let session = Session::new();
    session.register_table(
        "users",
        Arc::new(FlakyTable {
            inner: MemoryTable::new(users_schema(), vec![users_batch(10)]),
            failures: AtomicUsize::new(1),
        }),
    );

    assert!(session
        .execute_statement(CacheStatement::cache_table("users"))
        .is_err());
    assert!(!session.is_cached("users"));
    assert!(session.cache_manager().is_empty());
}

#[test]
fn test_failed_cache_as_can_be_retried() {
    init_tracing();
    let session = Session::new();
    session.register_table(
        "users",
        Arc::new(FlakyTable {
            inner: MemoryTable::new(users_schema(), vec![users_batch(10)]),
            failures: AtomicUsize::new(1),
        }),
    );
    let late = session
        .table("users")
        .unwrap()
        .filter(col("id").gt_eq(lit(5i64)))
        .unwrap();

    let first = session.execute_statement(CacheStatement::cache_as("late", late.plan().clone()));
    assert!(matches!(first, Err(QueryError::MaterializationFailed(_))));
    assert!(!session.catalog().contains("late"));
    assert!(session.cache_manager().is_empty());

    session
        .execute_statement(CacheStatement::cache_as("late", late.plan().clone()))
        .unwrap();
    assert!(session.is_cached("late"));
    assert_eq!(session.table("late").unwrap().count().unwrap(), 5);
}

#[test]
fn test_dropping_view_uncaches_views_built_on_it() {
    let (session, _) = session_with_users(10);
    let v = session
        .table("users")
        .unwrap()
        .filter(col("id").gt_eq(lit(2i64)))
        .unwrap();
    session
        .execute_statement(CacheStatement::cache_as("v", v.plan().clone()))
        .unwrap();
    let w = session
        .table("v")
        .unwrap()
        .filter(col("id").lt(lit(8i64)))
        .unwrap();
    session
        .execute_statement(CacheStatement::cache_as("w", w.plan().clone()))
        .unwrap();
    session
        .execute_statement(CacheStatement::cache_table("orders"))
        .unwrap();
    assert_eq!(session.cache_manager().len(), 3);

    assert!(session.drop_view("v"));

    assert!(!session.is_cached("w"));
    assert!(session.is_cached("orders"));
    assert_eq!(session.cache_manager().len(), 1);
    // Dropping an unknown view touches nothing.
    assert!(!session.drop_view("v"));
    assert!(session.is_cached("orders"));
}

#[test]
fn test_clear_cache() {
    let (session, _) = session_with_users(10);
    session
        .execute_statement(CacheStatement::cache_table("users"))
        .unwrap();
    session
        .execute_statement(CacheStatement::cache_lazy("orders"))
        .unwrap();

    session.execute_statement(CacheStatement::ClearCache).unwrap();
    assert!(session.cache_manager().is_empty());
    assert!(session.cache_manager().block_store().is_empty());
    assert_eq!(session.cache_manager().stats().entry_count(), 0);
}
