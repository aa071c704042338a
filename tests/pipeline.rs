use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kz_ingest::api::transport::TransportError;
use kz_ingest::api::{
    FetchRequest, FetchTarget, ProxyPool, RecordingSleeper, RetryPolicy, Route, Sleeper, Transport,
    TransportResponse,
};
use kz_ingest::database_ops::resolver::EntityResolver;
use kz_ingest::database_ops::{
    BatchWriter, CheckpointBackend, CheckpointStore, LeaderboardStore, MemoryStore,
};
use kz_ingest::ingest::{IngestionController, PipelineDeps, PipelineState, RunSummary};
use kz_ingest::normalization::sanitize::RESERVED_BASE;
use kz_ingest::normalization::BatchNormalizer;
use kz_ingest::shutdown::ShutdownCoordinator;
use kz_ingest::{IngestConfig, StreamKind};
use serde_json::{json, Value};

const REAL_PLAYER: i64 = 76561198000000001;

/// Serves records by id; everything else is 404.
struct FakeApi {
    records: HashMap<i64, Value>,
}

impl FakeApi {
    fn new(records: Vec<Value>) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r["id"].as_i64().unwrap(), r))
            .collect();
        Self { records }
    }
}

#[async_trait]
impl Transport for FakeApi {
    async fn get(&self, _route: &Route, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        match request.target {
            FetchTarget::Id(id) => Ok(self
                .records
                .get(&id)
                .cloned()
                .map(TransportResponse::Ok)
                .unwrap_or(TransportResponse::NotFound)),
            FetchTarget::Page { .. } => Ok(TransportResponse::Ok(json!([]))),
        }
    }
}

fn record(id: i64, time: f64) -> Value {
    json!({
        "id": id,
        "steamid64": REAL_PLAYER.to_string(),
        "player_name": "runner",
        "map_id": 200,
        "map_name": "kz_beginnerblock_go",
        "server_id": 7,
        "server_name": "KZ Server",
        "mode": "kz_timer",
        "stage": 0,
        "time": time,
        "teleports": 0,
        "created_on": "2024-03-01T12:00:00",
    })
}

fn config(batch_size: usize, end: i64) -> IngestConfig {
    IngestConfig {
        streams: vec![StreamKind::Records],
        batch_size,
        batch_delay: Duration::ZERO,
        end: Some(end),
        retry: RetryPolicy {
            timeout: Duration::from_secs(5),
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            cooldown: Duration::from_millis(1),
            success_delay_single: Duration::ZERO,
            success_delay_multi: Duration::ZERO,
        },
        batch_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        ..IngestConfig::default()
    }
}

async fn run(api: Arc<FakeApi>, store: Arc<MemoryStore>, cfg: &IngestConfig) -> anyhow::Result<RunSummary> {
    let sleeper: Arc<dyn Sleeper> = Arc::new(RecordingSleeper::new());
    let deps = PipelineDeps {
        transport: api,
        pool: Arc::new(ProxyPool::direct()),
        store: store.clone(),
        checkpoints: Arc::new(CheckpointStore::new(CheckpointBackend::Table, store)),
        sleeper,
        shutdown: ShutdownCoordinator::shared(),
    };
    IngestionController::from_config(StreamKind::Records, cfg, &deps).run().await
}

#[tokio::test]
async fn rerunning_the_same_range_changes_nothing() {
    let api = Arc::new(FakeApi::new((1..=5).map(|id| record(id, 10.0 + id as f64)).collect()));
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(2, 6);

    let first = run(api.clone(), store.clone(), &cfg).await.unwrap();
    assert_eq!(first.final_state, PipelineState::Done);
    assert_eq!(first.cursor, 6);
    assert_eq!(first.counters.inserted, 5);
    let records_before = store.lock().records.clone();
    let bests_before = store.lock().personal_bests.clone();

    cfg.start = Some(1);
    let second = run(api, store.clone(), &cfg).await.unwrap();
    assert_eq!(second.counters.inserted, 0);
    assert_eq!(second.counters.updated, 0);
    assert_eq!(second.counters.skipped, 5);
    assert_eq!(store.lock().records, records_before);
    assert_eq!(store.lock().personal_bests, bests_before);
    assert_eq!(store.player_count(), 1);
    assert_eq!(store.map_count(), 1);
    assert_eq!(store.server_count(), 1);
}

#[tokio::test]
async fn personal_best_only_improves() {
    let api = Arc::new(FakeApi::new(vec![
        record(1, 12.5),
        record(2, 9.3),
        record(3, 15.0),
    ]));
    let store = Arc::new(MemoryStore::new());
    run(api, store.clone(), &config(1, 4)).await.unwrap();

    let player_id = store.player_id(REAL_PLAYER).unwrap();
    let pb = store.personal_best(player_id, "kz_beginnerblock_go").unwrap();
    let clean = pb.clean.unwrap();
    assert_eq!(clean.time, 9.3);
    assert_eq!(clean.record_id, 2);
    assert!(pb.assisted.is_none());

    let wr = store.lock().world_records.values().next().cloned().unwrap();
    assert_eq!(wr.clean.unwrap().time, 9.3);
}

fn permutations(times: [f64; 3]) -> Vec<[f64; 3]> {
    let [a, b, c] = times;
    vec![[a, b, c], [a, c, b], [b, a, c], [b, c, a], [c, a, b], [c, b, a]]
}

async fn best_after(order: [f64; 3], batch_size: usize) -> (f64, i64) {
    let api = Arc::new(FakeApi::new(
        order.iter().enumerate().map(|(i, t)| record(i as i64 + 1, *t)).collect(),
    ));
    let store = Arc::new(MemoryStore::new());
    run(api, store.clone(), &config(batch_size, 4)).await.unwrap();
    let player_id = store.player_id(REAL_PLAYER).unwrap();
    let clean = store
        .personal_best(player_id, "kz_beginnerblock_go")
        .unwrap()
        .clean
        .unwrap();
    let wr = store.lock().world_records.values().next().cloned().unwrap();
    assert_eq!(wr.clean.unwrap().time, clean.time, "order {order:?}");
    (clean.time, clean.record_id)
}

#[tokio::test]
async fn best_time_converges_for_every_arrival_order() {
    for order in permutations([12.5, 9.3, 15.0]) {
        let fastest_id = order.iter().position(|t| *t == 9.3).unwrap() as i64 + 1;
        // One batch holding all three, then one record per batch.
        for batch_size in [3, 1] {
            let (time, record_id) = best_after(order, batch_size).await;
            assert_eq!(time, 9.3, "order {order:?} batch {batch_size}");
            assert_eq!(record_id, fastest_id, "order {order:?} batch {batch_size}");
        }
    }
}

#[tokio::test]
async fn anonymous_records_map_to_stable_placeholders() {
    let anonymous = json!({"id": 42, "steamid64": null, "map_name": "kz_x", "time": 30.0});
    let api = Arc::new(FakeApi::new(vec![anonymous]));
    let store = Arc::new(MemoryStore::new());
    let mut cfg = config(10, 50);
    cfg.start = Some(40);

    run(api.clone(), store.clone(), &cfg).await.unwrap();
    cfg.force_refresh = true;
    run(api, store.clone(), &cfg).await.unwrap();

    assert_eq!(store.player_count(), 1);
    let placeholder = RESERVED_BASE + 42;
    assert!(store.player_id(placeholder).is_some());
}

#[tokio::test]
async fn records_without_server_share_the_unknown_server() {
    let api = Arc::new(FakeApi::new(vec![
        json!({"id": 1, "steamid64": REAL_PLAYER.to_string(), "map_name": "kz_a", "time": 5.0}),
        json!({"id": 2, "steamid64": REAL_PLAYER.to_string(), "map_name": "kz_b", "time": 6.0, "server_id": 0}),
        json!({"id": 3, "steamid64": REAL_PLAYER.to_string(), "map_name": "kz_c", "time": 7.0, "server_id": "n/a"}),
    ]));
    let store = Arc::new(MemoryStore::new());
    run(api, store.clone(), &config(10, 4)).await.unwrap();

    assert_eq!(store.record_count(), 3);
    let st = store.lock();
    assert_eq!(st.servers.len(), 1);
    let (server_id, (surrogate, row)) = st.servers.iter().next().unwrap();
    assert_eq!(*server_id, -1);
    assert_eq!(row.name, "unknown_server");
    assert!(st.records.values().all(|r| r.server_id == *surrogate));
}

#[tokio::test]
async fn crash_between_write_and_checkpoint_resumes_without_duplicates() {
    let api = Arc::new(FakeApi::new((1..=3).map(|id| record(id, 20.0 - id as f64)).collect()));
    let store = Arc::new(MemoryStore::new());
    let cfg = config(10, 4);

    store.fail_next_checkpoints(3);
    assert!(run(api.clone(), store.clone(), &cfg).await.is_err());
    assert_eq!(store.record_count(), 3);
    assert!(store.lock().checkpoints.is_empty());

    let rerun = run(api, store.clone(), &cfg).await.unwrap();
    assert_eq!(rerun.final_state, PipelineState::Done);
    assert_eq!(store.record_count(), 3);
    assert_eq!(store.lock().checkpoints["records"].cursor, 4);
    let player_id = store.player_id(REAL_PLAYER).unwrap();
    let pb = store.personal_best(player_id, "kz_beginnerblock_go").unwrap();
    assert_eq!(pb.clean.unwrap().time, 17.0);
}

#[tokio::test]
async fn duplicate_ids_in_one_batch_keep_the_first() {
    let elements = [
        json!({"id": 1, "steamid64": null, "map_name": "kz_x", "time": 30.0, "teleports": 0}),
        json!({"id": 2, "steamid64": "76561198000000001", "map_name": "kz_x", "time": 25.0, "teleports": 0}),
        json!({"id": 1, "steamid64": "76561198000000002", "map_name": "kz_x", "time": 10.0, "teleports": 0}),
    ];
    let raws: Vec<_> = elements
        .into_iter()
        .map(|v| kz_ingest::api::ExternalRecord::decode(StreamKind::Records, v))
        .collect();
    let batch = BatchNormalizer::new().normalize_batch(&raws);
    assert!(batch.rejected.is_empty());

    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn LeaderboardStore> = store.clone();
    let writer = BatchWriter::new(shared.clone(), false);
    let mut resolver = EntityResolver::new(shared);
    let resolved = writer.resolve(&mut resolver, batch.rows).await.unwrap();
    let stats = writer.write(&resolved).await.unwrap();

    assert_eq!(store.record_count(), 2);
    assert_eq!(stats.inserted, 2);
    assert_eq!(stats.skipped, 1);
    assert_eq!(store.player_count(), 2);
    assert!(store.player_id(RESERVED_BASE + 1).is_some());
    assert!(store.player_id(76561198000000002).is_none());

    let real = store.player_id(REAL_PLAYER).unwrap();
    let pb = store.personal_best(real, "kz_x").unwrap();
    assert_eq!(pb.clean.unwrap().time, 25.0);
}
