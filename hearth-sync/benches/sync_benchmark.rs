use std::collections::BTreeSet;
use std::hint::black_box;
use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, Criterion};
use hearth_sync::feed::{ChangeEvent, ChangeOp, Cursor, FeedDecoder, FeedRecord};
use hearth_sync::policy::{AccessContext, AllowList, PolicyCompiler, Table};
use hearth_sync::{
    in_process_feed, AccessLookup, Identity, IdentityKey, InMemorySharedCache, LookupError,
    Mutation, MutationSink, ReplicaRow, RequestContext, Row, SendError, SyncConfig,
    SyncSupervisor, TxMarker,
};
use serde_json::json;
use uuid::Uuid;

fn message_row(i: u64) -> Row {
    json!({
        "id": format!("m{i}"),
        "channel_id": Uuid::nil().to_string(),
        "author_id": Uuid::nil().to_string(),
        "content": "hello world",
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

fn feed_lines(count: u64) -> String {
    (1..=count)
        .map(|i| {
            FeedRecord::Change(ChangeEvent::upsert(
                Table::Messages,
                ChangeOp::Insert,
                format!("m{i}"),
                message_row(i),
                i,
            ))
            .to_line()
            .unwrap()
        })
        .collect()
}

fn bench_decode_1k_records(c: &mut Criterion) {
    let payload = feed_lines(1_000);
    c.bench_function("decode_1k_records", |b| {
        b.iter(|| {
            let mut decoder = FeedDecoder::new();
            black_box(decoder.push(black_box(&payload)).unwrap());
        })
    });
}

fn bench_decode_split_frames(c: &mut Criterion) {
    let payload = feed_lines(100);
    let frames: Vec<&str> = payload
        .as_bytes()
        .chunks(97)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or(""))
        .collect();
    // Chunk boundaries only fall inside ASCII, so no frame is dropped.
    assert_eq!(frames.concat(), payload);

    c.bench_function("decode_100_records_97B_frames", |b| {
        b.iter(|| {
            let mut decoder = FeedDecoder::new();
            let mut total = 0;
            for frame in &frames {
                total += decoder.push(frame).unwrap().len();
            }
            black_box(total);
        })
    });
}

struct Accept;

#[async_trait]
impl MutationSink for Accept {
    async fn send(&self, _ctx: &RequestContext, _m: &Mutation) -> Result<TxMarker, SendError> {
        Ok(TxMarker(1))
    }
}

struct FixedOrgs;

#[async_trait]
impl AccessLookup for FixedOrgs {
    async fn lookup(&self, _key: IdentityKey) -> Result<AccessContext, LookupError> {
        Ok(AccessContext::User {
            org_ids: [Uuid::nil()].into_iter().collect(),
        })
    }
}

fn bench_feed_to_replica(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (feed, server) = in_process_feed();
    let supervisor = rt.block_on(async {
        SyncSupervisor::new(
            SyncConfig::default(),
            Arc::new(feed),
            Arc::new(Accept),
            Arc::new(FixedOrgs),
            Arc::new(InMemorySharedCache::new()),
        )
        .unwrap()
    });
    let ctx = RequestContext::new(Identity::user(Uuid::new_v4(), [Uuid::nil()]));
    let payload = feed_lines(1_000);

    c.bench_function("feed_to_replica_1k_events", |b| {
        b.iter(|| {
            rt.block_on(async {
                let opens = server.open_count();
                let collection = supervisor.subscribe(&ctx, "messages").await.unwrap();
                server.wait_for_opens(opens + 1).await;
                server.push_raw(Table::Messages, &payload);
                while collection.cursor() != Some(Cursor(1_000)) {
                    tokio::task::yield_now().await;
                }
                collection.unsubscribe();
                black_box(collection.len());
            })
        })
    });
}

fn bench_replica_list(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (feed, server) = in_process_feed();
    let (supervisor, collection) = rt.block_on(async {
        let supervisor = SyncSupervisor::new(
            SyncConfig::default(),
            Arc::new(feed),
            Arc::new(Accept),
            Arc::new(FixedOrgs),
            Arc::new(InMemorySharedCache::new()),
        )
        .unwrap();
        let ctx = RequestContext::new(Identity::user(Uuid::new_v4(), [Uuid::nil()]));
        let collection = supervisor.subscribe(&ctx, "messages").await.unwrap();
        server.wait_for_opens(1).await;
        server.push_raw(Table::Messages, &feed_lines(1_000));
        while collection.cursor() != Some(Cursor(1_000)) {
            tokio::task::yield_now().await;
        }
        (supervisor, collection)
    });

    c.bench_function("replica_list_filtered_1k_rows", |b| {
        b.iter(|| {
            let filter = |row: &ReplicaRow| row.key.as_str().ends_with('7');
            black_box(collection.list(Some(&filter)));
        })
    });
    drop(supervisor);
}

fn bench_policy_compile(c: &mut Criterion) {
    let compiler = PolicyCompiler::new(AllowList::standard());
    let orgs: BTreeSet<Uuid> = (0..16).map(|_| Uuid::new_v4()).collect();
    let identity = Identity::user(Uuid::new_v4(), orgs.iter().copied());
    let access = AccessContext::User { org_ids: orgs };

    c.bench_function("policy_compile_messages_16_orgs", |b| {
        b.iter(|| {
            black_box(
                compiler
                    .compile(black_box(Table::Messages), &identity, &access)
                    .unwrap(),
            );
        })
    });
}

criterion_group!(
    benches,
    bench_decode_1k_records,
    bench_decode_split_frames,
    bench_feed_to_replica,
    bench_replica_list,
    bench_policy_compile,
);
criterion_main!(benches);
