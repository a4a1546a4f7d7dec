//! End-to-end scenarios against `ChainFeed` with in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use chainfeed_core::{
    Block, FeedError, MemoryStateStore, PusherId, SubscriptionItem, SubscriptionManifest,
    SubscriptionStatus, VersionId,
};
use chainfeed_runtime::{ChainFeed, FeedBuilder, InMemoryBus, MemoryBlockSource, PushMessage};
use tokio::sync::broadcast;

fn manifest(chains: &[(&str, u64)]) -> SubscriptionManifest {
    SubscriptionManifest::new(
        chains
            .iter()
            .map(|(chain, start)| SubscriptionItem::new(*chain, *start))
            .collect(),
    )
}

fn block(n: u64, lib: u64) -> Block {
    Block {
        chain_id: "AELF".into(),
        block_hash: format!("0x{n}"),
        block_number: n,
        previous_block_hash: format!("0x{}", n.saturating_sub(1)),
        lib_block_number: lib,
        is_confirmed: false,
        block_time: 1_700_000_000 + n as i64,
        transactions: vec![],
    }
}

struct Harness {
    feed: ChainFeed,
    bus: Arc<InMemoryBus>,
    store: Arc<MemoryStateStore>,
}

fn harness(builder: FeedBuilder) -> Harness {
    let store = Arc::new(MemoryStateStore::new());
    let bus = Arc::new(InMemoryBus::new(64));
    let feed = builder.build(store.clone(), bus.clone(), Arc::new(MemoryBlockSource::new()));
    Harness { feed, bus, store }
}

async fn next_push(rx: &mut broadcast::Receiver<PushMessage>) -> PushMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push within 2s")
        .expect("stream open")
}

fn numbers(message: &PushMessage) -> Vec<u64> {
    message.blocks.iter().map(|b| b.block_number).collect()
}

#[tokio::test]
async fn version_slots_follow_the_lifecycle() {
    let h = harness(FeedBuilder::new());
    let feed = &h.feed;
    let v1_aelf = PusherId::new("app", VersionId(1), "AELF");

    let v1 = feed.add_subscription("app", manifest(&[("AELF", 100)])).await.unwrap();
    assert_eq!(v1, VersionId(1));
    let sub = feed.get_subscription("app").await.unwrap();
    assert_eq!(sub.current_version.as_ref().unwrap().version, v1);
    assert!(sub.new_version.is_none());

    // Nothing pending: rejected, state unchanged
    let err = feed.upgrade_version("app").await.unwrap_err();
    assert!(matches!(err, FeedError::NoPendingVersion { .. }));
    assert_eq!(feed.get_subscription("app").await.unwrap(), sub);

    let v2 = feed.add_subscription("app", manifest(&[("AELF", 200)])).await.unwrap();
    assert_eq!(v2, VersionId(2));
    let sub = feed.get_subscription("app").await.unwrap();
    assert_eq!(sub.current_version.as_ref().unwrap().version, v1);
    assert_eq!(sub.new_version.as_ref().unwrap().version, v2);

    feed.start_scan("app", v1).await.unwrap();
    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert!(active["AELF"].contains(&v1_aelf));

    feed.pause("app", v1).await.unwrap();
    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert!(!active["AELF"].contains(&v1_aelf));
    assert_eq!(
        feed.get_subscription_status("app", v1).await.unwrap(),
        SubscriptionStatus::Paused
    );

    feed.start_scan("app", v1).await.unwrap();
    assert_eq!(
        feed.get_subscription_status("app", v1).await.unwrap(),
        SubscriptionStatus::Started
    );
    assert!(feed.get_all_active_pusher_ids().await.unwrap()["AELF"].contains(&v1_aelf));

    let err = feed.add_subscription("app", manifest(&[("AELF", 300)])).await.unwrap_err();
    assert!(matches!(err, FeedError::VersionSlotFull { .. }));

    feed.upgrade_version("app").await.unwrap();
    let sub = feed.get_subscription("app").await.unwrap();
    assert_eq!(sub.current_version.as_ref().unwrap().version, v2);
    assert!(sub.new_version.is_none());
    // The retired version's pushers are gone from the registry
    assert!(!feed.get_all_active_pusher_ids().await.unwrap()["AELF"].contains(&v1_aelf));
    assert!(matches!(
        feed.get_subscription_status("app", v1).await,
        Err(FeedError::VersionNotFound { .. })
    ));

    let v3 = feed.add_subscription("app", manifest(&[("AELF", 300)])).await.unwrap();
    assert_eq!(v3, VersionId(3));
    h.feed.shutdown().await;
}

#[tokio::test]
async fn replace_pending_version_displaces_the_new_slot() {
    let h = harness(FeedBuilder::new().replace_pending_version(true));
    let feed = &h.feed;

    let v1 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    let v2 = feed.add_subscription("app", manifest(&[("AELF", 2)])).await.unwrap();
    feed.start_scan("app", v2).await.unwrap();
    let v3 = feed.add_subscription("app", manifest(&[("AELF", 3)])).await.unwrap();

    let sub = feed.get_subscription("app").await.unwrap();
    assert_eq!(sub.current_version.unwrap().version, v1);
    assert_eq!(sub.new_version.unwrap().version, v3);
    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert!(!active["AELF"].contains(&PusherId::new("app", v2, "AELF")));
}

#[tokio::test]
async fn is_running_rejects_old_tokens_after_pause_and_stop() {
    let h = harness(FeedBuilder::new());
    let feed = &h.feed;
    let v1 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    feed.start_scan("app", v1).await.unwrap();

    let token = feed.get_push_token("app", v1, "AELF").await.unwrap();
    assert!(feed.is_running("AELF", "app", v1, token).await.unwrap());

    feed.pause("app", v1).await.unwrap();
    assert!(!feed.is_running("AELF", "app", v1, token).await.unwrap());

    feed.start_scan("app", v1).await.unwrap();
    let fresh = feed.get_push_token("app", v1, "AELF").await.unwrap();
    assert_ne!(fresh, token);
    assert!(!feed.is_running("AELF", "app", v1, token).await.unwrap());
    assert!(feed.is_running("AELF", "app", v1, fresh).await.unwrap());

    feed.stop("app", v1).await.unwrap();
    assert!(!feed.is_running("AELF", "app", v1, fresh).await.unwrap());
    assert!(feed.get_subscription("app").await.unwrap().current_version.is_none());

    // Unknown chain for a version: an error, not a silent token
    let v2 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    assert!(matches!(
        feed.get_push_token("app", v2, "tDVV").await,
        Err(FeedError::InvalidManifest(_))
    ));
}

#[tokio::test]
async fn stopping_current_promotes_pending() {
    let h = harness(FeedBuilder::new());
    let feed = &h.feed;
    let v1 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    let v2 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    feed.start_scan("app", v1).await.unwrap();
    feed.start_scan("app", v2).await.unwrap();

    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert_eq!(active["AELF"].len(), 2);

    feed.stop("app", v1).await.unwrap();
    let sub = feed.get_subscription("app").await.unwrap();
    assert_eq!(sub.current_version.unwrap().version, v2);
    assert!(sub.new_version.is_none());
    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert_eq!(active["AELF"].len(), 1);
    assert!(active["AELF"].contains(&PusherId::new("app", v2, "AELF")));
}

#[tokio::test]
async fn update_moves_pushers_between_chains() {
    let h = harness(FeedBuilder::new());
    let feed = &h.feed;
    let v1 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    feed.start_scan("app", v1).await.unwrap();

    feed.update_subscription("app", v1, manifest(&[("AELF", 1), ("tDVV", 5)]))
        .await
        .unwrap();
    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert!(active["tDVV"].contains(&PusherId::new("app", v1, "tDVV")));
    assert_eq!(feed.get_message_stream_ids("app", v1).await.unwrap().len(), 2);

    feed.update_subscription("app", v1, manifest(&[("tDVV", 5)])).await.unwrap();
    let active = feed.get_all_active_pusher_ids().await.unwrap();
    assert!(active["AELF"].is_empty());
    assert_eq!(active["tDVV"].len(), 1);
    assert_eq!(
        feed.get_subscription_status("app", v1).await.unwrap(),
        SubscriptionStatus::Started
    );
}

#[tokio::test]
async fn confirmed_blocks_reach_the_app_stream_once() {
    let h = harness(FeedBuilder::new());
    let feed = &h.feed;
    let item = SubscriptionItem::new("AELF", 1).only_confirmed();
    let v1 = feed
        .add_subscription("app", SubscriptionManifest::new(vec![item]))
        .await
        .unwrap();
    let streams = feed.get_message_stream_ids("app", v1).await.unwrap();
    let mut rx = h.bus.subscribe(streams[0]).unwrap();
    feed.start_scan("app", v1).await.unwrap();

    for n in 1..=4 {
        feed.ingest_block(block(n, 0)).await.unwrap();
    }
    let outcome = feed.ingest_block(block(5, 2)).await.unwrap();
    assert_eq!(outcome.confirmed().len(), 2);

    let first = next_push(&mut rx).await;
    assert_eq!(numbers(&first), vec![1, 2]);
    assert!(first.blocks.iter().all(|b| b.is_confirmed));
    assert_eq!(first.version, v1);

    // The walk returns the old frontier again; it is not re-pushed
    feed.ingest_block(block(6, 4)).await.unwrap();
    let second = next_push(&mut rx).await;
    assert_eq!(numbers(&second), vec![3, 4]);

    feed.pause("app", v1).await.unwrap();
    feed.ingest_block(block(7, 6)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn state_survives_a_restart() {
    let h = harness(FeedBuilder::new().idle_timeout_ms(20));
    let v1 = h.feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    h.feed.start_scan("app", v1).await.unwrap();
    let streams = h.feed.get_message_stream_ids("app", v1).await.unwrap();

    // Let every actor go idle and be evicted
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.feed.get_message_stream_ids("app", v1).await.unwrap(), streams);
    h.feed.shutdown().await;

    let restarted = FeedBuilder::new().build(
        h.store.clone(),
        Arc::new(InMemoryBus::new(64)),
        Arc::new(MemoryBlockSource::new()),
    );
    assert_eq!(
        restarted.get_subscription_status("app", v1).await.unwrap(),
        SubscriptionStatus::Started
    );
    assert!(restarted.get_all_active_pusher_ids().await.unwrap()["AELF"]
        .contains(&PusherId::new("app", v1, "AELF")));
    assert_eq!(restarted.get_message_stream_ids("app", v1).await.unwrap(), streams);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn audit_never_unregisters_a_started_version() {
    let h = harness(FeedBuilder::new());
    let feed = Arc::new(h.feed);
    let v1 = feed.add_subscription("app", manifest(&[("AELF", 1)])).await.unwrap();
    let id = PusherId::new("app", v1, "AELF");

    for _ in 0..200 {
        feed.start_scan("app", v1).await.unwrap();
        let audits: Vec<_> = (0..3)
            .map(|_| {
                let feed = Arc::clone(&feed);
                tokio::spawn(async move { feed.audit().await })
            })
            .collect();
        feed.pause("app", v1).await.unwrap();
        feed.start_scan("app", v1).await.unwrap();
        for audit in audits {
            audit.await.unwrap().unwrap();
        }

        assert_eq!(
            feed.get_subscription_status("app", v1).await.unwrap(),
            SubscriptionStatus::Started
        );
        assert!(feed.get_all_active_pusher_ids().await.unwrap()["AELF"].contains(&id));
    }
}
