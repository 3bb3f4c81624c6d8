//! Routing between trees and layers inside the space manager
//!
//! Uses in-memory layers and the simulated hub so every save can be counted.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use spaceweave::space::{
    LayerErrorEvent, Space, SpaceError, SpaceManager, SpacePointer, StaticLayerFactory,
};
use spaceweave::sync::{MemoryHub, MemoryLayer, MemoryTransport, SyncLayer};
use spaceweave::tree::{OpId, Operation, VertexTree};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn empty_factory() -> Arc<StaticLayerFactory> {
    Arc::new(StaticLayerFactory::new())
}

/// Poll a condition for up to two seconds
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..80 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

struct Peer {
    manager: SpaceManager<VertexTree>,
    disk: Arc<MemoryLayer>,
    wire: Arc<MemoryTransport>,
}

/// A manager with one memory persistence layer and one hub transport,
/// opened on the same space id as its peers.
async fn peer(name: &str, hub: &Arc<MemoryHub>, space_id: &str) -> (Peer, spaceweave::SpaceHandle) {
    let disk = Arc::new(MemoryLayer::new(format!("{name}-disk"), space_id));
    let wire = Arc::new(hub.create_transport(format!("{name}-wire"), space_id));
    let manager = SpaceManager::new(name, empty_factory());

    let space = Space::with_id(space_id, name);
    let layers: Vec<Arc<dyn SyncLayer>> = vec![disk.clone(), wire.clone()];
    let handle = manager.add_new_space(space, layers).await.unwrap();
    (
        Peer {
            manager,
            disk,
            wire,
        },
        handle,
    )
}

// ---------------------------------------------------------------------------
// Fan-out and echo
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_local_ops_fan_out_without_echo() {
    let hub = MemoryHub::new();
    let (alice, alice_space) = peer("alice", &hub, "space1").await;
    let (bob, bob_space) = peer("bob", &hub, "space1").await;

    alice_space
        .tree()
        .write()
        .unwrap()
        .set_property("space1", "title", json!("hello"));

    assert!(
        eventually(|| {
            bob_space.tree().read().unwrap().get_property("space1", "title") == Some(&json!("hello"))
        })
        .await
    );
    assert!(eventually(|| bob.disk.save_calls("space1") == 1).await);

    // Give an echo time to happen before asserting it did not
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.disk.save_calls("space1"), 1);
    assert_eq!(hub.frames_published(), 1, "bob sent alice's op back");
    assert_eq!(bob.disk.stored_ops("space1").len(), 1);

    assert_eq!(alice.wire.id(), "alice-wire");
    alice.manager.close_all().await;
    bob.manager.close_all().await;
}

#[tokio::test]
async fn test_transient_ops_reach_peers_but_not_storage() {
    let hub = MemoryHub::new();
    let (alice, alice_space) = peer("alice", &hub, "space1").await;
    let (bob, bob_space) = peer("bob", &hub, "space1").await;

    alice_space
        .tree()
        .write()
        .unwrap()
        .set_transient_property("space1", "cursor", json!(7));

    assert!(
        eventually(|| {
            bob_space.tree().read().unwrap().get_property("space1", "cursor") == Some(&json!(7))
        })
        .await
    );
    assert_eq!(alice.disk.save_calls("space1"), 0);
    assert_eq!(bob.disk.save_calls("space1"), 0);

    alice.manager.close_all().await;
    bob.manager.close_all().await;
}

#[tokio::test]
async fn test_new_space_saves_existing_ops() {
    let ops = vec![
        Operation::set_property(OpId::new("a", 1), "space1", "name", json!("Inbox")),
        Operation::set_transient_property(OpId::new("a", 2), "space1", "typing", json!(true)),
    ];
    let disk = Arc::new(MemoryLayer::new("disk", "space1"));
    let manager: SpaceManager = SpaceManager::new("a", empty_factory());

    manager
        .add_new_space(Space::from_ops("space1", "a", ops.clone()), vec![disk.clone()])
        .await
        .unwrap();

    assert_eq!(disk.stored_ops("space1"), vec![ops[0].clone()]);
    assert!(matches!(
        manager
            .add_new_space(Space::with_id("space1", "a"), vec![])
            .await,
        Err(SpaceError::AlreadyOpen(_))
    ));
}

// ---------------------------------------------------------------------------
// Failure isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_failing_layer_does_not_block_the_others() {
    let good = Arc::new(MemoryLayer::new("good", "space1"));
    let bad = Arc::new(MemoryLayer::new("bad", "space1"));
    bad.set_fail_saves(true);

    let manager: SpaceManager = SpaceManager::new("a", empty_factory());
    let mut errors = manager.errors();
    let layers: Vec<Arc<dyn SyncLayer>> = vec![good.clone(), bad.clone()];
    let handle = manager
        .add_new_space(Space::with_id("space1", "a"), layers)
        .await
        .unwrap();

    handle
        .tree()
        .write()
        .unwrap()
        .set_property("space1", "k", json!(1));

    let event: LayerErrorEvent = tokio::time::timeout(Duration::from_secs(2), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.space_id, "space1");
    assert_eq!(event.layer_id, "bad");
    assert!(eventually(|| good.stored_ops("space1").len() == 1).await);

    // The manager keeps routing after the failure
    handle
        .tree()
        .write()
        .unwrap()
        .set_property("space1", "k", json!(2));
    assert!(eventually(|| good.stored_ops("space1").len() == 2).await);
}

#[tokio::test]
async fn test_layer_that_cannot_connect_is_dropped() {
    let good = Arc::new(MemoryLayer::new("good", "space1"));
    let offline = Arc::new(MemoryLayer::new("offline", "space1"));
    offline.set_fail_connect(true);

    let manager: SpaceManager = SpaceManager::new("a", empty_factory());
    let layers: Vec<Arc<dyn SyncLayer>> = vec![good.clone(), offline.clone()];
    let handle = manager
        .add_new_space(Space::with_id("space1", "a"), layers)
        .await
        .unwrap();

    let ids: Vec<&str> = handle.layers().iter().map(|l| l.id()).collect();
    assert_eq!(ids, vec!["good"]);
}

#[tokio::test]
async fn test_load_survives_one_failing_layer() {
    let stored = Operation::set_property(OpId::new("b", 4), "space1", "name", json!("Team"));
    let healthy = Arc::new(MemoryLayer::new("healthy", "space1").with_ops("space1", vec![stored]));
    let broken = Arc::new(MemoryLayer::new("broken", "space1"));
    broken.set_fail_loads(true);

    let factory = empty_factory();
    let layers: Vec<Arc<dyn SyncLayer>> = vec![healthy.clone(), broken.clone()];
    factory.register("mem://space1", "space1", layers, None).await;

    let manager: SpaceManager = SpaceManager::new("a", factory);
    let handle = manager.load_space_from_uri("mem://space1").await.unwrap();

    assert_eq!(
        handle.tree().read().unwrap().get_property("space1", "name"),
        Some(&json!("Team"))
    );
    // Failed loads keep the layer attached
    assert_eq!(handle.layers().len(), 2);

    // The layer that returned everything is not written to; the one that
    // failed is caught up with the whole tree
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(healthy.save_calls("space1"), 0);
    assert_eq!(broken.save_calls("space1"), 1);
    assert_eq!(broken.stored_ops("space1"), healthy.stored_ops("space1"));

    // A local op after the load reaches both layers
    handle
        .tree()
        .write()
        .unwrap()
        .set_property("space1", "name", json!("Team 2"));
    assert!(eventually(|| healthy.save_calls("space1") == 1).await);
    assert!(eventually(|| broken.save_calls("space1") == 2).await);
}

#[tokio::test]
async fn test_load_spreads_each_layers_ops_to_the_others() {
    let x = Operation::set_property(OpId::new("a", 1), "space1", "title", json!("X"));
    let y = Operation::set_property(OpId::new("b", 1), "space1", "color", json!("Y"));
    let left = Arc::new(MemoryLayer::new("left", "space1").with_ops("space1", vec![x.clone()]));
    let right = Arc::new(MemoryLayer::new("right", "space1").with_ops("space1", vec![y.clone()]));

    let factory = empty_factory();
    let layers: Vec<Arc<dyn SyncLayer>> = vec![left.clone(), right.clone()];
    factory.register("mem://space1", "space1", layers, None).await;

    let manager: SpaceManager = SpaceManager::new("c", factory);
    let handle = manager.load_space_from_uri("mem://space1").await.unwrap();
    assert_eq!(handle.tree().read().unwrap().op_count(), 2);
    manager.close_space("space1").await.unwrap();

    let sorted = |mut ops: Vec<Operation>| {
        ops.sort_by(|a, b| a.id.cmp(&b.id));
        ops
    };
    assert_eq!(sorted(left.stored_ops("space1")), vec![x.clone(), y.clone()]);
    assert_eq!(sorted(right.stored_ops("space1")), vec![x, y]);
    assert_eq!(left.save_calls("space1"), 1);
    assert_eq!(right.save_calls("space1"), 1);
}

#[tokio::test]
async fn test_app_tree_load_spreads_each_layers_ops() {
    let x = Operation::set_property(OpId::new("a", 1), "doc1", "body", json!("X"));
    let y = Operation::set_property(OpId::new("b", 1), "doc1", "author", json!("Y"));
    let left = Arc::new(MemoryLayer::new("left", "space1").with_ops("doc1", vec![x.clone()]));
    let right = Arc::new(MemoryLayer::new("right", "space1").with_ops("doc1", vec![y.clone()]));

    let factory = empty_factory();
    let layers: Vec<Arc<dyn SyncLayer>> = vec![left.clone(), right.clone()];
    factory.register("mem://space1", "space1", layers, None).await;

    let manager: SpaceManager = SpaceManager::new("c", factory);
    manager.load_space_from_uri("mem://space1").await.unwrap();
    let doc = manager.get_app_tree("space1", "doc1").await.unwrap();
    assert_eq!(doc.read().unwrap().get_property("doc1", "author"), Some(&json!("Y")));

    assert_eq!(left.stored_ops("doc1").len(), 2);
    assert_eq!(right.stored_ops("doc1").len(), 2);
}

#[tokio::test]
async fn test_load_with_every_layer_failing_is_unavailable() {
    let broken = Arc::new(MemoryLayer::new("broken", "space1"));
    broken.set_fail_loads(true);
    let factory = empty_factory();
    factory
        .register("mem://space1", "space1", vec![broken.clone() as Arc<dyn SyncLayer>], None)
        .await;

    let manager: SpaceManager = SpaceManager::new("a", factory);
    let pointer = SpacePointer {
        id: "space1".into(),
        uri: "mem://space1".into(),
    };
    match manager.load_space(&pointer).await {
        Err(SpaceError::SpaceUnavailable { space, reasons }) => {
            assert_eq!(space, "space1");
            assert_eq!(reasons.len(), 1);
        }
        other => panic!("expected SpaceUnavailable, got {:?}", other.map(|h| h.id().to_string())),
    }
    assert!(manager.get_space("space1").await.is_none());
    assert!(!broken.is_connected());
}

// ---------------------------------------------------------------------------
// App trees and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_incoming_ops_for_unloaded_app_tree_are_ignored_until_load() {
    let hub = MemoryHub::new();
    let (alice, _alice_space) = peer("alice", &hub, "space1").await;
    let (bob, bob_space) = peer("bob", &hub, "space1").await;

    let doc = alice.manager.create_app_tree("space1").await.unwrap();
    let doc_id = doc.read().unwrap().root_id().clone();
    doc.write()
        .unwrap()
        .set_property(doc_id.clone(), "body", json!("draft"));

    assert!(eventually(|| hub.frames_published() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(bob_space.app_tree(&doc_id).is_none());
    assert_eq!(bob.disk.save_calls(&doc_id), 0);

    // Loading reads the tree from bob's layers; the hub keeps history
    let bob_doc = bob.manager.get_app_tree("space1", &doc_id).await.unwrap();
    assert_eq!(
        bob_doc.read().unwrap().get_property(&doc_id, "body"),
        Some(&json!("draft"))
    );
    assert_eq!(bob_space.app_tree_ids(), vec![doc_id.clone()]);

    // Once loaded, later ops arrive live
    doc.write()
        .unwrap()
        .set_property(doc_id.clone(), "body", json!("final"));
    assert!(
        eventually(|| {
            bob_doc.read().unwrap().get_property(&doc_id, "body") == Some(&json!("final"))
        })
        .await
    );

    alice.manager.close_all().await;
    bob.manager.close_all().await;
}

#[tokio::test]
async fn test_close_drains_and_forgets_the_space() {
    let disk = Arc::new(MemoryLayer::new("disk", "space1"));
    let manager: SpaceManager = SpaceManager::new("a", empty_factory());
    let handle = manager
        .add_new_space(Space::with_id("space1", "a"), vec![disk.clone() as Arc<dyn SyncLayer>])
        .await
        .unwrap();

    {
        let tree = handle.tree();
        let mut tree = tree.write().unwrap();
        for i in 0..10 {
            tree.set_property("space1", format!("k{i}"), json!(i));
        }
    }
    manager.close_space("space1").await.unwrap();

    assert_eq!(disk.stored_ops("space1").len(), 10);
    assert!(!disk.is_connected());
    assert!(manager.get_space("space1").await.is_none());
    assert!(manager.space_ids().await.is_empty());
    assert!(matches!(
        manager.close_space("space1").await,
        Err(SpaceError::SpaceNotFound(_))
    ));
    assert!(matches!(
        manager.get_app_tree("space1", "anything").await,
        Err(SpaceError::SpaceNotFound(_))
    ));
}

#[tokio::test]
async fn test_ops_after_close_are_not_queued() {
    let disk = Arc::new(MemoryLayer::new("disk", "space1"));
    let manager: SpaceManager = SpaceManager::new("a", empty_factory());
    let handle = manager
        .add_new_space(Space::with_id("space1", "a"), vec![disk.clone() as Arc<dyn SyncLayer>])
        .await
        .unwrap();

    handle
        .tree()
        .write()
        .unwrap()
        .set_property("space1", "before", json!(1));
    manager.close_space("space1").await.unwrap();
    assert_eq!(disk.stored_ops("space1").len(), 1);

    // The handle outlives the space; its tree no longer reports to anyone
    handle
        .tree()
        .write()
        .unwrap()
        .set_property("space1", "after", json!(2));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(disk.stored_ops("space1").len(), 1);
    assert_eq!(
        handle.tree().read().unwrap().get_property("space1", "after"),
        Some(&json!(2))
    );
}
