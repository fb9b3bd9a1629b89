//! Devices syncing through an in-process server.
//!
//! The loopback transport calls the server directly, so these tests cover
//! the client queue, the commit path, the change log and the hub together
//! without sockets.

use async_trait::async_trait;
use carelog_sync_server::config::Config;
use carelog_sync_server::session::Session;
use carelog_sync_server::{AuthUser, SqliteStorage, SyncServer};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sync_client::{ClientConfig, SqliteLocalStore, SyncClient, Transport, TransportError};
use sync_types::{
    DeviceId, EntityId, EntityType, FamilyId, FrameKind, GlobalSeq, MutationEvent, Operation,
    PullRequest, PullResponse, PushRequest, PushResponse, UserId, Version,
};

#[derive(Clone)]
struct Loopback {
    server: Arc<SyncServer>,
    user: AuthUser,
    lose_next_ack: Arc<AtomicBool>,
}

impl Loopback {
    fn new(server: &Arc<SyncServer>, user: &str) -> Self {
        Self {
            server: Arc::clone(server),
            user: AuthUser {
                user_id: UserId::new(user),
                family_id: FamilyId::new("smith"),
            },
            lose_next_ack: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for Loopback {
    async fn push(&self, request: PushRequest) -> Result<PushResponse, TransportError> {
        let response = self
            .server
            .accept_batch(&self.user, request)
            .await
            .map_err(|e| TransportError::Status {
                status: 413,
                message: e.to_string(),
            })?;
        if self.lose_next_ack.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Timeout);
        }
        Ok(response)
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse, TransportError> {
        self.server
            .get_changes(&self.user.family_id, request)
            .await
            .map_err(|e| TransportError::Status {
                status: 500,
                message: e.to_string(),
            })
    }
}

type Device = SyncClient<Loopback, SqliteLocalStore>;

async fn server() -> Arc<SyncServer> {
    let storage = SqliteStorage::in_memory().await.unwrap();
    Arc::new(SyncServer::new(Config::default(), storage))
}

async fn device(transport: Loopback) -> (Device, DeviceId) {
    let device_id = DeviceId::new();
    let store = SqliteLocalStore::in_memory().await.unwrap();
    let client = SyncClient::open(ClientConfig::new(device_id), transport, store)
        .await
        .unwrap();
    (client, device_id)
}

async fn seed(server: &SyncServer, count: usize) {
    let user = AuthUser {
        user_id: UserId::new("carol"),
        family_id: FamilyId::new("smith"),
    };
    let events = (0..count)
        .map(|i| {
            MutationEvent::new(
                EntityType::Sleep,
                EntityId::new(format!("s{i}")),
                Operation::Create,
                json!({"minutes": 30}),
                Version::initial(),
            )
        })
        .collect();
    server
        .accept_batch(
            &user,
            PushRequest {
                device_id: DeviceId::new(),
                events,
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn offline_feeding_reaches_the_other_device() {
    let server = server().await;
    seed(&server, 100).await;

    let (bob, bob_device) = device(Loopback::new(&server, "bob")).await;
    bob.set_online(true).await;
    bob.sync().await.unwrap();
    assert_eq!(bob.status().await.unwrap().cursor, GlobalSeq::new(100));

    let bob_user = AuthUser {
        user_id: UserId::new("bob"),
        family_id: FamilyId::new("smith"),
    };
    let mut stream = Session::connect(Arc::clone(server.hub()), &bob_user, bob_device);
    stream.open(GlobalSeq::new(100)).unwrap();

    // Recorded while offline: cached and queued, nothing sent.
    let (alice, alice_device) = device(Loopback::new(&server, "alice")).await;
    let queued = alice
        .record(EntityType::Feeding, json!({"ml": 120}))
        .await
        .unwrap();
    let feeding_id = queued.event.entity_id.clone();
    assert_eq!(server.head(&FamilyId::new("smith")).await.unwrap(), GlobalSeq::new(100));
    let cached = alice
        .entity(EntityType::Feeding, &feeding_id)
        .await
        .unwrap()
        .unwrap();
    assert!(cached.has_pending);

    alice.set_online(true).await;
    let report = alice.sync().await.unwrap();
    assert_eq!(report.push.acked, 1);
    assert_eq!(server.head(&FamilyId::new("smith")).await.unwrap(), GlobalSeq::new(101));

    let confirmed = alice
        .entity(EntityType::Feeding, &feeding_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(confirmed.version, Version::new(1));
    assert!(!confirmed.has_pending);

    let connected = stream.next_frame().await.unwrap();
    assert!(matches!(connected.kind, FrameKind::Connected { head, .. } if head == GlobalSeq::new(100)));
    let change = stream.next_frame().await.unwrap();
    let FrameKind::Change(hint) = change.kind else {
        panic!("expected a change frame");
    };
    assert_eq!(hint.global_seq, GlobalSeq::new(101));
    assert_eq!(hint.origin_device, alice_device);
    assert!(bob.note_hint(&hint).await);

    let report = bob.sync().await.unwrap();
    assert_eq!(report.pull.applied, 1);
    assert_eq!(report.pull.cursor, GlobalSeq::new(101));

    let seen = bob
        .entity(EntityType::Feeding, &feeding_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.fields, json!({"ml": 120}));
    assert_eq!(seen.version, Version::new(1));
}

#[tokio::test]
async fn lost_ack_is_replayed_without_a_second_commit() {
    let server = server().await;
    let transport = Loopback::new(&server, "alice");
    let lose_ack = Arc::clone(&transport.lose_next_ack);
    let (alice, _) = device(transport).await;
    alice.set_online(true).await;

    let queued = alice
        .record(EntityType::Medication, json!({"name": "paracetamol", "ml": 2.5}))
        .await
        .unwrap();

    lose_ack.store(true, Ordering::SeqCst);
    assert!(alice.sync().await.is_err());
    assert_eq!(server.head(&FamilyId::new("smith")).await.unwrap(), GlobalSeq::new(1));
    assert_eq!(alice.status().await.unwrap().pending, 1);

    let report = alice.sync().await.unwrap();
    assert_eq!(report.push.acked, 1);
    assert_eq!(server.head(&FamilyId::new("smith")).await.unwrap(), GlobalSeq::new(1));
    assert_eq!(alice.status().await.unwrap().pending, 0);

    let cached = alice
        .entity(EntityType::Medication, &queued.event.entity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.version, Version::new(1));
}

#[tokio::test]
async fn concurrent_edits_to_different_fields_both_survive() {
    let server = server().await;
    let (alice, _) = device(Loopback::new(&server, "alice")).await;
    let (bob, _) = device(Loopback::new(&server, "bob")).await;
    alice.set_online(true).await;
    bob.set_online(true).await;

    let queued = alice
        .record(EntityType::Feeding, json!({"ml": 90, "side": "left"}))
        .await
        .unwrap();
    let id = queued.event.entity_id.clone();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice
        .enqueue(EntityType::Feeding, id.clone(), Operation::Update, json!({"ml": 120}))
        .await
        .unwrap();
    bob.enqueue(
        EntityType::Feeding,
        id.clone(),
        Operation::Update,
        json!({"side": "right"}),
    )
    .await
    .unwrap();

    alice.sync().await.unwrap();
    let report = bob.sync().await.unwrap();
    assert_eq!(report.push.rebased, 1);
    assert_eq!(report.push.acked, 1);
    alice.sync().await.unwrap();

    let expected = json!({"ml": 120, "side": "right"});
    for client in [&alice, &bob] {
        let entity = client
            .entity(EntityType::Feeding, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.fields, expected);
        assert_eq!(entity.version, Version::new(3));
    }
    assert_eq!(server.head(&FamilyId::new("smith")).await.unwrap(), GlobalSeq::new(3));
}

#[tokio::test]
async fn queued_followers_ride_along_with_a_rebase() {
    let server = server().await;
    let (alice, _) = device(Loopback::new(&server, "alice")).await;
    let (bob, _) = device(Loopback::new(&server, "bob")).await;
    alice.set_online(true).await;
    bob.set_online(true).await;

    let queued = alice
        .record(EntityType::Feeding, json!({"ml": 90, "side": "left"}))
        .await
        .unwrap();
    let id = queued.event.entity_id.clone();
    alice.sync().await.unwrap();
    bob.sync().await.unwrap();

    alice
        .enqueue(EntityType::Feeding, id.clone(), Operation::Update, json!({"side": "right"}))
        .await
        .unwrap();
    alice.sync().await.unwrap();

    bob.enqueue(EntityType::Feeding, id.clone(), Operation::Update, json!({"ml": 120}))
        .await
        .unwrap();
    bob.enqueue(EntityType::Feeding, id.clone(), Operation::Update, json!({"note": "b"}))
        .await
        .unwrap();
    let report = bob.sync().await.unwrap();

    assert_eq!(report.push.rebased, 1);
    assert_eq!(report.push.acked, 2);
    assert_eq!(server.metrics().conflicts_total.load(Ordering::Relaxed), 1);

    let entity = bob
        .entity(EntityType::Feeding, &id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entity.version, Version::new(4));
    assert_eq!(entity.fields, json!({"ml": 120, "side": "right", "note": "b"}));
}
