//! Join, produce, consume and leave flows against an in-process fake worker

use serde_json::json;
use sfu_engine::test_helpers::{
    audio_producer_options, create_router, endpoint_rtp_capabilities, fake_worker,
    video_producer_options, FakeWorker,
};
use sfu_engine::{AppData, Producer, Worker, WebRtcTransportSettings};
use sfu_meeting::{
    CreateWebRtcTransportRequest, Error, MeetingConfig, MeetingManager, Peer, PeerId,
    ProduceRequest, RoomId,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

struct Meeting {
    _worker: Arc<Worker>,
    fake: FakeWorker,
    manager: Arc<MeetingManager>,
}

impl Meeting {
    async fn new() -> Self {
        let (worker, fake) = fake_worker();
        let router = create_router(&worker).await.unwrap();
        let manager = MeetingManager::new(
            router,
            WebRtcTransportSettings::default(),
            MeetingConfig::default(),
        );
        Self {
            _worker: worker,
            fake,
            manager,
        }
    }

    /// A peer with both transports, its capabilities set and joined to `rooms`
    async fn peer(&self, id: &str, rooms: &[&str]) -> Arc<Peer> {
        let peer = self
            .manager
            .create_peer(PeerId::from(id), id, None, AppData::new())
            .unwrap();
        peer.set_rtp_capabilities(endpoint_rtp_capabilities()).await.unwrap();
        for (producing, consuming) in [(true, false), (false, true)] {
            peer.create_webrtc_transport(CreateWebRtcTransportRequest {
                producing,
                consuming,
                ..CreateWebRtcTransportRequest::default()
            })
            .await
            .unwrap();
        }
        for room in rooms {
            self.manager.join_room(peer.id(), RoomId::from(*room)).await.unwrap();
        }
        peer
    }
}

fn produce_request(source: &str, room: &str) -> ProduceRequest {
    let options = if source == "mic" {
        audio_producer_options()
    } else {
        video_producer_options()
    };
    let mut app_data = AppData::new();
    app_data.insert("source".to_string(), json!(source));
    app_data.insert("roomId".to_string(), json!(room));
    ProduceRequest {
        kind: options.kind,
        rtp_parameters: options.rtp_parameters,
        app_data,
    }
}

/// Poll until `check` holds; watcher tasks update peer indexes asynchronously
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

async fn holds(peer: &Peer, producer: &Producer) -> bool {
    peer.producer(producer.id()).await.is_some()
}

#[tokio::test]
async fn test_duplicate_source_is_rejected() {
    let meeting = Meeting::new().await;
    let alice = meeting.peer("alice", &["lobby"]).await;

    alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let err = alice.produce(produce_request("mic", "lobby")).await.unwrap_err();

    assert!(err.is_validation());
    assert_eq!(meeting.fake.count("transport.produce"), 1);
    assert_eq!(alice.producers().await.len(), 1);

    // another source is still fine
    alice.produce(produce_request("webcam", "lobby")).await.unwrap();
    assert_eq!(alice.producers().await.len(), 2);
}

#[tokio::test]
async fn test_leaving_consumer_reclaims_producer() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let consumer = bob.consume(&mic, &room).await.unwrap();

    meeting.manager.leave_room(bob.id(), &room).await.unwrap();

    assert!(consumer.is_closed());
    assert!(mic.is_closed());
    assert!(!holds(&alice, &mic).await);
    assert!(bob.consumers().await.is_empty());
    meeting.fake.wait_for_request("producer.close").await;
}

#[tokio::test]
async fn test_remaining_consumer_retains_producer() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;
    let carol = meeting.peer("carol", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    bob.consume(&mic, &room).await.unwrap();
    let carols = carol.consume(&mic, &room).await.unwrap();

    meeting.manager.leave_room(bob.id(), &room).await.unwrap();
    assert!(!mic.is_closed());
    assert!(!carols.is_closed());
    assert!(holds(&alice, &mic).await);

    meeting.manager.leave_room(carol.id(), &room).await.unwrap();
    assert!(mic.is_closed());
}

#[tokio::test]
async fn test_consumers_count_only_outside_the_room_left() {
    let meeting = Meeting::new().await;
    let alice = meeting.peer("alice", &["a", "b"]).await;
    let bob = meeting.peer("bob", &["a", "b"]).await;

    let mic = alice.produce(produce_request("mic", "a")).await.unwrap();
    bob.consume(&mic, &RoomId::from("a")).await.unwrap();

    // bob's consumer belongs to room a, so leaving b keeps it
    meeting.manager.leave_room(bob.id(), &RoomId::from("b")).await.unwrap();
    assert!(!mic.is_closed());
    assert_eq!(bob.consumers().await.len(), 1);

    meeting.manager.leave_room(bob.id(), &RoomId::from("a")).await.unwrap();
    assert!(mic.is_closed());
}

#[tokio::test]
async fn test_leaving_producer_closes_unconsumed_producers() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let webcam = alice.produce(produce_request("webcam", "lobby")).await.unwrap();
    bob.consume(&mic, &room).await.unwrap();

    let closed = alice.close_producers_no_consumers(&room).await.unwrap();
    assert_eq!(closed, vec![webcam.id().clone()]);
    assert!(webcam.is_closed());
    assert!(!mic.is_closed());
}

#[tokio::test]
async fn test_producer_close_drops_remote_consumers() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let consumer = bob.consume(&mic, &room).await.unwrap();

    alice.close_producer(mic.id()).await.unwrap();

    assert!(consumer.is_closed());
    eventually(|| {
        let bob = Arc::clone(&bob);
        async move { bob.consumers().await.is_empty() }
    })
    .await;
    assert_eq!(meeting.fake.count("consumer.close"), 0);
}

#[tokio::test]
async fn test_concurrent_reclaims_do_not_deadlock() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let alice_mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let bob_mic = bob.produce(produce_request("mic", "lobby")).await.unwrap();
    alice.consume(&bob_mic, &room).await.unwrap();
    bob.consume(&alice_mic, &room).await.unwrap();

    let nobody = RoomId::from("elsewhere");
    let reclaim = async {
        for _ in 0..20 {
            let (a, b) = tokio::join!(
                alice.close_producers_no_consumers(&nobody),
                bob.close_producers_no_consumers(&nobody),
            );
            assert!(a.unwrap().is_empty());
            assert!(b.unwrap().is_empty());
        }
    };
    tokio::time::timeout(Duration::from_secs(5), reclaim)
        .await
        .expect("reclaim deadlocked");
}

#[tokio::test]
async fn test_close_peer_cascades() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let bob_mic = bob.produce(produce_request("mic", "lobby")).await.unwrap();
    let consumer = bob.consume(&mic, &room).await.unwrap();
    alice.consume(&bob_mic, &room).await.unwrap();

    meeting.manager.close_peer(alice.id()).await.unwrap();

    assert!(alice.is_closed());
    assert!(mic.is_closed());
    assert!(consumer.is_closed());
    // only alice consumed bob's mic
    assert!(bob_mic.is_closed());
    assert_eq!(meeting.manager.peer_count(), 1);
    assert_eq!(meeting.manager.room(&room).unwrap().len(), 1);

    let err = alice.produce(produce_request("webcam", "lobby")).await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
}

#[tokio::test]
async fn test_worker_death_empties_peers() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let consumer = bob.consume(&mic, &room).await.unwrap();

    meeting.fake.kill();

    eventually(|| {
        let (alice, bob) = (Arc::clone(&alice), Arc::clone(&bob));
        async move { alice.producers().await.is_empty() && bob.consumers().await.is_empty() }
    })
    .await;
    assert!(mic.is_closed());
    assert!(consumer.is_closed());

    // the router went down with the worker
    let carol = meeting
        .manager
        .create_peer(PeerId::from("carol"), "Carol", None, AppData::new())
        .unwrap();
    let err = carol
        .create_webrtc_transport(CreateWebRtcTransportRequest {
            consuming: true,
            ..CreateWebRtcTransportRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Engine(_)));
}

#[tokio::test]
async fn test_leaving_producer_stops_its_media() {
    let meeting = Meeting::new().await;
    let room = RoomId::from("lobby");
    let alice = meeting.peer("alice", &["lobby"]).await;
    let bob = meeting.peer("bob", &["lobby"]).await;

    let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
    let consumer = bob.consume(&mic, &room).await.unwrap();

    meeting.manager.leave_room(alice.id(), &room).await.unwrap();

    // bob no longer shares a room with alice
    assert!(mic.is_closed());
    assert!(consumer.is_closed());
}

#[tokio::test]
async fn test_consumer_created_during_reclaim_keeps_producer() {
    // the scan visits peers in map order, so repeat to cover both orders
    for trial in 0..6 {
        let meeting = Meeting::new().await;
        let room = RoomId::from("lobby");
        let alice = meeting.peer("alice", &["lobby"]).await;
        let bob = meeting.peer("bob", &["lobby"]).await;
        let carol = meeting.peer("carol", &["lobby"]).await;

        let mic = alice.produce(produce_request("mic", "lobby")).await.unwrap();
        let carol_mic = carol.produce(produce_request("mic", "lobby")).await.unwrap();

        // carol stays locked until her stats request is answered
        meeting.fake.stall("producer.getStats");
        let stats = tokio::spawn({
            let (carol, id) = (Arc::clone(&carol), carol_mic.id().clone());
            async move { carol.get_producer_stats(&id).await }
        });
        let stalled = meeting.fake.wait_for_request("producer.getStats").await;

        let reclaim = tokio::spawn({
            let alice = Arc::clone(&alice);
            async move { alice.close_producers_no_consumers(&RoomId::from("elsewhere")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reclaim.is_finished(), "trial {trial}");

        let consumer = bob.consume(&mic, &room).await.unwrap();
        meeting.fake.answer(&stalled, json!({}));

        let closed = reclaim.await.unwrap().unwrap();
        stats.await.unwrap().unwrap();
        assert!(closed.is_empty(), "trial {trial}");
        assert!(!mic.is_closed(), "trial {trial}");
        assert!(!consumer.is_closed(), "trial {trial}");
        assert!(holds(&alice, &mic).await);
    }
}
