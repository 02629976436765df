// Integration test: two clients on one in-memory relay, each with a loopback
// media engine, running whole calls through their orchestrators.

use std::sync::Arc;
use std::time::Duration;

use carelink::calls::{CallError, CallHandle};
use carelink::channel::ChannelError;
use carelink::media::LoopbackMedia;
use carelink::relay::InMemoryRelay;
use carelink::{
    CallMedia, CallPhase, Client, ClientConfig, ClientError, Event, EventHandler, PresenceStatus,
    UserId,
};
use futures_util::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use test_utils::{ChannelEventHandler, next_matching, relay_with_users, user};

mod test_utils {
    use super::*;
    use carelink::carelink_core::RelayPaths;

    pub(crate) fn user(id: &str) -> UserId {
        id.parse().expect("test user id should be valid")
    }

    pub(crate) fn relay_with_users(users: &[&UserId]) -> InMemoryRelay {
        let relay = InMemoryRelay::new();
        for user in users {
            relay.register_user(&RelayPaths::default(), user);
        }
        relay
    }

    pub(crate) struct ChannelEventHandler {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl ChannelEventHandler {
        pub(crate) fn new() -> (Arc<Self>, UnboundedReceiver<Event>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    impl EventHandler for ChannelEventHandler {
        fn handle_event(&self, event: &Event) {
            let _ = self.tx.send(event.clone());
        }
    }

    pub(crate) async fn next_matching(
        events: &mut UnboundedReceiver<Event>,
        predicate: impl Fn(&Event) -> bool,
    ) -> Event {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("event bus should stay open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event was not dispatched")
    }
}

struct Party {
    id: UserId,
    client: Client,
    calls: CallHandle,
    events: UnboundedReceiver<Event>,
    media: Arc<LoopbackMedia>,
}

async fn join(relay: &InMemoryRelay, id: &UserId) -> Party {
    let media = Arc::new(LoopbackMedia::new());
    let client = Client::new(
        id.clone(),
        Arc::new(relay.clone()),
        media.clone(),
        ClientConfig::default(),
    );
    let (handler, events) = ChannelEventHandler::new();
    client.add_event_handler(handler);
    let calls = client.connect().await.expect("registered user should connect");
    Party {
        id: id.clone(),
        client,
        calls,
        events,
        media,
    }
}

async fn pair() -> (InMemoryRelay, Party, Party) {
    let caregiver = user("caregiver_7");
    let viu = user("viu_42");
    let relay = relay_with_users(&[&caregiver, &viu]);
    let caller = join(&relay, &caregiver).await;
    let callee = join(&relay, &viu).await;
    (relay, caller, callee)
}

async fn wait_phase(calls: &CallHandle, phase: CallPhase) {
    let mut changes = calls.watch();
    tokio::time::timeout(
        Duration::from_secs(5),
        changes.wait_for(|snapshot| snapshot.phase == phase),
    )
    .await
    .expect("phase should be reached in time")
    .expect("orchestrator should be running");
}

#[tokio::test]
async fn test_full_video_call_between_two_clients() {
    let (_relay, mut caller, mut callee) = pair().await;

    caller
        .calls
        .call(&callee.id, CallMedia::Video)
        .await
        .unwrap();
    let incoming = next_matching(&mut callee.events, |e| matches!(e, Event::IncomingCall(_))).await;
    let Event::IncomingCall(incoming) = incoming else {
        unreachable!()
    };
    assert_eq!(incoming.from, caller.id);
    assert_eq!(incoming.media, CallMedia::Video);

    callee.calls.accept().await.unwrap();

    next_matching(&mut caller.events, |e| matches!(e, Event::CallConnected(_))).await;
    next_matching(&mut callee.events, |e| matches!(e, Event::CallConnected(_))).await;
    wait_phase(&caller.calls, CallPhase::Connected).await;
    wait_phase(&callee.calls, CallPhase::Connected).await;

    let channel = callee.client.channel();
    assert_eq!(
        channel.status_of(&caller.id).await.unwrap(),
        PresenceStatus::InCall
    );
    assert_eq!(
        channel.status_of(&callee.id).await.unwrap(),
        PresenceStatus::InCall
    );
    assert!(caller.media.is_open().await && callee.media.is_open().await);

    caller.calls.hang_up().await.unwrap();
    let ended = next_matching(&mut callee.events, |e| matches!(e, Event::CallEnded(_))).await;
    assert_eq!(ended.closed().unwrap().peer, caller.id);
    wait_phase(&callee.calls, CallPhase::Idle).await;
    assert_eq!(caller.calls.phase(), CallPhase::Idle);

    assert_eq!(
        channel.status_of(&caller.id).await.unwrap(),
        PresenceStatus::Online
    );
    assert_eq!(
        channel.status_of(&callee.id).await.unwrap(),
        PresenceStatus::Online
    );
    assert!(!caller.media.is_open().await && !callee.media.is_open().await);
}

#[tokio::test]
async fn test_decline_reaches_the_caller() {
    let (_relay, mut caller, mut callee) = pair().await;

    caller
        .calls
        .call(&callee.id, CallMedia::Audio)
        .await
        .unwrap();
    next_matching(&mut callee.events, |e| matches!(e, Event::IncomingCall(_))).await;
    wait_phase(&callee.calls, CallPhase::Ringing).await;
    callee.calls.decline().await.unwrap();

    let denied = next_matching(&mut caller.events, |e| matches!(e, Event::CallDenied(_))).await;
    assert_eq!(denied.closed().unwrap().peer, callee.id);
    wait_phase(&caller.calls, CallPhase::Idle).await;
}

#[tokio::test]
async fn test_abort_before_pickup_reaches_the_callee() {
    let (_relay, mut caller, mut callee) = pair().await;

    caller
        .calls
        .call(&callee.id, CallMedia::Video)
        .await
        .unwrap();
    next_matching(&mut callee.events, |e| matches!(e, Event::IncomingCall(_))).await;
    caller.calls.hang_up().await.unwrap();

    next_matching(&mut callee.events, |e| matches!(e, Event::CallAborted(_))).await;
    wait_phase(&callee.calls, CallPhase::Idle).await;
    assert!(matches!(
        callee.calls.accept().await,
        Err(CallError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn test_logout_while_requesting() {
    let (_relay, caller, mut callee) = pair().await;

    caller
        .calls
        .call(&callee.id, CallMedia::Video)
        .await
        .unwrap();
    next_matching(&mut callee.events, |e| matches!(e, Event::IncomingCall(_))).await;

    caller.client.logout().await.unwrap();

    next_matching(&mut callee.events, |e| matches!(e, Event::CallAborted(_))).await;
    assert_eq!(
        callee.client.channel().status_of(&caller.id).await.unwrap(),
        PresenceStatus::Offline
    );
    assert!(matches!(
        caller.client.logout().await,
        Err(ClientError::NotConnected)
    ));
}

#[tokio::test]
async fn test_callee_logout_while_ringing_releases_the_caller() {
    let (_relay, mut caller, mut callee) = pair().await;

    caller
        .calls
        .call(&callee.id, CallMedia::Audio)
        .await
        .unwrap();
    next_matching(&mut callee.events, |e| matches!(e, Event::IncomingCall(_))).await;
    wait_phase(&callee.calls, CallPhase::Ringing).await;

    callee.client.logout().await.unwrap();

    let unanswered =
        next_matching(&mut caller.events, |e| matches!(e, Event::CallUnanswered(_))).await;
    assert_eq!(unanswered.closed().unwrap().peer, callee.id);
    wait_phase(&caller.calls, CallPhase::Idle).await;
}

#[tokio::test]
async fn test_presence_can_be_followed() {
    let (_relay, caller, callee) = pair().await;

    let mut statuses = Box::pin(
        callee
            .client
            .channel()
            .watch_status(&caller.id)
            .await
            .unwrap(),
    );
    assert_eq!(statuses.next().await, Some(PresenceStatus::Online));

    caller.client.logout().await.unwrap();
    assert_eq!(statuses.next().await, Some(PresenceStatus::Offline));
}

#[tokio::test]
async fn test_unregistered_user_cannot_connect() {
    let relay = relay_with_users(&[&user("caregiver_7")]);
    let client = Client::new(
        user("ghost_1"),
        Arc::new(relay),
        Arc::new(LoopbackMedia::new()),
        ClientConfig::default(),
    );

    assert!(matches!(
        client.connect().await,
        Err(ClientError::Channel(ChannelError::UnknownUser(_)))
    ));
    assert!(matches!(client.calls().await, Err(ClientError::NotConnected)));
}

#[tokio::test]
async fn test_second_connect_is_rejected() {
    let (_relay, caller, _callee) = pair().await;
    assert!(matches!(
        caller.client.connect().await,
        Err(ClientError::AlreadyConnected)
    ));
}
