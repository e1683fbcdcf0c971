#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use sphere_domain::{Identity, Message, NewMessage, RoomId, UserId};
use sphere_protocol::{InboundEvent, SendGlobalMessage, SendMessage, SendRoomMessage};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::directory::{Directory, InMemoryDirectory};
use crate::server::registry::{ConnectionRegistry, OutboundFrame, RegistryConfig, SessionHandle};
use crate::server::router::{DropReason, InviteError, RoomRouter, RouteOutcome, RouterConfig};
use crate::server::store::{InMemoryMessageStore, MessageStore, StoreError};

struct Harness {
	registry: ConnectionRegistry,
	store: Arc<InMemoryMessageStore>,
	directory: Arc<InMemoryDirectory>,
	router: RoomRouter,
}

fn harness() -> Harness {
	let registry = ConnectionRegistry::new(RegistryConfig {
		outbound_queue_capacity: 16,
		debug_logs: false,
	});
	let store = Arc::new(InMemoryMessageStore::new());
	let directory = Arc::new(InMemoryDirectory::new());
	let router = RoomRouter::new(
		registry.clone(),
		store.clone(),
		directory.clone(),
		RouterConfig {
			send_timeout: Duration::from_millis(100),
			..RouterConfig::default()
		},
	);

	Harness {
		registry,
		store,
		directory,
		router,
	}
}

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn identity(id: &str) -> Identity {
	Identity::new(user(id), format!("{id}-name"))
}

async fn connect(h: &Harness, id: &str) -> (SessionHandle, mpsc::Receiver<OutboundFrame>) {
	h.registry.admit(Some(identity(id)), []).await
}

async fn recv_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> serde_json::Value {
	let frame = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected to receive within timeout")
		.expect("channel open");
	serde_json::from_str(&frame).expect("valid json frame")
}

async fn assert_silent(rx: &mut mpsc::Receiver<OutboundFrame>) {
	let got = timeout(Duration::from_millis(50), rx.recv()).await;
	assert!(got.is_err(), "unexpected frame: {got:?}");
}

fn direct(to: &str, content: &str) -> InboundEvent {
	InboundEvent::SendMessage(SendMessage {
		recipient_unique_id: Some(to.to_string()),
		content: Some(content.to_string()),
	})
}

fn global(content: &str) -> InboundEvent {
	InboundEvent::SendGlobalMessage(SendGlobalMessage {
		content: Some(content.to_string()),
	})
}

#[tokio::test]
async fn global_message_reaches_everyone_with_identical_copies() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;
	let (_b, mut b_rx) = connect(&h, "b").await;

	let outcome = h.router.route(&a, global("hi")).await;
	let RouteOutcome::Delivered { report, .. } = outcome else {
		panic!("expected delivery, got: {outcome:?}");
	};
	assert_eq!(report.delivered, 2);

	let to_a = recv_json(&mut a_rx).await;
	let to_b = recv_json(&mut b_rx).await;
	assert_eq!(to_a["event"], "receive_global_message");
	assert_eq!(to_a, to_b);
	assert_eq!(to_a["data"]["content"], "hi");
	assert_eq!(to_a["data"]["is_global"], true);
	assert_eq!(to_a["data"]["sender"]["id"], "a");
	assert_eq!(to_a["data"]["sender"]["username"], "a-name");

	assert_silent(&mut a_rx).await;
	assert_silent(&mut b_rx).await;
}

#[tokio::test]
async fn global_message_reaches_unauthenticated_listeners() {
	let h = harness();
	let (a, _a_rx) = connect(&h, "a").await;
	let (_anon, mut anon_rx) = h.registry.admit(None, []).await;

	h.router.route(&a, global("hello lurkers")).await;
	let got = recv_json(&mut anon_rx).await;
	assert_eq!(got["data"]["content"], "hello lurkers");
}

#[tokio::test]
async fn direct_message_to_offline_user_is_persisted_and_echoed_only() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;

	let outcome = h.router.route(&a, direct("b", "are you there")).await;
	let RouteOutcome::Delivered { report, message_id } = outcome else {
		panic!("expected delivery, got: {outcome:?}");
	};
	// echo only; the offline recipient gets nothing and nothing is queued for them
	assert_eq!(report.delivered, 1);

	let stored = h.store.messages().await;
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].id, message_id);
	assert_eq!(stored[0].recipient_id(), Some(&user("b")));

	let echo = recv_json(&mut a_rx).await;
	assert_eq!(echo["data"]["recipient_id"], "b");

	let (_b, mut b_rx) = connect(&h, "b").await;
	assert_silent(&mut b_rx).await;
}

#[tokio::test]
async fn direct_message_to_online_user_delivers_twice() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;
	let (_b, mut b_rx) = connect(&h, "b").await;
	let (_c, mut c_rx) = connect(&h, "c").await;

	let outcome = h.router.route(&a, direct("b", "psst")).await;
	let RouteOutcome::Delivered { report, .. } = outcome else {
		panic!("expected delivery, got: {outcome:?}");
	};
	assert_eq!(report.delivered, 2);

	let to_b = recv_json(&mut b_rx).await;
	let to_a = recv_json(&mut a_rx).await;
	assert_eq!(to_b["event"], "receive_message");
	assert_eq!(to_b, to_a);
	assert_eq!(to_b["data"]["sender_id"], "a");
	assert_eq!(to_b["data"]["recipient_id"], "b");
	assert_eq!(to_b["data"]["content"], "psst");

	assert_silent(&mut c_rx).await;
}

#[tokio::test]
async fn direct_message_to_self_is_delivered_once() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;

	let outcome = h.router.route(&a, direct("a", "note to self")).await;
	let RouteOutcome::Delivered { report, .. } = outcome else {
		panic!("expected delivery, got: {outcome:?}");
	};
	assert_eq!(report.delivered, 1);
	recv_json(&mut a_rx).await;
	assert_silent(&mut a_rx).await;
}

#[tokio::test]
async fn malformed_events_are_dropped_without_side_effects() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;
	let (_b, mut b_rx) = connect(&h, "b").await;

	let cases = [
		InboundEvent::SendMessage(SendMessage {
			recipient_unique_id: Some("b".to_string()),
			content: None,
		}),
		InboundEvent::SendMessage(SendMessage {
			recipient_unique_id: None,
			content: Some("x".to_string()),
		}),
		direct("b", "   "),
		direct("  ", "x"),
		InboundEvent::SendGlobalMessage(SendGlobalMessage { content: None }),
		global(""),
	];

	for ev in cases {
		assert_eq!(h.router.route(&a, ev).await, RouteOutcome::Dropped(DropReason::Malformed));
	}

	assert!(h.store.messages().await.is_empty());
	assert_silent(&mut a_rx).await;
	assert_silent(&mut b_rx).await;
	assert!(h.registry.is_admitted(a.id()).await);
}

#[tokio::test]
async fn unauthenticated_senders_are_ignored() {
	let h = harness();
	let (anon, mut anon_rx) = h.registry.admit(None, []).await;
	let (_b, mut b_rx) = connect(&h, "b").await;

	assert_eq!(
		h.router.route(&anon, global("hi")).await,
		RouteOutcome::Dropped(DropReason::Unauthenticated)
	);
	assert_eq!(
		h.router.route(&anon, direct("b", "hi")).await,
		RouteOutcome::Dropped(DropReason::Unauthenticated)
	);

	assert!(h.store.messages().await.is_empty());
	assert_silent(&mut anon_rx).await;
	assert_silent(&mut b_rx).await;
}

#[tokio::test]
async fn superseded_session_gets_no_direct_messages() {
	let h = harness();
	let (a, _a_rx) = connect(&h, "a").await;
	let (_b_old, mut b_old_rx) = connect(&h, "b").await;
	let (_b_new, mut b_new_rx) = connect(&h, "b").await;

	h.router.route(&a, direct("b", "which one")).await;

	recv_json(&mut b_new_rx).await;
	assert_silent(&mut b_old_rx).await;
}

#[tokio::test]
async fn dead_recipient_is_evicted_and_sender_still_gets_echo() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;
	let (b, b_rx) = connect(&h, "b").await;
	drop(b_rx);

	let outcome = h.router.route(&a, direct("b", "hello?")).await;
	let RouteOutcome::Delivered { report, .. } = outcome else {
		panic!("expected delivery, got: {outcome:?}");
	};
	assert_eq!((report.delivered, report.failed), (1, 1));

	recv_json(&mut a_rx).await;
	assert!(!h.registry.is_admitted(b.id()).await);
	assert!(h.registry.notification_channel_of(&user("b")).await.is_none());
}

fn to_room(room: &str, content: &str) -> InboundEvent {
	InboundEvent::SendRoomMessage(SendRoomMessage {
		room_id: Some(room.to_string()),
		content: Some(content.to_string()),
	})
}

#[tokio::test]
async fn room_message_reaches_members_only() {
	let h = harness();
	let room = RoomId::private("book-club").expect("valid");

	let (a, mut a_rx) = h.registry.admit(Some(identity("a")), [room.clone()]).await;
	let (_b, mut b_rx) = h.registry.admit(Some(identity("b")), [room.clone()]).await;
	let (_c, mut c_rx) = connect(&h, "c").await;
	let (_anon, mut anon_rx) = h.registry.admit(None, []).await;

	let outcome = h.router.route(&a, to_room("room:book-club", "chapter 3")).await;
	let RouteOutcome::Delivered { report, message_id } = outcome else {
		panic!("expected delivery, got: {outcome:?}");
	};
	assert_eq!(report.delivered, 2);

	let to_a = recv_json(&mut a_rx).await;
	let to_b = recv_json(&mut b_rx).await;
	assert_eq!(to_a["event"], "receive_room_message");
	assert_eq!(to_a, to_b);
	assert_eq!(to_a["data"]["room_id"], "room:book-club");
	assert_eq!(to_a["data"]["sender"]["id"], "a");
	assert_eq!(to_a["data"]["id"], message_id.to_string());

	assert_silent(&mut c_rx).await;
	assert_silent(&mut anon_rx).await;

	let stored = h.store.messages().await;
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].room_id(), Some(&room));
}

#[tokio::test]
async fn room_message_accepts_bare_room_key() {
	let h = harness();
	let room = RoomId::private("book-club").expect("valid");
	let (a, mut a_rx) = h.registry.admit(Some(identity("a")), [room]).await;

	let outcome = h.router.route(&a, to_room("book-club", "bare")).await;
	assert!(matches!(outcome, RouteOutcome::Delivered { .. }), "got: {outcome:?}");
	let got = recv_json(&mut a_rx).await;
	assert_eq!(got["data"]["room_id"], "room:book-club");
}

#[tokio::test]
async fn room_message_from_non_member_is_dropped() {
	let h = harness();
	let room = RoomId::private("book-club").expect("valid");
	let (_a, mut a_rx) = h.registry.admit(Some(identity("a")), [room]).await;
	let (c, mut c_rx) = connect(&h, "c").await;

	assert_eq!(
		h.router.route(&c, to_room("room:book-club", "let me in")).await,
		RouteOutcome::Dropped(DropReason::NotAMember)
	);

	assert!(h.store.messages().await.is_empty());
	assert_silent(&mut a_rx).await;
	assert_silent(&mut c_rx).await;
}

#[tokio::test]
async fn room_message_with_bad_room_is_malformed() {
	let h = harness();
	let (a, mut a_rx) = connect(&h, "a").await;

	for room in ["", "room:", "global_chat"] {
		assert_eq!(
			h.router.route(&a, to_room(room, "x")).await,
			RouteOutcome::Dropped(DropReason::Malformed),
			"room id {room:?}"
		);
	}
	assert_eq!(
		h.router.route(&a, to_room("room:book-club", "  ")).await,
		RouteOutcome::Dropped(DropReason::Malformed)
	);

	assert!(h.store.messages().await.is_empty());
	assert_silent(&mut a_rx).await;
}

#[tokio::test]
async fn invited_session_receives_later_room_messages() {
	let h = harness();
	let room = RoomId::private("book-club").expect("valid");
	h.directory_add(&room, &["a"]).await;
	h.directory.befriend(&user("a"), &user("b")).await;

	let (a, _a_rx) = h.registry.admit(Some(identity("a")), [room.clone()]).await;
	let (_b, mut b_rx) = connect(&h, "b").await;

	h.router.invite(&identity("a"), &room, &[user("b")]).await.expect("invite");
	let invitation = recv_json(&mut b_rx).await;
	assert_eq!(invitation["event"], "room_invitation");

	h.router.route(&a, to_room("room:book-club", "welcome")).await;
	let got = recv_json(&mut b_rx).await;
	assert_eq!(got["event"], "receive_room_message");
	assert_eq!(got["data"]["content"], "welcome");
}

struct FailingStore;

#[async_trait::async_trait]
impl MessageStore for FailingStore {
	async fn persist(&self, _message: NewMessage) -> Result<Message, StoreError> {
		Err(StoreError::Unavailable("store offline".to_string()))
	}
}

#[tokio::test]
async fn persistence_failure_delivers_nothing_and_keeps_session() {
	let registry = ConnectionRegistry::default();
	let router = RoomRouter::new(
		registry.clone(),
		Arc::new(FailingStore),
		Arc::new(InMemoryDirectory::new()),
		RouterConfig::default(),
	);

	let (a, mut a_rx) = registry.admit(Some(identity("a")), []).await;
	let (_b, mut b_rx) = registry.admit(Some(identity("b")), []).await;

	assert_eq!(router.route(&a, global("lost")).await, RouteOutcome::Failed);
	assert_eq!(router.route(&a, direct("b", "lost")).await, RouteOutcome::Failed);

	assert_silent(&mut a_rx).await;
	assert_silent(&mut b_rx).await;
	assert!(registry.is_admitted(a.id()).await);
}

#[tokio::test]
async fn invite_requires_membership_and_friendship() {
	let h = harness();
	let room = RoomId::private("book-club").expect("valid");

	let err = h
		.router
		.invite(&identity("a"), &room, &[user("b")])
		.await
		.expect_err("inviter is not a member");
	assert!(matches!(err, InviteError::NotAMember));

	h.directory_add(&room, &["a"]).await;
	let err = h
		.router
		.invite(&identity("a"), &room, &[user("b")])
		.await
		.expect_err("not friends");
	assert!(matches!(err, InviteError::NotFriends(u) if u == user("b")));

	let err = h
		.router
		.invite(&identity("a"), &RoomId::Global, &[user("b")])
		.await
		.expect_err("global room");
	assert!(matches!(err, InviteError::NotPrivate));
}

#[tokio::test]
async fn invite_joins_online_invitees_and_notifies_them() {
	let h = harness();
	let room = RoomId::private("book-club").expect("valid");
	h.directory_add(&room, &["a"]).await;
	h.directory.befriend(&user("a"), &user("b")).await;
	h.directory.befriend(&user("a"), &user("c")).await;

	let (_a, _a_rx) = connect(&h, "a").await;
	let (b, mut b_rx) = connect(&h, "b").await;

	let receipt = h
		.router
		.invite(&identity("a"), &room, &[user("b"), user("c"), user("b")])
		.await
		.expect("invite");
	assert_eq!(receipt.invited, vec![user("b"), user("c")]);
	assert_eq!(receipt.sessions_joined, 1);
	assert_eq!(receipt.notified, 1);

	let got = recv_json(&mut b_rx).await;
	assert_eq!(got["event"], "room_invitation");
	assert_eq!(got["data"]["room_id"], "room:book-club");
	assert_eq!(got["data"]["inviter"]["id"], "a");

	let rooms = h.registry.rooms_of(b.id()).await.expect("admitted");
	assert!(rooms.contains(&room));
	assert!(h.router.directory().is_room_member(&room, &user("c")).await.expect("query"));
}

impl Harness {
	async fn directory_add(&self, room: &RoomId, users: &[&str]) {
		let users: Vec<UserId> = users.iter().map(|u| user(u)).collect();
		self.directory.add_room_members(room, &users).await.expect("add members");
	}
}
