//! 端到端会话流程：内存传输 + 进程内 REST

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};
use wanderchat_sdk::http_client::test_helpers::InMemoryChatApi;
use wanderchat_sdk::protocol::{
    DirectMessagePayload, GroupMessagePayload, NotificationPayload, ServerEvent,
};
use wanderchat_sdk::{
    MemoryPeer, MemoryTransport, MessageState, ReconnectConfig, SessionUser, Subscription,
    WanderchatConfig, WanderchatSDK,
};

struct Session {
    sdk: WanderchatSDK,
    api: Arc<InMemoryChatApi>,
    transport: MemoryTransport,
}

fn session(poll_interval_ms: u64) -> Session {
    let config = WanderchatConfig::builder()
        .socket_url("ws://chat.test/ws")
        .api_base_url("http://chat.test")
        .poll_interval_ms(poll_interval_ms)
        .reconnect(ReconnectConfig {
            initial_interval_ms: 200,
            max_interval_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        })
        .build();
    let api = Arc::new(InMemoryChatApi::new("me"));
    let transport = MemoryTransport::new();
    let sdk = WanderchatSDK::with_components(config, Arc::new(transport.clone()), api.clone()).unwrap();
    Session { sdk, api, transport }
}

fn me() -> SessionUser {
    SessionUser {
        user_id: "me".into(),
        display_name: "Me".into(),
    }
}

async fn login(s: &Session) -> MemoryPeer {
    s.sdk.connect(me(), "tok").await.unwrap();
    s.transport.accept().await.unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

async fn wait_connected(sdk: &WanderchatSDK) {
    for _ in 0..200 {
        if sdk.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("reconnect did not complete");
}

fn direct(id: &str, from: &str, to: &str, content: &str, at: DateTime<Utc>, key: Option<String>) -> DirectMessagePayload {
    DirectMessagePayload {
        id: id.into(),
        sender_id: from.into(),
        receiver_id: to.into(),
        content: content.into(),
        created_at: at,
        is_read: false,
        sender_name: None,
        client_message_id: key,
    }
}

fn sent_key(peer: &mut MemoryPeer) -> String {
    let frames = peer.drain();
    let frame = frames
        .iter()
        .find(|f| f.event == "send_message")
        .expect("send_message frame");
    frame.data["clientMessageId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn optimistic_send_is_replaced_in_place_by_echo() {
    let s = session(60_000);
    let base = Utc::now() - chrono::Duration::seconds(60);
    s.api.seed_direct(direct("1", "P", "me", "hey", base, None));
    s.api.seed_direct(direct("2", "me", "P", "hi!", base + chrono::Duration::seconds(1), None));
    let mut peer = login(&s).await;

    let chat = s.sdk.open_direct("P").unwrap();
    chat.mount().await.unwrap();
    assert_eq!(chat.messages().len(), 2);

    let optimistic = chat.send("Hola").await.unwrap();
    assert_eq!(optimistic.state, MessageState::Optimistic);
    assert_eq!(chat.messages()[2].id, optimistic.id);
    let key = sent_key(&mut peer);

    // 对端在回显之前发来一条
    let later = optimistic.created_at + chrono::Duration::milliseconds(10);
    peer.push(&ServerEvent::NewMessage(direct("41", "P", "me", "que tal", later, None)))
        .unwrap();
    let echo_at = optimistic.created_at + chrono::Duration::milliseconds(80);
    peer.push(&ServerEvent::NewMessage(direct("42", "me", "P", "Hola", echo_at, Some(key))))
        .unwrap();
    settle().await;

    let ids: Vec<String> = chat.messages().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["1", "2", "42", "41"]);
    assert!(chat.messages().iter().all(|m| m.state == MessageState::Confirmed));

    let conversations = s.sdk.conversations();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].conversation_id, "P_me");
    assert_eq!(s.sdk.unread().conversation_unread("P"), 2);
    chat.unmount();
}

#[tokio::test(start_paused = true)]
async fn poll_then_push_of_same_message_keeps_one_entry() {
    let s = session(1_000);
    let mut peer = login(&s).await;
    let chat = s.sdk.open_direct("P").unwrap();
    chat.mount().await.unwrap();
    assert!(chat.messages().is_empty());

    let at = Utc::now();
    let message = direct("42", "P", "me", "Hola", at, None);
    s.api.seed_direct(message.clone());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(chat.messages().len(), 1);

    peer.push(&ServerEvent::NewMessage(message)).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    let messages = chat.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "42");
    let _ = peer.drain();
}

#[tokio::test]
async fn group_listener_unsubscribing_mid_dispatch_does_not_starve_others() {
    let s = session(60_000);
    let mut peer = login(&s).await;
    let chat = s.sdk.open_group("G1").unwrap();
    chat.mount().await.unwrap();
    assert_eq!(peer.drain()[0].event, "join_group");

    let received = Arc::new(Mutex::new(Vec::new()));
    let mux = s.sdk.multiplexer();

    let r1 = received.clone();
    let _l1 = mux.subscribe_group("G1", move |_| r1.lock().push(1));
    let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
    let r2 = received.clone();
    let slot_cb = slot.clone();
    let l2 = mux.subscribe_group("G1", move |_| {
        r2.lock().push(2);
        if let Some(sub) = slot_cb.lock().take() {
            sub.unsubscribe();
        }
    });
    *slot.lock() = Some(l2);
    let r3 = received.clone();
    let _l3 = mux.subscribe_group("G1", move |_| r3.lock().push(3));

    let group_message = |id: &str| {
        ServerEvent::NewGroupMessage(GroupMessagePayload {
            id: id.into(),
            group_id: "G1".into(),
            sender_id: "p".into(),
            sender_email: Some("p@example.com".into()),
            content: "on my way".into(),
            created_at: Utc::now(),
            client_message_id: None,
        })
    };
    peer.push(&group_message("g1")).unwrap();
    settle().await;
    assert_eq!(*received.lock(), vec![1, 2, 3]);

    peer.push(&group_message("g2")).unwrap();
    settle().await;
    assert_eq!(*received.lock(), vec![1, 2, 3, 1, 3]);
    assert_eq!(chat.messages().len(), 2);

    chat.unmount();
    assert_eq!(peer.drain().last().map(|f| f.event.clone()), Some("leave_group".to_string()));
}

#[tokio::test]
async fn failed_send_while_offline_restores_text_and_retry_leaves_no_duplicate() {
    let s = session(60_000);
    let peer = login(&s).await;
    let chat = s.sdk.open_direct("P").unwrap();
    chat.mount().await.unwrap();

    peer.close("server restart");
    settle().await;
    assert!(!s.sdk.is_connected());

    // socket 断开，REST 回退也失败
    s.api.fail_next(0);
    let err = assert_err!(chat.send("Hola").await);
    assert_eq!(err.restored_content(), Some("Hola"));
    assert!(chat.messages().is_empty());

    let mut peer = s.transport.accept().await.unwrap();
    wait_connected(&s.sdk).await;

    let retry = chat.send("Hola").await.unwrap();
    let key = sent_key(&mut peer);
    let echo_at = retry.created_at + chrono::Duration::milliseconds(50);
    peer.push(&ServerEvent::NewMessage(direct("42", "me", "P", "Hola", echo_at, Some(key))))
        .unwrap();
    settle().await;

    let messages = chat.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "42");
    assert_eq!(messages[0].state, MessageState::Confirmed);
}

#[tokio::test]
async fn disconnect_detaches_notification_callbacks() {
    let s = session(60_000);
    let peer = login(&s).await;

    let stale = Arc::new(Mutex::new(0usize));
    let st = stale.clone();
    let _stale_sub = s.sdk.notifications().subscribe(move |_| *st.lock() += 1);

    let notification = |id: &str| {
        ServerEvent::NewNotification(NotificationPayload {
            id: id.into(),
            user_id: Some("me".into()),
            kind: "badge".into(),
            title: "New badge".into(),
            message: "Explorer".into(),
            read: false,
            data: None,
            created_at: Utc::now(),
        })
    };
    peer.push(&notification("n1")).unwrap();
    settle().await;
    assert_eq!(*stale.lock(), 1);

    s.sdk.disconnect();
    assert!(!s.sdk.is_connected());

    assert_ok!(s.sdk.connect(me(), "tok").await);
    let peer = s.transport.accept().await.unwrap();
    let fresh = Arc::new(Mutex::new(0usize));
    let f = fresh.clone();
    let _fresh_sub = s.sdk.notifications().subscribe(move |_| *f.lock() += 1);

    peer.push(&notification("n2")).unwrap();
    settle().await;
    assert_eq!(*stale.lock(), 1);
    assert_eq!(*fresh.lock(), 1);
    assert_eq!(s.sdk.notifications().unread_count(), 1);
}

#[tokio::test]
async fn logout_clears_session_state() {
    let s = session(60_000);
    let peer = login(&s).await;
    let chat = s.sdk.open_direct("P").unwrap();
    chat.mount().await.unwrap();
    peer.push(&ServerEvent::NewMessage(direct("1", "P", "me", "hola", Utc::now(), None)))
        .unwrap();
    settle().await;
    assert_eq!(s.sdk.conversations().len(), 1);

    let events = Arc::new(Mutex::new(0usize));
    let e = events.clone();
    let _listener = s.sdk.events().add_listener("*", move |_| *e.lock() += 1);

    chat.unmount();
    s.sdk.logout();

    assert!(s.sdk.current_user().is_none());
    assert!(s.sdk.conversations().is_empty());
    assert!(!s.sdk.is_connected());
    assert!(s.sdk.unread().summary().by_conversation.is_empty());
    assert!(chat.messages().is_empty());

    let before = *events.lock();
    peer.push(&ServerEvent::NewMessage(direct("2", "P", "me", "still there?", Utc::now(), None)))
        .ok();
    settle().await;
    assert_eq!(*events.lock(), before);
}

#[tokio::test(start_paused = true)]
async fn disconnect_unmounts_surfaces_and_stops_polling() {
    let s = session(1_000);
    let _peer = login(&s).await;
    let chat = s.sdk.open_direct("P").unwrap();
    chat.mount().await.unwrap();
    assert!(chat.is_polling());

    s.sdk.disconnect();
    assert!(!chat.is_mounted());
    assert!(!chat.is_polling());

    s.api.seed_direct(direct("9", "P", "me", "late", Utc::now(), None));
    let calls = s.api.call_count("conversation_history");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(s.api.call_count("conversation_history"), calls);
    assert!(s.sdk.conversations().is_empty());
    assert!(matches!(chat.send("hola").await, Err(wanderchat_sdk::SdkError::NotMounted)));
}
