use super::*;
use fabric_core::ids::MessageId;

fn frame() -> ServerFrame {
    ServerFrame::Pong { ts: 1 }
}

fn handle() -> (SessionHandle, mpsc::Receiver<ServerFrame>, CancellationToken) {
    let (tx, rx) = mpsc::channel(8);
    let close = CancellationToken::new();
    (
        SessionHandle::new(DeviceId::from("web".to_string()), tx, close.clone()),
        rx,
        close,
    )
}

#[tokio::test]
async fn second_session_for_same_device_displaces_first() {
    let hub = Hub::new();
    let user = UserId::new();
    let device = DeviceId::from("web".to_string());

    let (h1, _rx1, close1) = handle();
    let prior = hub.register(user, device.clone(), h1).await;
    assert!(prior.is_none());
    assert!(!close1.is_cancelled());

    let (h2, _rx2, _close2) = handle();
    let displaced = hub.register(user, device, h2).await;
    assert!(displaced.is_some());
    assert_eq!(hub.count().await, 1);

    // Registering over an existing (user, device) slot must signal the
    // prior session to close (S6).
    assert!(close1.is_cancelled());
}

#[tokio::test]
async fn unregister_removes_from_chat_membership() {
    let hub = Hub::new();
    let user = UserId::new();
    let device = DeviceId::from("web".to_string());
    let chat = ChatId::new();

    let (h1, _rx1, _close1) = handle();
    hub.register(user, device.clone(), h1).await;
    hub.subscribe(user, device.clone(), chat).await;
    assert!(hub.has_local_subscriber(chat).await);

    hub.unregister(user, &device).await;
    assert!(!hub.has_local_subscriber(chat).await);
    assert_eq!(hub.count().await, 0);
}

#[tokio::test]
async fn broadcast_delivers_to_all_local_subscribers() {
    let hub = Hub::new();
    let chat = ChatId::new();

    let u1 = UserId::new();
    let d1 = DeviceId::from("web".to_string());
    let (h1, mut rx1, _close1) = handle();
    hub.register(u1, d1.clone(), h1).await;
    hub.subscribe(u1, d1, chat).await;

    let u2 = UserId::new();
    let d2 = DeviceId::from("ios".to_string());
    let (h2, mut rx2, _close2) = handle();
    hub.register(u2, d2.clone(), h2).await;
    hub.subscribe(u2, d2, chat).await;

    let delivered = hub.broadcast_to_chat(chat, frame()).await;
    assert_eq!(delivered, 2);
    assert!(rx1.try_recv().is_ok());
    assert!(rx2.try_recv().is_ok());
}

#[tokio::test]
async fn broadcast_to_unknown_chat_delivers_to_nobody() {
    let hub = Hub::new();
    let delivered = hub.broadcast_to_chat(ChatId::new(), frame()).await;
    assert_eq!(delivered, 0);
}

#[tokio::test]
async fn send_to_closed_session_reports_closed() {
    let hub = Hub::new();
    let user = UserId::new();
    let device = DeviceId::from("web".to_string());
    let outcome = hub
        .send_to(
            user,
            &device,
            ServerFrame::Delivered {
                uuid: fabric_core::ids::ClientUuid::new(),
                msg_id: MessageId::from(42),
            },
        )
        .await;
    assert_eq!(outcome, SendOutcome::Closed);
}

#[tokio::test]
async fn sessions_for_user_counts_only_that_users_devices() {
    let hub = Hub::new();
    let user = UserId::new();
    let other = UserId::new();

    let (h1, _rx1, _close1) = handle();
    hub.register(user, DeviceId::from("web".to_string()), h1).await;
    let (h2, _rx2, _close2) = handle();
    hub.register(user, DeviceId::from("ios".to_string()), h2).await;
    let (h3, _rx3, _close3) = handle();
    hub.register(other, DeviceId::from("web".to_string()), h3).await;

    assert_eq!(hub.sessions_for_user(user).await, 2);
    assert_eq!(hub.sessions_for_user(other).await, 1);

    hub.unregister(user, &DeviceId::from("web".to_string())).await;
    assert_eq!(hub.sessions_for_user(user).await, 1);
    hub.unregister(user, &DeviceId::from("ios".to_string())).await;
    assert_eq!(hub.sessions_for_user(user).await, 0);
    // The other user's session on the same replica must be unaffected.
    assert_eq!(hub.sessions_for_user(other).await, 1);
}

#[tokio::test]
async fn broadcast_to_all_reaches_sessions_outside_any_chat() {
    let hub = Hub::new();

    let u1 = UserId::new();
    let (h1, mut rx1, _close1) = handle();
    hub.register(u1, DeviceId::from("web".to_string()), h1).await;

    let u2 = UserId::new();
    let (h2, mut rx2, _close2) = handle();
    hub.register(u2, DeviceId::from("ios".to_string()), h2).await;
    // u2 never subscribes to any chat — broadcast_to_all must still
    // reach it, unlike broadcast_to_chat.

    let delivered = hub.broadcast_to_all(frame()).await;
    assert_eq!(delivered, 2);
    assert!(rx1.try_recv().is_ok());
    assert!(rx2.try_recv().is_ok());
}

#[tokio::test]
async fn full_outbound_queue_reports_dropped() {
    let hub = Hub::new();
    let user = UserId::new();
    let device = DeviceId::from("web".to_string());
    let (tx, _rx) = mpsc::channel(1);
    let close = CancellationToken::new();
    let handle = SessionHandle::new(device.clone(), tx, close);
    hub.register(user, device.clone(), handle.clone()).await;

    assert_eq!(handle.try_send(frame()), SendOutcome::Queued);
    assert_eq!(handle.try_send(frame()), SendOutcome::Dropped);
}
