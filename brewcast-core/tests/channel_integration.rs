//! Two sessions on separate devices, wired through the signaled
//! point-to-point data channel: token exchange, discovery, and order
//! replication over real sockets.

use std::sync::Arc;
use std::time::Duration;

use brewcast_core::config::Config;
use brewcast_core::core_signal;
use brewcast_core::core_store::{MemoryStore, StoreHandle, UserProfile};
use brewcast_core::core_transport::DataChannelTransport;
use brewcast_core::core_wire::Role;
use brewcast_core::{Session, SessionEvent};

fn fast_config() -> Config {
    let mut config = Config::default();
    config.presence.heartbeat_interval = Duration::from_millis(50);
    config.presence.peer_timeout = Duration::from_millis(200);
    config.transport.reconnect_backoff = Duration::from_millis(50);
    config
}

fn profile(name: &str, role: Role) -> UserProfile {
    UserProfile {
        display_name: name.to_string(),
        role,
    }
}

fn store() -> StoreHandle {
    StoreHandle::new(Arc::new(MemoryStore::new()))
}

#[tokio::test]
async fn test_order_replicates_across_signaled_channel() {
    let config = fast_config();

    // The cashier's register offers; the token would normally travel by
    // QR code or copy-paste.
    let cashier_store = store();
    let cashier_id = cashier_store.device_id().await.unwrap();
    let (offer_transport, offer) = DataChannelTransport::offer(cashier_id, &config)
        .await
        .unwrap();
    let offer_token = core_signal::encode(&offer);

    // The barista's tablet decodes, dials, and answers.
    let barista_store = store();
    let barista_id = barista_store.device_id().await.unwrap();
    let decoded = core_signal::decode(&offer_token, &config.mesh.shared_secret).unwrap();
    let (answer_transport, answer) = DataChannelTransport::accept(&decoded, barista_id, &config)
        .await
        .unwrap();
    let answer_token = core_signal::encode(&answer);

    let decoded_answer =
        core_signal::decode(&answer_token, &config.mesh.shared_secret).unwrap();
    offer_transport.apply_answer(&decoded_answer).unwrap();

    let (cashier, _cashier_events) = Session::connect_with_transport(
        config.clone(),
        cashier_store,
        Arc::new(offer_transport),
        Some(profile("Cashier-1", Role::Cashier)),
    )
    .await
    .unwrap();
    let (barista, mut barista_events) = Session::connect_with_transport(
        config,
        barista_store,
        Arc::new(answer_transport),
        Some(profile("Barista-1", Role::Barista)),
    )
    .await
    .unwrap();

    // Mutual discovery over the socket.
    for _ in 0..200 {
        if !cashier.peers().await.unwrap().is_empty()
            && !barista.peers().await.unwrap().is_empty()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cashier.peers().await.unwrap()[0].display_name, "Barista-1");

    let order = cashier.publish_order("cortado", vec![]).await.unwrap();

    let received = loop {
        match tokio::time::timeout(Duration::from_secs(2), barista_events.recv())
            .await
            .expect("order never crossed the channel")
            .expect("events closed")
        {
            SessionEvent::OrderReceived(o) => break o,
            _ => continue,
        }
    };
    assert_eq!(received.id, order.id);
    assert_eq!(received.created_by, "Cashier-1");

    // Completion flows back the other way.
    barista.complete_order(order.id).await.unwrap().unwrap();
    for _ in 0..200 {
        let orders = cashier.orders().await.unwrap();
        if orders.iter().any(|o| o.id == order.id && o.is_completed()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("completion never replicated back");
}

#[tokio::test]
async fn test_disconnect_tells_the_peer_goodbye() {
    let config = fast_config();

    let cashier_store = store();
    let cashier_id = cashier_store.device_id().await.unwrap();
    let (offer_transport, offer) = DataChannelTransport::offer(cashier_id, &config)
        .await
        .unwrap();

    let barista_store = store();
    let barista_id = barista_store.device_id().await.unwrap();
    let (answer_transport, answer) = DataChannelTransport::accept(&offer, barista_id, &config)
        .await
        .unwrap();
    offer_transport.apply_answer(&answer).unwrap();

    let (cashier, _ev) = Session::connect_with_transport(
        config.clone(),
        cashier_store,
        Arc::new(offer_transport),
        Some(profile("Cashier-1", Role::Cashier)),
    )
    .await
    .unwrap();
    let (barista, _ev) = Session::connect_with_transport(
        config,
        barista_store,
        Arc::new(answer_transport),
        Some(profile("Barista-1", Role::Barista)),
    )
    .await
    .unwrap();

    for _ in 0..200 {
        if !cashier.peers().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(cashier.peers().await.unwrap().len(), 1);

    barista.disconnect().await.unwrap();

    // Goodbye lands before the socket dies, well inside the liveness
    // window.
    for _ in 0..100 {
        if cashier.peers().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("goodbye never removed the peer");
}
