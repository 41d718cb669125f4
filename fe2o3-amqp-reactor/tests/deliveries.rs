use std::{sync::atomic::Ordering, thread, time::Duration};

use fe2o3_amqp_reactor::{Container, ListenerOptions, ReceiverOptions};
use futures_util::StreamExt;

mod common;

use common::{watchdog, Noop, Peer};

#[tokio::test(flavor = "multi_thread")]
async fn deliveries_stream_yields_messages_until_closed() {
    let container = Container::new().unwrap();
    let handle = container.handle();
    watchdog(handle.clone(), Duration::from_secs(20));

    let peer = Peer {
        to_send: 3,
        stop_on_close: true,
        ..Default::default()
    };
    let sent = peer.sent.clone();
    let listener = handle
        .listen_with("127.0.0.1:0", ListenerOptions::new(), peer)
        .unwrap();

    let url = format!("amqp://{}/queue", listener.local_addr());
    let mut deliveries = handle.open_receiver(&url, ReceiverOptions::new()).unwrap();

    // `run` blocks and may not be called from within the test's runtime
    let runner = thread::spawn(move || container.run(Noop));

    let mut bodies = Vec::new();
    for _ in 0..3 {
        let incoming = deliveries.next().await.unwrap();
        bodies.push(incoming.message.body_str().map(String::from));
        incoming.accept().unwrap();
    }
    deliveries.close().unwrap();

    assert!(deliveries.next().await.is_none());
    tokio::task::spawn_blocking(move || runner.join())
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(sent.load(Ordering::SeqCst), 3);
    assert_eq!(
        bodies,
        vec![
            Some(String::from("message-0")),
            Some(String::from("message-1")),
            Some(String::from("message-2")),
        ]
    );
}
