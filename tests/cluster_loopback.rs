//! Loopback cluster test: one root `UnixListener` plus two `UnixStream`
//! peers connected in-process (standing in for two forked workers),
//! driven directly at the frame level so the root's fan-out and
//! subscription-announcement handling run unmodified.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use postoffice::cluster::{socket_path, Frame, FrameType, Parser};
use postoffice::config::ClusterConfig;
use postoffice::{PublishArgs, SubscribeArgs};

fn unique_socket_dir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "postoffice-cluster-loopback-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn read_one_frame(stream: &mut UnixStream) -> Frame {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut parser = Parser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = stream.read(&mut buf).expect("read frame");
        assert!(n > 0, "peer closed before sending a frame");
        let frames = parser.feed(&buf[..n]).expect("decode frame");
        if let Some(frame) = frames.into_iter().next() {
            return frame;
        }
    }
}

/// Scenario: root fans a `Forward` publish from one peer out to every other
/// peer, and also dispatches it to this process's own local subscribers.
/// Exercises `PUBSUB_SUB` replay-style announcement on connect too.
#[test]
fn test_loopback_fanout_and_local_dispatch() {
    let config = ClusterConfig::new()
        .socket_dir(unique_socket_dir())
        .heartbeat_interval(Duration::from_secs(30));

    let po = postoffice::init(config.clone());
    po.start_root().expect("bind root socket");
    po.spawn_root_accept_loop();

    let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let delivered2 = delivered.clone();
    // Frames arriving off the wire carry raw bytes, so the channel a
    // cluster-forwarded message is dispatched under is `Value::Bytes`; match
    // that here rather than `Value::str`, which compares unequal to it.
    let sub = po
        .subscribe(SubscribeArgs {
            filter: 0,
            channel: Some(postoffice::Value::bytes(b"news".to_vec())),
            match_fn: None,
            on_message: Box::new(move |msg| {
                let text = String::from_utf8_lossy(msg.payload().as_bytes()).into_owned();
                delivered2.lock().unwrap().push(text);
            }),
            on_unsubscribe: None,
            udata1: 0,
            udata2: 0,
        })
        .expect("subscribe");

    let path = socket_path(&config, std::process::id());
    let mut peer_a = UnixStream::connect(&path).expect("connect peer a");
    let mut peer_b = UnixStream::connect(&path).expect("connect peer b");

    // peer_a announces an exact-match subscription, as a worker replaying
    // its pre-existing subscriptions right after connecting would.
    let announce = Frame::new(FrameType::PubsubSub, 0, b"news".to_vec(), Vec::new());
    peer_a.write_all(&announce.encode().unwrap()).unwrap();

    // peer_a publishes; the root must broadcast it to peer_b and dispatch
    // it to this process's own "news" subscriber.
    let publish = Frame::new(FrameType::Forward, 0, b"news".to_vec(), b"hello".to_vec());
    peer_a.write_all(&publish.encode().unwrap()).unwrap();

    let forwarded = read_one_frame(&mut peer_b);
    assert_eq!(forwarded.frame_type, FrameType::Forward);
    assert_eq!(forwarded.channel, b"news");
    assert_eq!(forwarded.payload, b"hello");

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if delivered.lock().unwrap().len() == 1 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "local delivery timed out");
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(delivered.lock().unwrap()[0], "hello");

    po.unsubscribe(sub);
    po.publish(PublishArgs {
        channel: postoffice::Value::str("news"),
        message: postoffice::Value::str("after-unsubscribe"),
        ..Default::default()
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(delivered.lock().unwrap().len(), 1);
}
