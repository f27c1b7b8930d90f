/// Ingest listener tests over real TCP: method filtering, body framing,
/// response-before-enqueue, sticky dispatch, and dead-lane reporting.
use relay::lane::Job;
use relay::listener::Listener;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

struct Harness {
    addr: SocketAddr,
    lanes: Vec<mpsc::Receiver<Job>>,
    supervisor: mpsc::Receiver<usize>,
    _stop: watch::Sender<bool>,
}

async fn start(lane_count: usize, lane_capacity: usize) -> Harness {
    let mut senders = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..lane_count {
        let (tx, rx) = mpsc::channel(lane_capacity);
        senders.push(tx);
        receivers.push(rx);
    }
    let (supervisor_tx, supervisor_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = watch::channel(false);

    let listener = Listener::start(
        "127.0.0.1:0",
        Arc::new(Mutex::new(senders)),
        supervisor_tx,
        stop_rx,
    )
    .await
    .expect("listener should bind");

    Harness {
        addr: listener.local_addr(),
        lanes: receivers,
        supervisor: supervisor_rx,
        _stop: stop_tx,
    }
}

async fn send_raw(addr: SocketAddr, raw: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw.as_bytes()).await.expect("write");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read");
    String::from_utf8_lossy(&buf).into_owned()
}

async fn post(addr: SocketAddr, path: &str, body: &str) -> String {
    let raw = format!(
        "POST {} HTTP/1.1\r\nHost: relay\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    send_raw(addr, &raw).await
}

const PAYLOAD: &str = r#"{"Events": []}"#;

#[tokio::test]
async fn post_is_accepted_with_fixed_html_body() {
    let mut h = start(1, 16).await;
    let response = post(h.addr, "/redfish", PAYLOAD).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("<html><body><p>OK</p></body></html>"));

    let job = tokio::time::timeout(Duration::from_secs(2), h.lanes[0].recv())
        .await
        .expect("job should arrive")
        .expect("channel open");
    let Job::Payload {
        path,
        client_ip,
        body,
    } = job
    else {
        panic!("expected payload job");
    };
    assert_eq!(path, "/redfish");
    assert_eq!(client_ip, "127.0.0.1");
    assert_eq!(body, PAYLOAD.as_bytes());
}

#[tokio::test]
async fn get_is_rejected_with_405() {
    let mut h = start(1, 16).await;
    let response = send_raw(h.addr, "GET /redfish HTTP/1.1\r\nHost: relay\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 405"));
    assert!(response.contains("Allow: POST"));

    // Nothing reaches a lane.
    let nothing = tokio::time::timeout(Duration::from_millis(200), h.lanes[0].recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn post_without_content_length_is_rejected() {
    let h = start(1, 16).await;
    let response = send_raw(h.addr, "POST /redfish HTTP/1.1\r\nHost: relay\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 411"));
}

#[tokio::test]
async fn unknown_paths_are_still_accepted_for_lane_side_drop() {
    // Path filtering is a lane decode concern; the listener only frames.
    let mut h = start(1, 16).await;
    let response = post(h.addr, "/other", PAYLOAD).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));

    let job = tokio::time::timeout(Duration::from_secs(2), h.lanes[0].recv())
        .await
        .expect("job should arrive")
        .expect("channel open");
    let Job::Payload { path, .. } = job else {
        panic!("expected payload job");
    };
    assert_eq!(path, "/other");
}

#[tokio::test]
async fn body_split_across_writes_is_reassembled() {
    let mut h = start(1, 16).await;
    let mut stream = tokio::net::TcpStream::connect(h.addr).await.unwrap();
    let head = format!(
        "POST /redfish HTTP/1.1\r\nHost: relay\r\nContent-Length: {}\r\n\r\n",
        PAYLOAD.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&PAYLOAD.as_bytes()[..5]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    stream.write_all(&PAYLOAD.as_bytes()[5..]).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 200 OK"));

    let job = tokio::time::timeout(Duration::from_secs(2), h.lanes[0].recv())
        .await
        .expect("job should arrive")
        .expect("channel open");
    let Job::Payload { body, .. } = job else {
        panic!("expected payload job");
    };
    assert_eq!(body, PAYLOAD.as_bytes());
}

#[tokio::test]
async fn dispatch_is_sticky_per_client() {
    let mut h = start(4, 16).await;
    // All connections here come from 127.0.0.1, so every payload must
    // land on the lane assigned on first contact.
    for _ in 0..3 {
        let response = post(h.addr, "/redfish", PAYLOAD).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }

    for _ in 0..3 {
        let job = tokio::time::timeout(Duration::from_secs(2), h.lanes[0].recv())
            .await
            .expect("sticky lane should receive every payload")
            .expect("channel open");
        assert!(matches!(job, Job::Payload { .. }));
    }
    for lane in &mut h.lanes[1..] {
        let nothing = tokio::time::timeout(Duration::from_millis(100), lane.recv()).await;
        assert!(nothing.is_err(), "other lanes must stay idle");
    }
}

#[tokio::test]
async fn response_time_is_independent_of_lane_queue_depth() {
    // Lane capacity 1 and nothing consuming: the queue is full after the
    // first payload, yet every pusher still gets its 200 promptly.
    let h = start(1, 1).await;
    for _ in 0..3 {
        let response = tokio::time::timeout(
            Duration::from_secs(2),
            post(h.addr, "/redfish", PAYLOAD),
        )
        .await
        .expect("response must not wait on lane progress");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }
}

#[tokio::test]
async fn dead_lane_is_reported_to_the_supervisor() {
    let mut h = start(2, 16).await;
    // Kill lane 0's consumer; 127.0.0.1 is assigned there first.
    h.lanes[0].close();
    while h.lanes[0].try_recv().is_ok() {}

    let response = post(h.addr, "/redfish", PAYLOAD).await;
    assert!(response.starts_with("HTTP/1.1 200 OK"));

    let dead = tokio::time::timeout(Duration::from_secs(2), h.supervisor.recv())
        .await
        .expect("supervisor should hear about the dead lane")
        .expect("channel open");
    assert_eq!(dead, 0);
}
