//! Ingest HTTP listener.
//!
//! A hand-rolled HTTP/1.1 receiver over raw TCP: pushers send one POST
//! per connection and are answered `200 OK` with a fixed HTML body the
//! moment the payload is read, before any processing, so endpoint push
//! queues never back up behind the bus.
//!
//! Dispatch is sticky: the first payload from a client IP assigns it the
//! next lane round-robin, and every later payload from that IP goes to
//! the same lane.  The assignment map is owned by the single dispatcher
//! task; per-connection tasks only parse and hand over.

use crate::lane::Job;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const OK_BODY: &str = "<html><body><p>OK</p></body></html>";
/// Request head larger than this is rejected outright.
const MAX_HEAD: usize = 8192;
/// Bodies larger than this are rejected; envelopes are small.
const MAX_BODY: usize = 4 * 1024 * 1024;

/// Shared, supervisor-replaceable lane senders.
pub type LaneSenders = Arc<Mutex<Vec<mpsc::Sender<Job>>>>;

/// Handle to the running ingest listener.
pub struct Listener {
    local_addr: SocketAddr,
}

impl Listener {
    /// Return the bound listen address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bind and start the accept and dispatch tasks.
    pub async fn start(
        bind: &str,
        lanes: LaneSenders,
        supervisor: mpsc::Sender<usize>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "ingest listener bound");

        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Incoming>(1024);

        tokio::spawn(run_dispatcher(dispatch_rx, lanes, supervisor));
        tokio::spawn(run_accept_loop(listener, dispatch_tx, stop));

        Ok(Listener { local_addr })
    }
}

/// A parsed request on its way to a lane.
struct Incoming {
    path: String,
    client_ip: String,
    body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

async fn run_accept_loop(
    listener: TcpListener,
    dispatch_tx: mpsc::Sender<Incoming>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("ingest listener stopping");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let dispatch_tx = dispatch_tx.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, dispatch_tx).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    dispatch_tx: mpsc::Sender<Incoming>,
) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(reject) => {
            send_response(&mut stream, reject.status, reject.reason, "").await;
            return;
        }
    };

    // Respond before the payload enters a lane: pusher latency must be
    // bounded by body-read time, not by queue depth.
    send_response(&mut stream, 200, "OK", OK_BODY).await;

    let incoming = Incoming {
        path: request.path,
        client_ip: peer.ip().to_string(),
        body: request.body,
    };
    if dispatch_tx.send(incoming).await.is_err() {
        // Dispatcher gone; shutdown is in progress.
        debug!(client = %peer.ip(), "dispatch channel closed, payload dropped");
    }
}

struct Request {
    path: String,
    body: Vec<u8>,
}

struct Reject {
    status: u16,
    reason: &'static str,
}

async fn read_request(stream: &mut TcpStream) -> Result<Request, Reject> {
    // Read until the end of the header block.
    let mut buf = Vec::with_capacity(1024);
    let head_end = loop {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.map_err(|_| Reject {
            status: 400,
            reason: "Bad Request",
        })?;
        if n == 0 {
            return Err(Reject {
                status: 400,
                reason: "Bad Request",
            });
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEAD {
            return Err(Reject {
                status: 431,
                reason: "Request Header Fields Too Large",
            });
        }
    };

    let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| Reject {
        status: 400,
        reason: "Bad Request",
    })?;
    let (method, path, content_length) = parse_head(head).ok_or(Reject {
        status: 400,
        reason: "Bad Request",
    })?;

    if method != "POST" {
        return Err(Reject {
            status: 405,
            reason: "Method Not Allowed",
        });
    }
    let content_length = content_length.ok_or(Reject {
        status: 411,
        reason: "Length Required",
    })?;
    if content_length > MAX_BODY {
        return Err(Reject {
            status: 413,
            reason: "Payload Too Large",
        });
    }

    // Body: what followed the head in the buffer, plus the rest.
    let mut body = buf[head_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0u8; content_length - body.len()];
        let n = stream.read(&mut chunk).await.map_err(|_| Reject {
            status: 400,
            reason: "Bad Request",
        })?;
        if n == 0 {
            return Err(Reject {
                status: 400,
                reason: "Bad Request",
            });
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(Request {
        path: path.to_owned(),
        body,
    })
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the request line and Content-Length out of a header block.
fn parse_head(head: &str) -> Option<(&str, &str, Option<usize>)> {
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;

    let mut content_length = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse::<usize>().ok();
            }
        }
    }
    Some((method, path, content_length))
}

async fn send_response(stream: &mut TcpStream, status: u16, reason: &str, body: &str) {
    let extra = if status == 405 { "Allow: POST\r\n" } else { "" };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {len}\r\n\
         {extra}Connection: close\r\n\
         \r\n\
         {body}",
        status = status,
        reason = reason,
        len = body.len(),
        extra = extra,
        body = body,
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

// ---------------------------------------------------------------------------
// Sticky dispatcher
// ---------------------------------------------------------------------------

async fn run_dispatcher(
    mut dispatch_rx: mpsc::Receiver<Incoming>,
    lanes: LaneSenders,
    supervisor: mpsc::Sender<usize>,
) {
    let lane_count = lanes.lock().map(|l| l.len()).unwrap_or(0);
    if lane_count == 0 {
        return;
    }
    let mut assignment: HashMap<String, usize> = HashMap::new();
    let mut next_lane: usize = 0;

    while let Some(incoming) = dispatch_rx.recv().await {
        let lane_index = *assignment
            .entry(incoming.client_ip.clone())
            .or_insert_with(|| {
                let index = next_lane % lane_count;
                next_lane += 1;
                debug!(client = %incoming.client_ip, lane = index, "client assigned to lane");
                index
            });

        // Clone the sender out of the lock before awaiting.
        let sender = match lanes.lock() {
            Ok(guard) => guard[lane_index].clone(),
            Err(_) => return,
        };

        let job = Job::Payload {
            path: incoming.path,
            client_ip: incoming.client_ip,
            body: incoming.body,
        };
        if sender.send(job).await.is_err() {
            // The lane's receiver is gone: report it and drop the payload.
            warn!(lane = lane_index, "lane is dead, reporting to supervisor");
            if supervisor.send(lane_index).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_parses_method_path_and_length() {
        let head = "POST /redfish HTTP/1.1\r\nHost: x\r\nContent-Length: 12";
        let (method, path, len) = parse_head(head).unwrap();
        assert_eq!(method, "POST");
        assert_eq!(path, "/redfish");
        assert_eq!(len, Some(12));
    }

    #[test]
    fn content_length_header_is_case_insensitive() {
        let head = "POST / HTTP/1.1\r\ncontent-length: 3";
        let (_, _, len) = parse_head(head).unwrap();
        assert_eq!(len, Some(3));
    }

    #[test]
    fn missing_length_yields_none() {
        let head = "POST /redfish HTTP/1.1\r\nHost: x";
        let (_, _, len) = parse_head(head).unwrap();
        assert_eq!(len, None);
    }

    #[test]
    fn head_end_is_found_across_chunks() {
        assert_eq!(find_head_end(b"POST / HTTP/1.1\r\n\r\nbody"), Some(15));
        assert_eq!(find_head_end(b"partial"), None);
    }
}
