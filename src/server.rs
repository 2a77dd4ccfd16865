use httparse::Request;
use std::{
    io::{self, Read, Write},
    net::{TcpListener, TcpStream},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

use crate::{
    access,
    config::{ServeConfig, Tuning},
    http::{is_keep_alive, send_error, send_response, serve_path},
    thread_pool::ThreadPool,
};

struct ServerState {
    root_dir: PathBuf,
    tuning: Tuning,
    active_connections: AtomicUsize,
}

/// A bound listener plus the immutable serving state. Binding and
/// running are split so the caller can report the actual port (port 0
/// is resolved by the OS at bind time) before entering the loop.
pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn bind(config: ServeConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", config.port))?;
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                root_dir: config.root_dir,
                tuning: config.tuning,
                active_connections: AtomicUsize::new(0),
            }),
        })
    }

    /// The actually bound port; differs from the configured one when
    /// the OS picked an ephemeral port.
    pub fn port(&self) -> io::Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    pub fn url(&self) -> io::Result<String> {
        Ok(format!("http://localhost:{}", self.port()?))
    }

    /// Accepts connections until the listener fails; does not return
    /// under normal operation. Transient accept errors are skipped,
    /// anything else is fatal and bubbles up to the caller.
    pub fn run(self) -> io::Result<()> {
        let pool = ThreadPool::new(self.state.tuning.workers, self.state.tuning.queue_size);

        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    debug!("Transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let _ = stream.set_nodelay(true);
            let state = Arc::clone(&self.state);

            match stream.try_clone() {
                Ok(stream_clone) => {
                    if pool
                        .try_execute(move || handle_connection(stream_clone, state))
                        .is_err()
                    {
                        warn!("Queue full, shedding load with 503.");
                        let _ = stream.set_write_timeout(Some(Duration::from_millis(500)));
                        let _ = stream.write_all(b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
                        access::record(Some(peer), "-", "-", 503, 0);
                    }
                }
                Err(e) => {
                    error!("Failed to clone stream: {}", e);
                }
            }
        }
    }
}

struct ConnectionGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> Drop for ConnectionGuard<'a> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

const IDLE_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Rejects a connection before a request line could be attributed;
/// the access log gets `-` placeholders for method and path.
fn reject(
    stream: &mut TcpStream,
    peer: Option<std::net::SocketAddr>,
    status: u16,
    message: &'static [u8],
) {
    if let Ok((_, status, bytes)) = send_error(stream, status, message, false, false) {
        access::record(peer, "-", "-", status, bytes);
    }
}

fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    state.active_connections.fetch_add(1, Ordering::SeqCst);
    let _guard = ConnectionGuard {
        counter: &state.active_connections,
    };

    let peer = stream.peer_addr().ok();
    let initial_timeout = Duration::from_secs(state.tuning.read_timeout_secs);
    let _ = stream.set_write_timeout(Some(Duration::from_secs(state.tuning.write_timeout_secs)));

    let mut buffer = vec![0; state.tuning.connection_buffer_size];
    let mut read_offset = 0;
    let mut is_first_request = true;

    loop {
        // subsequent requests on a kept-alive connection get the
        // shorter idle timeout
        let deadline = Instant::now()
            + if is_first_request {
                initial_timeout
            } else {
                IDLE_KEEPALIVE_TIMEOUT
            };

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = Request::new(&mut headers);

        match req.parse(&buffer[..read_offset]) {
            Ok(httparse::Status::Complete(header_len)) => {
                let mut keep_alive = is_keep_alive(&req);

                if keep_alive
                    && state.active_connections.load(Ordering::Relaxed) >= state.tuning.workers
                {
                    keep_alive = false;
                }

                let has_body = req.headers.iter().any(|h| {
                    if h.name.eq_ignore_ascii_case("content-length") {
                        let val = std::str::from_utf8(h.value).unwrap_or("").trim();
                        val != "0" && !val.is_empty()
                    } else {
                        h.name.eq_ignore_ascii_case("transfer-encoding")
                    }
                });

                let method = req.method.unwrap_or("GET");
                let path = req.path.unwrap_or("/");

                let (keep_alive_result, status, bytes) =
                    if (method != "GET" && method != "HEAD") || has_body {
                        send_response(
                            &mut stream,
                            405,
                            b"Method Not Allowed",
                            "text/plain",
                            false,
                            false,
                            Some("Allow: GET, HEAD\r\n"),
                        )
                        .unwrap_or((false, 500, 0))
                    } else {
                        serve_path(
                            &mut stream,
                            path,
                            req.headers,
                            &state.root_dir,
                            keep_alive,
                            method == "HEAD",
                        )
                        .unwrap_or((false, 500, 0))
                    };

                access::record(peer, method, path, status, bytes);

                buffer.copy_within(header_len..read_offset, 0);
                read_offset -= header_len;
                is_first_request = false;

                if !keep_alive_result {
                    break;
                }
                continue;
            }
            Ok(httparse::Status::Partial) => {
                if read_offset == buffer.len() {
                    reject(&mut stream, peer, 431, b"Request Header Fields Too Large");
                    break;
                }
            }
            Err(_) => {
                reject(&mut stream, peer, 400, b"Bad Request");
                break;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            if is_first_request {
                reject(&mut stream, peer, 408, b"Request Timeout");
            }
            break;
        }

        let _ = stream.set_read_timeout(Some(deadline.duration_since(now)));

        match stream.read(&mut buffer[read_offset..]) {
            Ok(0) => break, // EOF
            Ok(n) => read_offset += n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
            {
                if is_first_request {
                    reject(&mut stream, peer, 408, b"Request Timeout");
                }
                break;
            }
            Err(e) => {
                debug!("Connection read error: {}", e);
                break;
            }
        }
    }
}
