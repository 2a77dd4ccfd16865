use std::net::SocketAddr;

use tracing::info;

/// Records one request/response exchange. The subscriber supplies the
/// timestamp; line layout is whatever the installed formatter emits.
pub fn record(remote: Option<SocketAddr>, method: &str, path: &str, status: u16, bytes: u64) {
    let remote = remote.map_or("-".to_string(), |addr| addr.to_string());
    info!(target: "access", "{} \"{} {}\" {} {}", remote, method, path, status, bytes);
}
