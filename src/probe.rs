use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Single bounded connect probe against a local listener.
pub async fn connect_probe(addr: SocketAddr, per_probe: Duration) -> bool {
    matches!(timeout(per_probe, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Repeatedly probe until the listener answers or the deadline passes.
pub async fn wait_for_listen(addr: SocketAddr, per_probe: Duration, deadline: Duration) -> bool {
    let give_up = Instant::now() + deadline;
    loop {
        if connect_probe(addr, per_probe).await {
            return true;
        }
        if Instant::now() >= give_up {
            return false;
        }
        sleep(Duration::from_millis(250)).await;
    }
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}
