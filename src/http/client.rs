use crate::error::{Error, Result};
use reqwest::Client;
use std::time::Duration;

const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(2);

pub fn create_client(pool_size: u32, timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(timeout.min(CONNECT_TIMEOUT_CAP))
        .timeout(timeout)
        .tcp_nodelay(true)
        .gzip(true)
        .brotli(true)
        .user_agent(format!("pacer/{} (load-generator)", env!("CARGO_PKG_VERSION")))
        // Keep one warm connection per slot so steady state never reconnects
        .pool_max_idle_per_host(pool_size as usize)
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| Error::Client(e.to_string()))
}
