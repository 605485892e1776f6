use crate::error::Result;
use crate::http::create_client;
use crate::requester::Requester;
use crate::types::{Endpoint, ErrorKind, RequestOutcome};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::time::Instant;

/// [`Requester`] backed by a pooled `reqwest` client.
#[derive(Clone)]
pub struct HttpRequester {
    client: Client,
}

impl HttpRequester {
    pub fn new(pool_size: u32, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: create_client(pool_size, timeout)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Requester for HttpRequester {
    async fn send(&self, endpoint: &Endpoint) -> RequestOutcome {
        let request = self.client.request(endpoint.method.clone(), &*endpoint.url);

        let start = Instant::now();
        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();

                // Latency includes the full body; reading it also frees the
                // connection for reuse
                let body = response.bytes().await;
                let latency = start.elapsed();

                match body {
                    Ok(_) if status < 400 => RequestOutcome::success(endpoint.clone(), start, latency, Some(status)),
                    Ok(_) => RequestOutcome::failure(endpoint.clone(), start, latency, ErrorKind::Status)
                        .with_status_code(status),
                    Err(err) => {
                        RequestOutcome::failure(endpoint.clone(), start, latency, ErrorKind::from_reqwest_error(&err))
                            .with_status_code(status)
                    }
                }
            }
            Err(err) => {
                let latency = start.elapsed();
                let kind = ErrorKind::from_reqwest_error(&err);
                tracing::trace!("Request to {} failed: {}", endpoint, err);
                RequestOutcome::failure(endpoint.clone(), start, latency, kind)
            }
        }
    }
}
