//! DNS over HTTPS (RFC 8484)

use async_trait::async_trait;
use hickory_proto::op::Message;

use crate::client::DnsClient;
use crate::error::{Error, Result};
use crate::DEFAULT_DNS_TIMEOUT;

/// The DoH media type for both request body and accepted response.
const DNS_MIME_TYPE: &str = "application/dns-message";

/// DNS-over-HTTPS upstream client
pub struct DohClient {
    url: String,
    http_client: reqwest::Client,
}

impl DohClient {
    pub fn new(url: &str) -> Result<Self> {
        // Note: reqwest doesn't support dialing through a custom connector,
        // so DoH requests use the system's default routing. ALPN negotiates
        // HTTP/2 where the server offers it.
        let http_client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(DEFAULT_DNS_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            url: url.to_string(),
            http_client,
        })
    }
}

#[async_trait]
impl DnsClient for DohClient {
    fn servers(&self) -> Vec<String> {
        vec![self.url.clone()]
    }

    async fn exchange(&self, msg: &Message) -> Result<Message> {
        // RFC 8484 section 4.1: use DNS ID 0 in every request to maximize
        // HTTP cache friendliness.
        let mut query = msg.clone();
        query.set_id(0);
        let body = query
            .to_vec()
            .map_err(|e| Error::Dns(format!("packing DNS query: {}", e)))?;

        let response = self
            .http_client
            .post(&self.url)
            .header("Content-Type", DNS_MIME_TYPE)
            .header("Accept", DNS_MIME_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Dns(format!("DoH request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Dns(format!(
                "DoH server returned error: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::Dns(format!("failed to read DoH response: {}", e)))?;

        let mut reply = Message::from_vec(&bytes)
            .map_err(|e| Error::Dns(format!("parsing DoH response: {}", e)))?;
        reply.set_id(msg.id());
        Ok(reply)
    }
}
