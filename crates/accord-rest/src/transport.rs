use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use reqwest::Method;
use serde_json::Value;

use crate::error::TransportError;

const USER_AGENT: &str = concat!("accord (rest, ", env!("CARGO_PKG_VERSION"), ")");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Response headers with lowercased names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// The seam between the dispatcher and the actual network. Production
/// code uses [`ReqwestTransport`]; tests substitute an in-memory fake.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    authorization: String,
}

impl ReqwestTransport {
    pub fn new(token: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(ReqwestTransport {
            client,
            authorization: format!("Bot {}", token),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn perform(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .header(header::AUTHORIZATION, &self.authorization);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
