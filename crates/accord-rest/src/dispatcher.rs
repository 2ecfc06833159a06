use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::bucket::RateLimitBucket;
use crate::error::ApiError;
use crate::route::Route;
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport};

#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Versioned base URL, e.g. `https://example.com/api/v10`.
    pub base_url: String,
    pub token: String,
}

type SharedBucket = Arc<Mutex<RateLimitBucket>>;

#[derive(Default)]
struct BucketIndex {
    by_key: HashMap<String, SharedBucket>,
    /// Canonical record per server-assigned bucket id. Once two keys are
    /// known to share an id they stay aliased for the life of the
    /// dispatcher.
    by_bucket_id: HashMap<String, SharedBucket>,
}

/// Serializes outgoing HTTP calls per rate-limit bucket.
///
/// One `Dispatcher` is constructed per client instance and shared (by
/// `Arc`) between all call sites; it owns the whole bucket registry, so
/// there is no global mutable state. Unrelated buckets never contend:
/// the registry lock is only held while resolving a key, and each bucket
/// has its own guard.
pub struct Dispatcher {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    index: StdMutex<BucketIndex>,
}

impl Dispatcher {
    pub fn new(config: RestConfig) -> Result<Self, ApiError> {
        let transport = ReqwestTransport::new(&config.token)?;
        Ok(Dispatcher::with_transport(
            Arc::new(transport),
            config.base_url,
        ))
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, base_url: impl Into<String>) -> Self {
        Dispatcher {
            transport,
            base_url: base_url.into(),
            index: StdMutex::new(BucketIndex::default()),
        }
    }

    /// Performs one API call, honoring the route's rate limit.
    ///
    /// The calling task holds the bucket's guard for the whole call,
    /// including any cooldown sleep: at most one request per bucket is in
    /// flight, which is exactly the serialization the server demands.
    /// The bucket is updated from response headers before the guard is
    /// released, regardless of the response status.
    ///
    /// A `429` is not an error here: the slot was already spent by an
    /// earlier call, so the response body is returned as-is and the
    /// refreshed bucket state gates the *next* request. Flagged as
    /// intentional; see the error taxonomy notes on [`ApiError`].
    pub async fn request(
        &self,
        route: &Route,
        body: Option<Value>,
        headers: &[(String, String)],
    ) -> Result<Value, ApiError> {
        let key = route.rate_limit_key();
        let bucket = self.bucket_for(&key);
        let mut guard = bucket.lock().await;

        // Re-check after every sleep: the server clock may lead ours, and
        // another response may have refreshed the bucket meanwhile.
        while let Some(wait) = guard.cooldown(SystemTime::now()) {
            log::debug!("bucket {} exhausted, waiting {:?}", key, wait);
            sleep(wait).await;
        }

        let request = ApiRequest {
            method: route.method().clone(),
            url: format!("{}{}", self.base_url, route.path()),
            body,
            headers: headers.to_vec(),
        };
        let response = self.transport.perform(request).await?;

        guard.update(&response.headers);
        if let Some(bucket_id) = guard.bucket_id().map(str::to_string) {
            self.register_alias(&key, &bucket_id, &bucket);
        }
        drop(guard);

        finish(&key, response)
    }

    fn bucket_for(&self, key: &str) -> SharedBucket {
        let mut index = self.index.lock().unwrap();
        index
            .by_key
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(RateLimitBucket::default())))
            .clone()
    }

    /// Records that `key` belongs to the server-side bucket `bucket_id`.
    ///
    /// The first record observed for an id becomes canonical; every key
    /// that later reports the same id is re-pointed to it, so all
    /// subsequent requests on aliased keys share one bucket. The record
    /// currently held by the caller keeps this response's header update
    /// either way (no second bucket lock is taken while one is held).
    fn register_alias(&self, key: &str, bucket_id: &str, current: &SharedBucket) {
        let mut index = self.index.lock().unwrap();
        let canonical = index
            .by_bucket_id
            .entry(bucket_id.to_string())
            .or_insert_with(|| current.clone())
            .clone();
        if !Arc::ptr_eq(&canonical, current) {
            log::debug!("redirecting {} to shared bucket {}", key, bucket_id);
        }
        index.by_key.insert(key.to_string(), canonical);
    }
}

fn finish(key: &str, response: ApiResponse) -> Result<Value, ApiError> {
    let body: Value = if response.body.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&response.body).unwrap_or(Value::String(response.body))
    };

    match response.status {
        429 => {
            log::warn!(
                "rate limit exceeded on {}, relying on the refreshed bucket for the next call",
                key
            );
            Ok(body)
        }
        200..=399 => Ok(body),
        401 => Err(ApiError::Unauthorized),
        403 => Err(ApiError::Forbidden),
        404 => Err(ApiError::NotFound),
        405 => Err(ApiError::MethodNotAllowed),
        status @ 400..=499 => Err(ApiError::Client {
            status,
            code: body.get("code").and_then(Value::as_u64),
            body,
        }),
        status => Err(ApiError::Server { status, body }),
    }
}
