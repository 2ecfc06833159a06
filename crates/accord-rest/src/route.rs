use reqwest::Method;

/// An HTTP verb plus templated endpoint identifying a family of API calls.
///
/// Two concrete paths that only differ in numeric segments share the same
/// route key; the optional major parameter (e.g. a channel or guild id)
/// further partitions the rate limit within one route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    path: String,
    route_key: String,
    major_param: Option<String>,
}

impl Route {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        let path = path.into();
        let route_key = normalize(&path);
        Route {
            method,
            path,
            route_key,
            major_param: None,
        }
    }

    /// Marks the given id as the route's major parameter. Requests with
    /// different major parameters are rate limited independently even
    /// though they share a route key.
    pub fn major_param(mut self, id: impl ToString) -> Self {
        self.major_param = Some(id.to_string());
        self
    }

    pub fn get(path: impl Into<String>) -> Self {
        Route::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Route::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Route::new(Method::PATCH, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Route::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Route::new(Method::DELETE, path)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn route_key(&self) -> &str {
        &self.route_key
    }

    /// The serialization unit used to group requests subject to one
    /// server-imposed quota. A route without a major parameter shares a
    /// single key for the whole route family.
    pub fn rate_limit_key(&self) -> String {
        match &self.major_param {
            Some(major) => format!("{} {}#{}", self.method, self.route_key, major),
            None => format!("{} {}", self.method, self.route_key),
        }
    }
}

/// Replaces every all-digit path segment with `:id`, so that
/// `/channels/123/messages` and `/channels/456/messages` compare equal.
fn normalize(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
