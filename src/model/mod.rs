pub mod image;
pub mod object;
pub mod service;

/// Uniform operation result: the normalized value plus, when a provider
/// has something to add, the raw native payload it was derived from.
#[derive(Clone, Debug, PartialEq)]
pub struct Response<T> {
    pub result: T,
    pub native: Option<serde_json::Value>,
}

impl<T> Response<T> {
    pub fn new(result: T) -> Self {
        Self { result, native: None }
    }

    pub fn with_native(result: T, native: serde_json::Value) -> Self {
        Self {
            result,
            native: Some(native),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            result: f(self.result),
            native: self.native,
        }
    }
}
