//! Outbound request description offered to token providers.

// crates.io
use http::{HeaderMap, HeaderName, HeaderValue, Method};
// self
use crate::_prelude::*;

/// Authorization parameter key carrying the tenant identifier.
pub const TENANT_ID_PARAMETER: &str = "tenantid";

/// An outbound HTTP call as seen by token providers.
///
/// The value is owned by the caller for the lifetime of provider dispatch and
/// is only read here; attaching the resolved authorization header to the real
/// wire message is the caller's business.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
	method: Method,
	url: Url,
	headers: HeaderMap,
}
impl OutboundRequest {
	/// Creates a new outbound request description.
	pub fn new(method: Method, url: Url) -> Self {
		Self { method, url, headers: HeaderMap::new() }
	}

	/// Adds a header to the description.
	pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
		self.headers.insert(name, value);

		self
	}

	/// Returns the request method.
	pub fn method(&self) -> &Method {
		&self.method
	}

	/// Returns the target URL.
	pub fn url(&self) -> &Url {
		&self.url
	}

	/// Returns the target host, when the URL carries one.
	pub fn host(&self) -> Option<&str> {
		self.url.host_str()
	}

	/// Returns the request headers.
	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}
}

/// Authorization parameters attached to the service-endpoint configuration a
/// provider was constructed for.
#[derive(Clone, Debug, Default)]
pub struct AuthorizationParameters(BTreeMap<String, String>);
impl AuthorizationParameters {
	/// Creates an empty parameter bag.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds or replaces a parameter.
	pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.0.insert(key.into(), value.into());

		self
	}

	/// Looks up a parameter by key.
	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	/// Returns the tenant identifier, treating an empty value as absent.
	pub fn tenant_id(&self) -> Option<&str> {
		self.get(TENANT_ID_PARAMETER).filter(|value| !value.is_empty())
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn tenant_id_treats_empty_value_as_absent() {
		let empty = AuthorizationParameters::new().with(TENANT_ID_PARAMETER, "");

		assert_eq!(empty.tenant_id(), None);

		let populated = AuthorizationParameters::new().with(TENANT_ID_PARAMETER, "tenant-a");

		assert_eq!(populated.tenant_id(), Some("tenant-a"));
		assert_eq!(AuthorizationParameters::new().tenant_id(), None);
	}

	#[test]
	fn outbound_request_exposes_host() {
		let request = OutboundRequest::new(
			Method::GET,
			Url::parse("https://contoso.azurecr.io/v2/").expect("Fixture URL should parse."),
		);

		assert_eq!(request.host(), Some("contoso.azurecr.io"));
	}
}
