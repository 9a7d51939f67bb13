//! Request evaluators that decide which provider owns an outbound call.

// self
use crate::{_prelude::*, request::OutboundRequest};

/// Default registry domain suffix matched by [`DomainSuffixEvaluator::registry`].
pub const REGISTRY_DOMAIN: &str = "azurecr.io";

/// Decides whether an outbound request belongs to a provider.
pub trait RequestEvaluator: Send + Sync {
	/// Returns `true` when the request targets the domain this evaluator guards.
	fn complies_with(&self, request: &OutboundRequest) -> bool;
}

/// Evaluator accepting hosts that end with a fixed suffix, ignoring case.
///
/// Absent hosts never comply. The comparison is a pure suffix check; it does
/// not validate label boundaries, matching the original registry matcher.
#[derive(Clone, Debug)]
pub struct DomainSuffixEvaluator {
	suffix: String,
}
impl DomainSuffixEvaluator {
	/// Creates an evaluator for the provided domain suffix.
	pub fn new(suffix: impl Into<String>) -> Self {
		Self { suffix: suffix.into() }
	}

	/// Creates the evaluator for the container-registry domain.
	pub fn registry() -> Self {
		Self::new(REGISTRY_DOMAIN)
	}

	/// Returns the configured suffix.
	pub fn suffix(&self) -> &str {
		&self.suffix
	}
}
impl RequestEvaluator for DomainSuffixEvaluator {
	fn complies_with(&self, request: &OutboundRequest) -> bool {
		let Some(host) = request.host() else {
			return false;
		};
		let host = host.as_bytes();
		let suffix = self.suffix.as_bytes();

		host.len() >= suffix.len()
			&& host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use http::Method;
	// self
	use super::*;

	fn request(url: &str) -> OutboundRequest {
		OutboundRequest::new(Method::GET, Url::parse(url).expect("Fixture URL should parse."))
	}

	#[test]
	fn suffix_match_ignores_case() {
		let evaluator = DomainSuffixEvaluator::registry();

		assert!(evaluator.complies_with(&request("https://contoso.azurecr.io/v2/")));
		assert!(evaluator.complies_with(&request("https://contoso.AzureCR.IO/v2/")));
		assert!(!evaluator.complies_with(&request("https://contoso.example.com/v2/")));
	}

	#[test]
	fn absent_host_never_complies() {
		let evaluator = DomainSuffixEvaluator::registry();

		assert!(!evaluator.complies_with(&request("unix:/run/registry.sock")));
	}

	#[test]
	fn short_host_never_complies() {
		let evaluator = DomainSuffixEvaluator::registry();

		assert!(!evaluator.complies_with(&request("https://cr.io/")));
	}
}
