//! Token-provider protocol and the provider chain.
//!
//! Providers are consulted through a two-phase protocol: a cheap, synchronous
//! [`can_process`](TokenProvider::can_process) pre-filter followed by the
//! asynchronous [`token`](TokenProvider::token) retrieval. `Ok(None)` is a
//! first-class outcome meaning "nothing to offer" (no tenant configured, the
//! upstream credential source declined); callers fall through to their next
//! authentication strategy rather than failing the request.

pub mod exchange;
pub use exchange::*;

// self
use crate::{_prelude::*, request::OutboundRequest};

/// Boxed future returned by [`TokenProvider::token`].
pub type TokenFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<String>>> + 'a + Send>>;

/// Mints authorization tokens for outbound requests.
pub trait TokenProvider: Send + Sync {
	/// Returns whether this provider owns the request's target.
	///
	/// Must be cheap and side-effect free; callers gate [`token`](Self::token)
	/// behind it.
	fn can_process(&self, request: &OutboundRequest) -> bool;

	/// Retrieves a token for the request, or `None` when the provider has
	/// nothing to offer.
	///
	/// `scope` names the audience the token is requested for and is forwarded
	/// to upstream credential sources unchanged.
	fn token<'a>(&'a self, request: &'a OutboundRequest, scope: &'a str) -> TokenFuture<'a>;
}

/// First-match-wins composition of providers.
///
/// The chain itself never errors on a request nobody owns; it yields
/// `Ok(None)` so callers can fall through.
#[derive(Clone, Default)]
pub struct ProviderChain(Vec<Arc<dyn TokenProvider>>);
impl ProviderChain {
	/// Creates an empty chain.
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a provider to the chain.
	pub fn with(mut self, provider: Arc<dyn TokenProvider>) -> Self {
		self.0.push(provider);

		self
	}
}
impl TokenProvider for ProviderChain {
	fn can_process(&self, request: &OutboundRequest) -> bool {
		self.0.iter().any(|provider| provider.can_process(request))
	}

	fn token<'a>(&'a self, request: &'a OutboundRequest, scope: &'a str) -> TokenFuture<'a> {
		Box::pin(async move {
			match self.0.iter().find(|provider| provider.can_process(request)) {
				Some(provider) => provider.token(request, scope).await,
				None => Ok(None),
			}
		})
	}
}
impl Debug for ProviderChain {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ProviderChain").field("providers", &self.0.len()).finish()
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use http::Method;
	// self
	use super::*;

	struct FixedProvider {
		suffix: &'static str,
		token: &'static str,
	}
	impl TokenProvider for FixedProvider {
		fn can_process(&self, request: &OutboundRequest) -> bool {
			request.host().is_some_and(|host| host.ends_with(self.suffix))
		}

		fn token<'a>(&'a self, _: &'a OutboundRequest, _: &'a str) -> TokenFuture<'a> {
			Box::pin(async move { Ok(Some(self.token.to_owned())) })
		}
	}

	fn request(url: &str) -> OutboundRequest {
		OutboundRequest::new(Method::GET, Url::parse(url).expect("Fixture URL should parse."))
	}

	#[tokio::test]
	async fn chain_is_first_match_wins() {
		let chain = ProviderChain::new()
			.with(Arc::new(FixedProvider { suffix: "azurecr.io", token: "registry" }))
			.with(Arc::new(FixedProvider { suffix: "io", token: "generic" }));
		let token = chain
			.token(&request("https://contoso.azurecr.io/v2/"), "scope")
			.await
			.expect("Chain should resolve.");

		assert_eq!(token.as_deref(), Some("registry"));
	}

	#[tokio::test]
	async fn unowned_requests_resolve_to_none() {
		let chain = ProviderChain::new()
			.with(Arc::new(FixedProvider { suffix: "azurecr.io", token: "registry" }));
		let token = chain
			.token(&request("https://contoso.example.com/"), "scope")
			.await
			.expect("Chain should resolve.");

		assert!(token.is_none());
		assert!(!chain.can_process(&request("https://contoso.example.com/")));
	}
}
