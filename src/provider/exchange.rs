//! AAD-to-registry token exchange.
//!
//! The registry's `/oauth2/exchange` endpoint trades a directory access token
//! for a registry refresh token. The provider wraps that call: it pre-filters
//! requests through a [`RequestEvaluator`], pulls the directory token from an
//! upstream [`TokenProvider`], and posts the exchange form through a fully
//! assembled requester so the call inherits retry, tracing, and breaker
//! behavior like any other outbound call.

// crates.io
use http::{Method, header::CONTENT_TYPE};
use serde::Deserialize;
// self
use crate::{
	_prelude::*,
	error::{ConfigError, ContractError, ExchangeError},
	evaluator::{DomainSuffixEvaluator, RequestEvaluator},
	obs::{RequestOutcome, RequestSpan, RequestStage, record_request_outcome},
	provider::{TokenFuture, TokenProvider},
	request::{AuthorizationParameters, OutboundRequest},
	requester::RequesterFactory,
	transport::{CompletionOption, TransportFactory, WireRequest},
};

/// OAuth2 form-field and path constants used by the exchange endpoint.
pub mod oauth {
	/// Grant-type form field.
	pub const GRANT_TYPE: &str = "grant_type";
	/// Grant type naming the access-token exchange flow.
	pub const ACCESS_TOKEN_GRANT: &str = "access_token";
	/// Service (registry host) form field.
	pub const SERVICE: &str = "service";
	/// Tenant form field.
	pub const TENANT: &str = "tenant";
	/// Access-token form field carrying the directory token.
	pub const ACCESS_TOKEN: &str = "access_token";
	/// Response field carrying the minted refresh token.
	pub const REFRESH_TOKEN: &str = "refresh_token";
	/// Exchange endpoint path, absolute on the registry authority.
	pub const EXCHANGE_PATH: &str = "/oauth2/exchange";
}

#[derive(Debug, Deserialize)]
struct ExchangeResponseBody {
	refresh_token: Option<String>,
}

/// Exchanges a directory access token for a registry refresh token.
pub struct ExchangeTokenProvider {
	upstream: Arc<dyn TokenProvider>,
	authorization: AuthorizationParameters,
	factory: Arc<RequesterFactory>,
	transports: Arc<dyn TransportFactory>,
	evaluator: Arc<dyn RequestEvaluator>,
}
impl ExchangeTokenProvider {
	/// Creates a provider guarding the default registry domain.
	///
	/// `upstream` supplies the directory access token that is traded in;
	/// `authorization` carries the endpoint configuration, including the
	/// tenant under [`TENANT_ID_PARAMETER`](crate::request::TENANT_ID_PARAMETER).
	pub fn new(
		upstream: Arc<dyn TokenProvider>,
		authorization: AuthorizationParameters,
		factory: Arc<RequesterFactory>,
		transports: Arc<dyn TransportFactory>,
	) -> Self {
		Self {
			upstream,
			authorization,
			factory,
			transports,
			evaluator: Arc::new(DomainSuffixEvaluator::registry()),
		}
	}

	/// Replaces the request evaluator.
	pub fn with_evaluator(mut self, evaluator: Arc<dyn RequestEvaluator>) -> Self {
		self.evaluator = evaluator;

		self
	}

	async fn exchange(&self, request: &OutboundRequest, scope: &str) -> Result<Option<String>> {
		if !self.evaluator.complies_with(request) {
			return Err(ContractError::RequestNotEligible {
				host: request.host().unwrap_or("<absent>").to_owned(),
			}
			.into());
		}

		let Some(tenant) = self.authorization.tenant_id() else {
			return Ok(None);
		};
		let Some(directory_token) = self.upstream.token(request, scope).await? else {
			return Ok(None);
		};
		let endpoint = exchange_endpoint(request.url())?;
		// The service field is the bare registry host; ports never appear in
		// the token's audience.
		let service = endpoint.host_str().unwrap_or_default().to_owned();
		let body = exchange_body(&service, tenant, &directory_token);
		let wire: WireRequest = http::Request::builder()
			.method(Method::POST)
			.uri(endpoint.as_str())
			.header(CONTENT_TYPE, "application/x-www-form-urlencoded")
			.body(body)
			.map_err(ConfigError::from)?;
		let requester = self.factory.requester(self.transports.handle());
		let span = RequestSpan::new(RequestStage::Exchange, self.factory.provider_type());
		let result =
			span.instrument(requester.send(wire, CompletionOption::ResponseContentRead)).await;

		if !result.success {
			record_request_outcome(RequestStage::Exchange, RequestOutcome::Failure);

			return Err(ExchangeError::CallFailed {
				status: result.status.as_u16(),
				message: result.error_message.unwrap_or_default(),
			}
			.into());
		}

		let status = result.status.as_u16();
		let Some(response) = result.response else {
			return Err(ExchangeError::CallFailed {
				status,
				message: "Response was not captured.".into(),
			}
			.into());
		};

		if !result.status.is_success() {
			record_request_outcome(RequestStage::Exchange, RequestOutcome::Failure);

			return Err(ExchangeError::Status { status }.into());
		}

		let mut deserializer = serde_json::Deserializer::from_slice(response.body());
		let body: ExchangeResponseBody = serde_path_to_error::deserialize(&mut deserializer)
			.map_err(|source| ExchangeError::ResponseParse { source, status })?;

		record_request_outcome(RequestStage::Exchange, RequestOutcome::Success);

		Ok(body.refresh_token)
	}

	/// Blocking variant of [`token`](TokenProvider::token) for callers without
	/// an ambient executor.
	#[cfg(feature = "blocking")]
	pub fn token_blocking(
		&self,
		request: &OutboundRequest,
		scope: &str,
	) -> Result<Option<String>> {
		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.map_err(|source| ConfigError::BlockingRuntime { source })?;

		runtime.block_on(self.exchange(request, scope))
	}
}
impl TokenProvider for ExchangeTokenProvider {
	fn can_process(&self, request: &OutboundRequest) -> bool {
		self.evaluator.complies_with(request)
	}

	fn token<'a>(&'a self, request: &'a OutboundRequest, scope: &'a str) -> TokenFuture<'a> {
		Box::pin(self.exchange(request, scope))
	}
}
impl Debug for ExchangeTokenProvider {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ExchangeTokenProvider")
			.field("provider_type", &self.factory.provider_type())
			.finish()
	}
}

fn exchange_endpoint(url: &Url) -> Result<Url> {
	url.join(oauth::EXCHANGE_PATH).map_err(|source| ConfigError::InvalidEndpoint { source }.into())
}

fn exchange_body(service: &str, tenant: &str, directory_token: &str) -> Vec<u8> {
	url::form_urlencoded::Serializer::new(String::new())
		.append_pair(oauth::GRANT_TYPE, oauth::ACCESS_TOKEN_GRANT)
		.append_pair(oauth::SERVICE, service)
		.append_pair(oauth::TENANT, tenant)
		.append_pair(oauth::ACCESS_TOKEN, directory_token)
		.finish()
		.into_bytes()
}
