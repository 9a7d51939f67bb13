//! Disposable outbound requester and its factory.
//!
//! A [`RequesterFactory`] is long-lived: it caches pipeline tunables from the
//! settings service at construction and owns the shared breaker/throttle/lock
//! state through its [`PipelineBuilder`]. The [`Requester`]s it mints are
//! cheap, single-purpose objects wrapping one transport handle; callers create
//! one per unit of work and drop it afterwards.

// crates.io
use http::StatusCode;
// self
use crate::{
	_prelude::*,
	context::CallContext,
	env::{ExecutionEnvironment, SettingsStore},
	obs::{RequestOutcome, RequestSpan, RequestStage, record_request_outcome},
	pipeline::{
		ClientProfileRegistry, ClientProfileSource, ConsistencyLevel, Handler, MinimalChainInputs,
		Next, PipelineBuilder, minimal_chain,
	},
	transport::{
		CompletionOption, ResponseMetadataSlot, Transport, WireRequest, WireResponse,
		status_only_response,
	},
};

/// Pipeline tunables cached by the factory at construction.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
	/// Maximum retry count on top of the initial attempt.
	pub max_retry_count: u32,
	/// Attempts slower than this are logged as slow requests.
	pub slow_request_threshold: Duration,
	/// Percentage of attempts that receive a trace span, in `0..=100`.
	pub trace_percentage: u8,
}
impl Default for PipelineOptions {
	fn default() -> Self {
		Self {
			max_retry_count: 3,
			slow_request_threshold: Duration::seconds(5),
			trace_percentage: 100,
		}
	}
}

/// Outcome envelope returned by [`Requester::send`].
///
/// `success` reflects only whether the pipeline resolved with a response;
/// a non-2xx status with `success == true` is the caller's to interpret.
#[derive(Debug)]
pub struct RequestResult {
	/// Whether the pipeline produced a response at all.
	pub success: bool,
	/// Observed (or best-effort) HTTP status code.
	pub status: StatusCode,
	/// The response, when the pipeline resolved with one.
	pub response: Option<WireResponse>,
	/// Innermost failure message, when the pipeline failed.
	pub error_message: Option<String>,
}

/// Single-purpose outbound requester wrapping one transport handle.
pub struct Requester {
	handlers: Vec<Arc<dyn Handler>>,
	transport: Box<dyn Transport>,
	context: CallContext,
	logical_name: String,
}
impl Requester {
	/// Sends one request through the middleware chain.
	///
	/// Failures never escape as errors: they are folded into the result with a
	/// best-effort status code. When the transport observed an HTTP status
	/// before failing (a buffering error after the headers arrived, say), that
	/// status is reported; otherwise the result carries a generic 500.
	pub async fn send(&self, message: WireRequest, option: CompletionOption) -> RequestResult {
		let span = RequestSpan::new(RequestStage::Dispatch, &self.logical_name);
		let slot = ResponseMetadataSlot::default();
		let next = Next::new(&self.handlers, self.transport.as_ref(), option, &slot);
		let outcome = span.instrument(next.run(message, &self.context)).await;

		match outcome {
			Ok(response) => {
				record_request_outcome(RequestStage::Dispatch, RequestOutcome::Success);

				RequestResult {
					success: true,
					status: response.status(),
					response: Some(response),
					error_message: None,
				}
			},
			Err(err) => {
				record_request_outcome(RequestStage::Dispatch, RequestOutcome::Failure);

				let status = slot
					.take()
					.and_then(|meta| meta.status)
					.and_then(|status| StatusCode::from_u16(status).ok())
					.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

				RequestResult {
					success: false,
					status,
					response: None,
					error_message: Some(innermost_message(&err)),
				}
			},
		}
	}

	/// Sends one request and always yields a response, synthesizing a
	/// status-only one when the pipeline failed.
	pub async fn send_simple(&self, message: WireRequest) -> WireResponse {
		let result = self.send(message, CompletionOption::ResponseContentRead).await;

		result.response.unwrap_or_else(|| status_only_response(result.status))
	}

	/// Blocking variant of [`send`](Self::send) for callers without an ambient
	/// executor; spins up a throwaway current-thread runtime per call.
	#[cfg(feature = "blocking")]
	pub fn send_blocking(
		&self,
		message: WireRequest,
		option: CompletionOption,
	) -> Result<RequestResult> {
		let runtime = tokio::runtime::Builder::new_current_thread()
			.enable_all()
			.build()
			.map_err(|source| crate::error::ConfigError::BlockingRuntime { source })?;

		Ok(runtime.block_on(self.send(message, option)))
	}
}
impl Debug for Requester {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Requester")
			.field("logical_name", &self.logical_name)
			.field("handlers", &self.handlers.len())
			.finish()
	}
}

fn innermost_message(err: &Error) -> String {
	let mut current: &dyn std::error::Error = err;

	while let Some(source) = current.source() {
		current = source;
	}

	current.to_string()
}

/// Mints disposable [`Requester`]s over the minimal middleware chain.
#[derive(Clone)]
pub struct RequesterFactory {
	context: CallContext,
	provider_type: String,
	options: PipelineOptions,
	environment: ExecutionEnvironment,
	consistency: Option<ConsistencyLevel>,
	include_accept_language: bool,
	profiles: Arc<dyn ClientProfileSource>,
	builder: PipelineBuilder,
}
impl RequesterFactory {
	/// Settings subtree holding the pipeline tunables.
	pub const SETTINGS_ROOT: &'static str = "/external-providers/http-requester";
	/// Logical client type shared by all general-purpose requesters.
	const GENERAL_CLIENT: &'static str = "general-http-requester";
	const MAX_RETRY_COUNT_KEY: &'static str = "max-retry-count";
	const SLOW_REQUEST_THRESHOLD_KEY: &'static str = "slow-request-threshold-secs";
	const TRACE_PERCENTAGE_KEY: &'static str = "trace-percentage";

	/// Creates a factory, caching pipeline tunables from the settings store.
	///
	/// `provider_type` labels every log line and trace span produced by the
	/// factory's requesters.
	pub fn new(
		context: CallContext,
		settings: &dyn SettingsStore,
		provider_type: impl Into<String>,
	) -> Self {
		let options = PipelineOptions::default();
		let max_retry_count = settings.integer(
			&Self::setting_path(Self::MAX_RETRY_COUNT_KEY),
			i64::from(options.max_retry_count),
		);
		let slow_secs = settings.integer(
			&Self::setting_path(Self::SLOW_REQUEST_THRESHOLD_KEY),
			options.slow_request_threshold.whole_seconds(),
		);
		let trace_percentage = settings.integer(
			&Self::setting_path(Self::TRACE_PERCENTAGE_KEY),
			i64::from(options.trace_percentage),
		);
		let options = PipelineOptions {
			max_retry_count: u32::try_from(max_retry_count.max(0)).unwrap_or(u32::MAX),
			slow_request_threshold: Duration::seconds(slow_secs.max(0)),
			trace_percentage: trace_percentage.clamp(0, 100) as _,
		};

		Self {
			context,
			provider_type: provider_type.into(),
			options,
			environment: ExecutionEnvironment::NONE,
			consistency: None,
			include_accept_language: true,
			profiles: Arc::new(ClientProfileRegistry::new()),
			builder: PipelineBuilder::new(),
		}
	}

	/// Sets the deployment environment flags the chain is assembled for.
	pub fn with_environment(mut self, environment: ExecutionEnvironment) -> Self {
		self.environment = environment;

		self
	}

	/// Requests a read-consistency header on hosted deployments.
	pub fn with_consistency(mut self, level: ConsistencyLevel) -> Self {
		self.consistency = Some(level);

		self
	}

	/// Replaces the per-client customization source.
	pub fn with_profiles(mut self, profiles: Arc<dyn ClientProfileSource>) -> Self {
		self.profiles = profiles;

		self
	}

	/// Overrides the circuit-breaker policy used on hosted deployments.
	pub fn with_breaker_policy(mut self, policy: crate::pipeline::BreakerPolicy) -> Self {
		self.builder = self.builder.with_breaker_policy(policy);

		self
	}

	/// Drops the accept-language injector from assembled chains.
	pub fn without_accept_language(mut self) -> Self {
		self.include_accept_language = false;

		self
	}

	/// Returns the provider type this factory labels its requesters with.
	pub fn provider_type(&self) -> &str {
		&self.provider_type
	}

	/// Mints a requester around the given transport handle.
	pub fn requester(&self, transport: Box<dyn Transport>) -> Requester {
		let specs = minimal_chain(&MinimalChainInputs {
			client: Self::GENERAL_CLIENT,
			logical_name: &self.provider_type,
			options: &self.options,
			environment: self.environment,
			include_accept_language: self.include_accept_language,
			consistency: self.consistency,
			profiles: self.profiles.as_ref(),
		});

		Requester {
			handlers: self.builder.build(&specs),
			transport,
			context: self.context.clone(),
			logical_name: self.provider_type.clone(),
		}
	}

	/// Mints a requester over a default [`ReqwestTransport`].
	#[cfg(feature = "reqwest")]
	pub fn default_requester(&self) -> Requester {
		self.requester(Box::new(crate::transport::ReqwestTransport::default()))
	}

	fn setting_path(key: &str) -> String {
		format!("{}/{key}", Self::SETTINGS_ROOT)
	}
}
impl Debug for RequesterFactory {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("RequesterFactory")
			.field("provider_type", &self.provider_type)
			.field("options", &self.options)
			.field("environment", &self.environment)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		context::CancellationFlag,
		env::MemorySettings,
		error::TransportError,
		transport::{DispatchEnvelope, ResponseMetadata, TransportFuture},
	};

	struct CannedTransport {
		status: Option<StatusCode>,
		fail: bool,
	}
	impl Transport for CannedTransport {
		fn dispatch(
			&self,
			_request: WireRequest,
			envelope: DispatchEnvelope,
		) -> TransportFuture<'_> {
			Box::pin(async move {
				envelope.slot.take();

				if let Some(status) = self.status {
					envelope.slot.store(ResponseMetadata {
						status: Some(status.as_u16()),
						retry_after: None,
					});
				}
				if self.fail {
					return Err(TransportError::network(std::io::Error::other(
						"connection reset by peer",
					)));
				}

				Ok(status_only_response(self.status.unwrap_or(StatusCode::OK)))
			})
		}
	}

	fn factory() -> RequesterFactory {
		RequesterFactory::new(CallContext::new(), &MemorySettings::default(), "acr")
	}

	fn request() -> WireRequest {
		http::Request::builder()
			.uri("https://contoso.azurecr.io/v2/")
			.body(Vec::new())
			.expect("Fixture request should build.")
	}

	#[test]
	fn factory_caches_settings_overrides() {
		let settings = MemorySettings::default()
			.with("/external-providers/http-requester/max-retry-count", 7)
			.with("/external-providers/http-requester/slow-request-threshold-secs", 11)
			.with("/external-providers/http-requester/trace-percentage", 250);
		let factory = RequesterFactory::new(CallContext::new(), &settings, "acr");

		assert_eq!(factory.options.max_retry_count, 7);
		assert_eq!(factory.options.slow_request_threshold, Duration::seconds(11));
		assert_eq!(factory.options.trace_percentage, 100);
	}

	#[tokio::test]
	async fn non_success_statuses_still_count_as_resolved() {
		let requester = factory()
			.requester(Box::new(CannedTransport { status: Some(StatusCode::NOT_FOUND), fail: false }));
		let result = requester.send(request(), CompletionOption::ResponseContentRead).await;

		assert!(result.success);
		assert_eq!(result.status, StatusCode::NOT_FOUND);
		assert!(result.error_message.is_none());
	}

	#[tokio::test]
	async fn failure_reports_the_observed_status() {
		let requester = factory()
			.requester(Box::new(CannedTransport { status: Some(StatusCode::BAD_GATEWAY), fail: true }));
		let result = requester.send(request(), CompletionOption::ResponseContentRead).await;

		assert!(!result.success);
		assert_eq!(result.status, StatusCode::BAD_GATEWAY);
		assert_eq!(result.error_message.as_deref(), Some("connection reset by peer"));
	}

	#[tokio::test]
	async fn failure_without_observed_status_reports_a_generic_500() {
		let requester =
			factory().requester(Box::new(CannedTransport { status: None, fail: true }));
		let result = requester.send(request(), CompletionOption::ResponseContentRead).await;

		assert!(!result.success);
		assert_eq!(result.status, StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn cancellation_resolves_an_in_flight_call_as_a_failure() {
		struct StalledTransport;
		impl Transport for StalledTransport {
			fn dispatch(
				&self,
				_request: WireRequest,
				envelope: DispatchEnvelope,
			) -> TransportFuture<'_> {
				Box::pin(async move {
					envelope.slot.take();
					tokio::time::sleep(std::time::Duration::from_secs(30)).await;

					Ok(status_only_response(StatusCode::OK))
				})
			}
		}

		let flag = CancellationFlag::new();
		let factory = RequesterFactory::new(
			CallContext::new().with_cancellation(flag.clone()),
			&MemorySettings::default(),
			"acr",
		);
		let requester = factory.requester(Box::new(StalledTransport));
		let canceller = flag.clone();

		tokio::spawn(async move {
			tokio::time::sleep(std::time::Duration::from_millis(100)).await;
			canceller.cancel();
		});

		let result = tokio::time::timeout(
			std::time::Duration::from_secs(3),
			requester.send(request(), CompletionOption::ResponseContentRead),
		)
		.await
		.expect("A canceled in-flight call should resolve promptly.");

		assert!(!result.success);
		assert_eq!(result.status, StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn send_simple_synthesizes_a_status_only_response_on_failure() {
		let requester = factory()
			.requester(Box::new(CannedTransport { status: Some(StatusCode::BAD_GATEWAY), fail: true }));
		let response = requester.send_simple(request()).await;

		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		assert!(response.body().is_empty());
	}

	#[test]
	fn provider_type_is_exposed() {
		assert_eq!(factory().provider_type(), "acr");
	}
}
