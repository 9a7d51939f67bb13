//! Middleware pipeline wrapped around every outbound transport call.
//!
//! `assemble` builds the ordered [`HandlerSpec`] list (pure construction
//! logic); [`PipelineBuilder`] turns specs into runtime handlers, owning the
//! shared breaker/throttle/lock state that must outlive individual
//! requesters. Handlers compose through [`Next`], a continuation over the
//! remaining chain that bottoms out at the transport.

pub mod assemble;
pub mod breaker;
pub mod handlers;
pub mod retry;
pub mod trace;

pub use assemble::*;
pub use breaker::*;
pub use handlers::*;
pub use retry::*;
pub use trace::*;

// self
use crate::{
	_prelude::*,
	context::CallContext,
	error::PipelineError,
	transport::{CompletionOption, DispatchEnvelope, ResponseMetadataSlot, Transport, WireRequest, WireResponse},
};

/// Boxed future returned by [`Handler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<WireResponse>> + 'a + Send>>;

/// One cross-cutting behavior in the chain.
///
/// Handlers receive the request by value, may rebuild or annotate it, and
/// delegate to `next` zero (short-circuit) or more (retry) times.
pub trait Handler: Send + Sync {
	/// Returns the behavior name for logging and chain inspection.
	fn kind(&self) -> HandlerKind;

	/// Processes the request and delegates to the remaining chain.
	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a>;
}

/// Continuation over the remaining chain, bottoming out at the transport.
#[derive(Clone, Copy)]
pub struct Next<'a> {
	handlers: &'a [Arc<dyn Handler>],
	transport: &'a dyn Transport,
	option: CompletionOption,
	slot: &'a ResponseMetadataSlot,
}
impl<'a> Next<'a> {
	pub(crate) fn new(
		handlers: &'a [Arc<dyn Handler>],
		transport: &'a dyn Transport,
		option: CompletionOption,
		slot: &'a ResponseMetadataSlot,
	) -> Self {
		Self { handlers, transport, option, slot }
	}

	/// Runs the remaining chain against the request.
	pub fn run(self, request: WireRequest, ctx: &'a CallContext) -> HandlerFuture<'a> {
		match self.handlers.split_first() {
			Some((head, rest)) => head.handle(request, ctx, Self { handlers: rest, ..self }),
			None => {
				let envelope = DispatchEnvelope {
					option: self.option,
					slot: self.slot.clone(),
					deadline: ctx.deadline(),
					cancellation: ctx.cancellation().clone(),
				};
				let cancellation = ctx.cancellation().clone();
				let transport = self.transport;

				// Racing here guarantees resolution even when the transport
				// ignores the flag it was handed.
				Box::pin(async move {
					tokio::select! {
						outcome = transport.dispatch(request, envelope) => Ok(outcome?),
						_ = cancellation.cancelled() => Err(PipelineError::Cancelled.into()),
					}
				})
			},
		}
	}
}
impl Debug for Next<'_> {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Next").field("remaining", &self.handlers.len()).finish()
	}
}

/// Rebuilds a wire request so the retry handler can replay it.
pub(crate) fn clone_request(request: &WireRequest) -> Result<WireRequest> {
	let mut builder = http::Request::builder()
		.method(request.method().clone())
		.uri(request.uri().clone())
		.version(request.version());

	if let Some(headers) = builder.headers_mut() {
		*headers = request.headers().clone();
	}

	builder.body(request.body().clone()).map_err(|e| crate::error::ConfigError::from(e).into())
}

/// Instantiates runtime handlers from specs, owning the shared state that
/// spans requesters (breaker windows, throttle hints, connection locks).
///
/// One builder lives as long as its factory; the chains it produces are
/// per-call and never shared.
#[derive(Clone, Debug, Default)]
pub struct PipelineBuilder {
	breaker_policy: BreakerPolicy,
	breakers: Arc<BreakerRegistry>,
	throttles: Arc<ThrottleRegistry>,
	locks: Arc<ConnectionLockRegistry>,
}
impl PipelineBuilder {
	/// Creates a builder with the default breaker policy.
	pub fn new() -> Self {
		Self::default()
	}

	/// Overrides the circuit-breaker policy.
	pub fn with_breaker_policy(mut self, policy: BreakerPolicy) -> Self {
		self.breaker_policy = policy;

		self
	}

	/// Builds runtime handlers in spec order.
	pub fn build(&self, specs: &[HandlerSpec]) -> Vec<Arc<dyn Handler>> {
		specs.iter().map(|spec| self.instantiate(spec)).collect()
	}

	fn instantiate(&self, spec: &HandlerSpec) -> Arc<dyn Handler> {
		match spec {
			HandlerSpec::ContextCapture => Arc::new(ContextCaptureHandler),
			HandlerSpec::TooManyRequestsShortCircuit =>
				Arc::new(TooManyRequestsHandler::new(self.throttles.clone())),
			HandlerSpec::Impersonation => Arc::new(ImpersonationHandler),
			HandlerSpec::SubjectDescriptorImpersonation => Arc::new(SubjectDescriptorHandler),
			HandlerSpec::AcceptLanguage => Arc::new(AcceptLanguageHandler),
			HandlerSpec::ClientIpForwarding => Arc::new(ClientIpForwardingHandler),
			HandlerSpec::Retry { max_retry_count, logical_name } =>
				Arc::new(RetryHandler::new(*max_retry_count, logical_name.clone())),
			HandlerSpec::Tracing {
				logical_name,
				slow_request_threshold,
				trace_percentage,
				sensitive_headers,
			} => Arc::new(TracingHandler::new(
				logical_name.clone(),
				*slow_request_threshold,
				*trace_percentage,
				sensitive_headers.clone(),
			)),
			HandlerSpec::Unauthorized => Arc::new(UnauthorizedHandler),
			HandlerSpec::Priority => Arc::new(PriorityHandler),
			HandlerSpec::Throttling { client } => Arc::new(CircuitBreakerHandler::new(
				client.clone(),
				self.breakers.state(client, self.breaker_policy),
			)),
			HandlerSpec::FaultInjection { host, percentage } =>
				Arc::new(FaultInjectionHandler::new(host.clone(), *percentage)),
			HandlerSpec::AccessMapping => Arc::new(AccessMappingHandler),
			HandlerSpec::ConsistencyHeader { level } =>
				Arc::new(ConsistencyHeaderHandler::new(*level)),
			HandlerSpec::Loopback => Arc::new(LoopbackHandler),
			HandlerSpec::ConnectionLock => Arc::new(ConnectionLockHandler::new(self.locks.clone())),
		}
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::{
		error::PipelineError,
		requester::PipelineOptions,
		transport::{ResponseMetadata, TransportFuture, status_only_response},
	};

	struct TestTransport {
		seen: Mutex<Vec<WireRequest>>,
		status: http::StatusCode,
	}
	impl TestTransport {
		fn ok() -> Self {
			Self { seen: Mutex::new(Vec::new()), status: http::StatusCode::OK }
		}
	}
	impl Transport for TestTransport {
		fn dispatch(
			&self,
			request: WireRequest,
			envelope: DispatchEnvelope,
		) -> TransportFuture<'_> {
			Box::pin(async move {
				envelope.slot.take();
				envelope.slot.store(ResponseMetadata {
					status: Some(self.status.as_u16()),
					retry_after: None,
				});
				self.seen.lock().push(request);

				Ok(status_only_response(self.status))
			})
		}
	}

	fn request(uri: &str) -> WireRequest {
		http::Request::builder().uri(uri).body(Vec::new()).expect("Fixture request should build.")
	}

	async fn run(
		handlers: &[Arc<dyn Handler>],
		transport: &TestTransport,
		request: WireRequest,
		ctx: &CallContext,
	) -> Result<WireResponse> {
		let slot = ResponseMetadataSlot::default();

		Next::new(handlers, transport, CompletionOption::ResponseContentRead, &slot)
			.run(request, ctx)
			.await
	}

	#[test]
	fn built_handlers_preserve_spec_order() {
		let options = PipelineOptions::default();
		let profiles = ClientProfileRegistry::new();
		let specs = minimal_chain(&MinimalChainInputs {
			client: "general-http-requester",
			logical_name: "acr",
			options: &options,
			environment: crate::env::ExecutionEnvironment::CLOUD,
			include_accept_language: true,
			consistency: None,
			profiles: &profiles,
		});
		let handlers = PipelineBuilder::new().build(&specs);
		let built: Vec<_> = handlers.iter().map(|handler| handler.kind()).collect();
		let specified: Vec<_> = specs.iter().map(HandlerSpec::kind).collect();

		assert_eq!(built, specified);
	}

	#[test]
	fn clone_request_copies_method_uri_headers_and_body() {
		let request = http::Request::builder()
			.method(http::Method::POST)
			.uri("https://contoso.azurecr.io/oauth2/exchange")
			.header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
			.body(b"grant_type=access_token".to_vec())
			.expect("Fixture request should build.");
		let replay = clone_request(&request).expect("Replay request should build.");

		assert_eq!(replay.method(), request.method());
		assert_eq!(replay.uri(), request.uri());
		assert_eq!(replay.headers(), request.headers());
		assert_eq!(replay.body(), request.body());
	}

	#[tokio::test]
	async fn context_headers_are_stamped_through_the_chain() {
		let handlers: Vec<Arc<dyn Handler>> = vec![
			Arc::new(ContextCaptureHandler),
			Arc::new(ImpersonationHandler),
			Arc::new(PriorityHandler),
		];
		let transport = TestTransport::ok();
		let ctx = CallContext::new()
			.with_activity_id("0123456789abcdef0123456789abcdef")
			.with_impersonation("build-agent");

		run(&handlers, &transport, request("https://contoso.azurecr.io/v2/"), &ctx)
			.await
			.expect("Chain should succeed.");

		let seen = transport.seen.lock();
		let headers = seen[0].headers();

		assert_eq!(
			headers.get(ACTIVITY_ID_HEADER).and_then(|v| v.to_str().ok()),
			Some("0123456789abcdef0123456789abcdef")
		);
		assert_eq!(
			headers.get(IMPERSONATION_HEADER).and_then(|v| v.to_str().ok()),
			Some("build-agent")
		);
		assert_eq!(headers.get(PRIORITY_HEADER).and_then(|v| v.to_str().ok()), Some("normal"));
	}

	#[tokio::test]
	async fn cancelled_context_short_circuits_before_dispatch() {
		let handlers: Vec<Arc<dyn Handler>> = vec![Arc::new(ContextCaptureHandler)];
		let transport = TestTransport::ok();
		let ctx = CallContext::new();

		ctx.cancellation().cancel();

		let outcome =
			run(&handlers, &transport, request("https://contoso.azurecr.io/v2/"), &ctx).await;

		assert!(matches!(outcome, Err(Error::Pipeline(PipelineError::Cancelled))));
		assert!(transport.seen.lock().is_empty());
	}

	#[tokio::test]
	async fn fault_injection_fails_only_the_configured_host() {
		let handlers: Vec<Arc<dyn Handler>> =
			vec![Arc::new(FaultInjectionHandler::new("contoso.azurecr.io".into(), 100))];
		let transport = TestTransport::ok();
		let ctx = CallContext::new();
		let outcome =
			run(&handlers, &transport, request("https://contoso.azurecr.io/v2/"), &ctx).await;

		assert!(matches!(outcome, Err(Error::Pipeline(PipelineError::FaultInjected { .. }))));

		run(&handlers, &transport, request("https://unrelated.example.com/"), &ctx)
			.await
			.expect("Unrelated hosts should pass through.");
	}

	#[tokio::test]
	async fn connection_lock_admits_repeated_calls() {
		let locks = Arc::new(ConnectionLockRegistry::default());
		let handlers: Vec<Arc<dyn Handler>> =
			vec![Arc::new(ConnectionLockHandler::new(locks))];
		let transport = TestTransport::ok();
		let ctx = CallContext::new();

		for _ in 0..2 {
			run(&handlers, &transport, request("https://contoso.azurecr.io/v2/"), &ctx)
				.await
				.expect("Warm and cold calls should both succeed.");
		}

		assert_eq!(transport.seen.lock().len(), 2);
	}

	#[tokio::test]
	async fn loopback_marks_requests_to_the_local_authority() {
		let handlers: Vec<Arc<dyn Handler>> = vec![Arc::new(LoopbackHandler)];
		let transport = TestTransport::ok();
		let ctx = CallContext::new().with_local_authority("contoso.azurecr.io");

		run(&handlers, &transport, request("https://contoso.azurecr.io/v2/"), &ctx)
			.await
			.expect("Chain should succeed.");
		run(&handlers, &transport, request("https://other.azurecr.io/v2/"), &ctx)
			.await
			.expect("Chain should succeed.");

		let seen = transport.seen.lock();

		assert!(seen[0].headers().contains_key(LOOPBACK_HEADER));
		assert!(!seen[1].headers().contains_key(LOOPBACK_HEADER));
	}
}
