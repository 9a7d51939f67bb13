//! Single-purpose handlers: context capture, header injectors, the 401
//! observer, fault injection, loopback routing, and the connection lock.

// std
use std::sync::atomic::{AtomicBool, Ordering};
// crates.io
use http::{HeaderValue, header::ACCEPT_LANGUAGE};
// self
use crate::{
	_prelude::*,
	context::CallContext,
	error::PipelineError,
	obs,
	pipeline::{Handler, HandlerFuture, HandlerKind, Next},
	transport::WireRequest,
};

/// Header carrying the ambient activity identifier.
pub const ACTIVITY_ID_HEADER: &str = "x-request-activity-id";
/// Header carrying the impersonated identity.
pub const IMPERSONATION_HEADER: &str = "x-identity-impersonate";
/// Header carrying the impersonated subject descriptor.
pub const SUBJECT_DESCRIPTOR_HEADER: &str = "x-subject-descriptor";
/// Header carrying the originating client IP.
pub const CLIENT_IP_HEADER: &str = "x-forwarded-client-ip";
/// Header carrying the request priority.
pub const PRIORITY_HEADER: &str = "x-request-priority";
/// Header preserving the client access mapping.
pub const ACCESS_MAPPING_HEADER: &str = "x-access-mapping";
/// Header carrying the requested read-consistency level.
pub const CONSISTENCY_HEADER: &str = "x-read-consistency";
/// Header marking a request routed back into the local authority.
pub const LOOPBACK_HEADER: &str = "x-loopback-authority";

/// Stamps a header, skipping (with a warning) values that are not valid
/// header text. Existing values are not overwritten.
fn stamp(request: &mut WireRequest, name: &'static str, value: &str) {
	if request.headers().contains_key(name) {
		return;
	}

	match HeaderValue::from_str(value) {
		Ok(value) => {
			request.headers_mut().insert(name, value);
		},
		Err(_) => obs::warn(format_args!("Skipping header `{name}`: value is not header-safe.")),
	}
}

/// Propagates the ambient call context into the outbound message; always the
/// first handler. A context canceled before dispatch resolves immediately.
pub struct ContextCaptureHandler;
impl Handler for ContextCaptureHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::ContextCapture
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if ctx.is_cancelled() {
				return Err(PipelineError::Cancelled.into());
			}

			stamp(&mut request, ACTIVITY_ID_HEADER, ctx.activity_id());

			next.run(request, ctx).await
		})
	}
}

/// Injects the accept-language header from the context's culture.
pub struct AcceptLanguageHandler;
impl Handler for AcceptLanguageHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::AcceptLanguage
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if !request.headers().contains_key(ACCEPT_LANGUAGE) {
				match HeaderValue::from_str(ctx.culture()) {
					Ok(value) => {
						request.headers_mut().insert(ACCEPT_LANGUAGE, value);
					},
					Err(_) => obs::warn("Skipping accept-language: culture is not header-safe."),
				}
			}

			next.run(request, ctx).await
		})
	}
}

/// Stamps the impersonated identity, when the context carries one.
pub struct ImpersonationHandler;
impl Handler for ImpersonationHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Impersonation
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if let Some(identity) = ctx.impersonation() {
				stamp(&mut request, IMPERSONATION_HEADER, identity);
			}

			next.run(request, ctx).await
		})
	}
}

/// Stamps the impersonated subject descriptor, when the context carries one.
pub struct SubjectDescriptorHandler;
impl Handler for SubjectDescriptorHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::SubjectDescriptorImpersonation
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if let Some(descriptor) = ctx.subject_descriptor() {
				stamp(&mut request, SUBJECT_DESCRIPTOR_HEADER, descriptor);
			}

			next.run(request, ctx).await
		})
	}
}

/// Forwards the originating client IP for anti-DoS accounting.
pub struct ClientIpForwardingHandler;
impl Handler for ClientIpForwardingHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::ClientIpForwarding
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if let Some(ip) = ctx.client_ip() {
				stamp(&mut request, CLIENT_IP_HEADER, &ip.to_string());
			}

			next.run(request, ctx).await
		})
	}
}

/// Stamps the request priority.
pub struct PriorityHandler;
impl Handler for PriorityHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Priority
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			stamp(&mut request, PRIORITY_HEADER, ctx.priority().as_str());

			next.run(request, ctx).await
		})
	}
}

/// Preserves the client access mapping, when the context carries one.
pub struct AccessMappingHandler;
impl Handler for AccessMappingHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::AccessMapping
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if let Some(mapping) = ctx.access_mapping() {
				stamp(&mut request, ACCESS_MAPPING_HEADER, mapping);
			}

			next.run(request, ctx).await
		})
	}
}

/// Injects the read-consistency header.
pub struct ConsistencyHeaderHandler {
	level: crate::pipeline::ConsistencyLevel,
}
impl ConsistencyHeaderHandler {
	/// Creates the handler for a fixed consistency level.
	pub fn new(level: crate::pipeline::ConsistencyLevel) -> Self {
		Self { level }
	}
}
impl Handler for ConsistencyHeaderHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::ConsistencyHeader
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			stamp(&mut request, CONSISTENCY_HEADER, self.level.as_str());

			next.run(request, ctx).await
		})
	}
}

/// Observes 401 responses so authentication failures show up in logs even
/// when the caller swallows the response.
pub struct UnauthorizedHandler;
impl Handler for UnauthorizedHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Unauthorized
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			let host = request.uri().host().unwrap_or_default().to_owned();
			let response = next.run(request, ctx).await?;

			if response.status() == http::StatusCode::UNAUTHORIZED {
				let challenged = response.headers().contains_key(http::header::WWW_AUTHENTICATE);

				obs::warn(format_args!(
					"Host `{host}` rejected the call as unauthorized (challenge header present: {challenged})."
				));
			}

			Ok(response)
		})
	}
}

/// Probabilistically fails calls to a configured host so breaker, timeout,
/// and retry paths are exercised under realistic conditions.
pub struct FaultInjectionHandler {
	host: String,
	percentage: u8,
}
impl FaultInjectionHandler {
	/// Creates the handler; a zero percentage makes it a passthrough.
	pub fn new(host: String, percentage: u8) -> Self {
		Self { host, percentage: percentage.min(100) }
	}

	fn triggered(&self, request: &WireRequest) -> bool {
		if self.percentage == 0 || request.uri().host() != Some(self.host.as_str()) {
			return false;
		}

		self.percentage == 100 || rand::rng().random_range(0_u8..100) < self.percentage
	}
}
impl Handler for FaultInjectionHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::FaultInjection
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if self.triggered(&request) {
				return Err(PipelineError::FaultInjected { host: self.host.clone() }.into());
			}

			next.run(request, ctx).await
		})
	}
}

/// Marks requests whose target authority is the local authority so the host
/// process can route them back without leaving the machine.
///
/// Placed second-to-last: the message must be fully built before loopback
/// context is derived from it, and nothing after this point mutates it.
pub struct LoopbackHandler;
impl Handler for LoopbackHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Loopback
	}

	fn handle<'a>(
		&'a self,
		mut request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			let local = ctx
				.local_authority()
				.zip(request.uri().authority())
				.is_some_and(|(local, target)| local.eq_ignore_ascii_case(target.as_str()));

			if local {
				let authority = request
					.uri()
					.authority()
					.map(|authority| authority.as_str().to_owned())
					.unwrap_or_default();

				stamp(&mut request, LOOPBACK_HEADER, &authority);
			}

			next.run(request, ctx).await
		})
	}
}

#[derive(Debug, Default)]
struct LockState {
	warmed: AtomicBool,
	gate: AsyncMutex<()>,
}
impl LockState {
	fn is_warmed(&self) -> bool {
		self.warmed.load(Ordering::SeqCst)
	}

	fn mark_warmed(&self) {
		self.warmed.store(true, Ordering::SeqCst);
	}
}

/// Connection-lock states keyed by target authority.
#[derive(Debug, Default)]
pub struct ConnectionLockRegistry(Mutex<HashMap<String, Arc<LockState>>>);
impl ConnectionLockRegistry {
	fn state(&self, authority: &str) -> Arc<LockState> {
		let mut states = self.0.lock();

		states.entry(authority.to_owned()).or_default().clone()
	}
}

/// Serializes the first (cold) call per authority so concurrent callers do
/// not race to establish the same connection; once a call succeeds, the
/// authority is considered warm and the lock is skipped entirely. Always the
/// last handler.
pub struct ConnectionLockHandler {
	locks: Arc<ConnectionLockRegistry>,
}
impl ConnectionLockHandler {
	/// Creates a handler over the builder's shared lock registry.
	pub fn new(locks: Arc<ConnectionLockRegistry>) -> Self {
		Self { locks }
	}
}
impl Handler for ConnectionLockHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::ConnectionLock
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			let authority = request
				.uri()
				.authority()
				.map(|authority| authority.as_str().to_owned())
				.unwrap_or_default();
			let state = self.locks.state(&authority);

			if state.is_warmed() {
				return next.run(request, ctx).await;
			}

			let guard = state.gate.lock().await;

			if state.is_warmed() {
				drop(guard);

				return next.run(request, ctx).await;
			}

			let outcome = next.run(request, ctx).await;

			if outcome.is_ok() {
				state.mark_warmed();
			}

			drop(guard);

			outcome
		})
	}
}
