//! Pure chain-assembly logic.
//!
//! Assembly is a deterministic function of its inputs: the same inputs always
//! yield the same ordered handler list. Order is a correctness contract, not a
//! style choice — handlers placed inside the retry boundary observe every
//! physical attempt, handlers placed outside observe only the retry-wrapped
//! unit. Reordering changes breaker volume accounting, trace attribution, and
//! security-header placement.

// self
use crate::{
	_prelude::*,
	env::{CONFIGURE_AWAIT_FLAG, ExecutionEnvironment, FeatureFlags, TOO_MANY_REQUESTS_FLAG},
	obs,
	requester::PipelineOptions,
};

/// Read-consistency level injected by the consistency-header handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyLevel {
	/// Reads may lag behind writes.
	Eventual,
	/// Reads observe this session's own writes.
	Session,
	/// Reads observe all committed writes.
	Strong,
}
impl ConsistencyLevel {
	/// Returns a stable label suitable for header values.
	pub const fn as_str(self) -> &'static str {
		match self {
			ConsistencyLevel::Eventual => "eventual",
			ConsistencyLevel::Session => "session",
			ConsistencyLevel::Strong => "strong",
		}
	}
}
impl Display for ConsistencyLevel {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Behavior names used to compare assembled chains without their parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerKind {
	/// Ambient-context propagation; always first.
	ContextCapture,
	/// Fail-fast path for hosts known to be throttling.
	TooManyRequestsShortCircuit,
	/// Impersonated-identity header.
	Impersonation,
	/// Impersonated subject-descriptor header.
	SubjectDescriptorImpersonation,
	/// Accept-language header.
	AcceptLanguage,
	/// Originating client IP forwarding (anti-DoS).
	ClientIpForwarding,
	/// Retry with jittered backoff.
	Retry,
	/// Per-attempt tracing with sampling and redaction.
	Tracing,
	/// 401 challenge observer.
	Unauthorized,
	/// Request-priority header.
	Priority,
	/// Failure-volume circuit breaker.
	Throttling,
	/// Probabilistic fault injection for a target host.
	FaultInjection,
	/// Client access-mapping preservation.
	AccessMapping,
	/// Read-consistency header.
	ConsistencyHeader,
	/// Loopback routing for local targets; second-to-last when present.
	Loopback,
	/// Cold-connection serialization; always last.
	ConnectionLock,
}

/// One middleware behavior plus its construction parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerSpec {
	/// Ambient-context propagation; always first.
	ContextCapture,
	/// Fail-fast path for hosts known to be throttling.
	TooManyRequestsShortCircuit,
	/// Impersonated-identity header.
	Impersonation,
	/// Impersonated subject-descriptor header.
	SubjectDescriptorImpersonation,
	/// Accept-language header.
	AcceptLanguage,
	/// Originating client IP forwarding (anti-DoS).
	ClientIpForwarding,
	/// Retry with jittered backoff.
	Retry {
		/// Maximum retry count on top of the initial attempt.
		max_retry_count: u32,
		/// Logical name used for log correlation.
		logical_name: String,
	},
	/// Per-attempt tracing; sits inside retry so each attempt is traced and
	/// its duration measured honestly.
	Tracing {
		/// Logical name used as the span's client field.
		logical_name: String,
		/// Attempts slower than this are logged as slow requests.
		slow_request_threshold: Duration,
		/// Percentage of attempts that receive a span, in `0..=100`.
		trace_percentage: u8,
		/// Header names redacted from traces.
		sensitive_headers: Vec<String>,
	},
	/// 401 challenge observer.
	Unauthorized,
	/// Request-priority header.
	Priority,
	/// Failure-volume circuit breaker; inside retry so each failed attempt
	/// counts toward breaker volume.
	Throttling {
		/// Logical client type sharing one breaker.
		client: String,
	},
	/// Probabilistic fault injection; inside the other hosted handlers so
	/// injected faults exercise realistic breaker and retry paths.
	FaultInjection {
		/// Host the fault plan targets.
		host: String,
		/// Injection probability in percent; `0` disables injection.
		percentage: u8,
	},
	/// Client access-mapping preservation.
	AccessMapping,
	/// Read-consistency header.
	ConsistencyHeader {
		/// Level to inject.
		level: ConsistencyLevel,
	},
	/// Loopback routing; placed second-to-last so the message is fully built
	/// before loopback context is derived from it.
	Loopback,
	/// Cold-connection serialization; always last.
	ConnectionLock,
}
impl HandlerSpec {
	/// Returns the behavior name without its parameters.
	pub const fn kind(&self) -> HandlerKind {
		match self {
			HandlerSpec::ContextCapture => HandlerKind::ContextCapture,
			HandlerSpec::TooManyRequestsShortCircuit => HandlerKind::TooManyRequestsShortCircuit,
			HandlerSpec::Impersonation => HandlerKind::Impersonation,
			HandlerSpec::SubjectDescriptorImpersonation =>
				HandlerKind::SubjectDescriptorImpersonation,
			HandlerSpec::AcceptLanguage => HandlerKind::AcceptLanguage,
			HandlerSpec::ClientIpForwarding => HandlerKind::ClientIpForwarding,
			HandlerSpec::Retry { .. } => HandlerKind::Retry,
			HandlerSpec::Tracing { .. } => HandlerKind::Tracing,
			HandlerSpec::Unauthorized => HandlerKind::Unauthorized,
			HandlerSpec::Priority => HandlerKind::Priority,
			HandlerSpec::Throttling { .. } => HandlerKind::Throttling,
			HandlerSpec::FaultInjection { .. } => HandlerKind::FaultInjection,
			HandlerSpec::AccessMapping => HandlerKind::AccessMapping,
			HandlerSpec::ConsistencyHeader { .. } => HandlerKind::ConsistencyHeader,
			HandlerSpec::Loopback => HandlerKind::Loopback,
			HandlerSpec::ConnectionLock => HandlerKind::ConnectionLock,
		}
	}
}

/// Per-client chain customization: redacted headers and extra handlers.
///
/// This is the declarative replacement for the original's reflection over
/// static per-client-type annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientProfile {
	/// Header names that must never appear in traces.
	pub sensitive_headers: Vec<String>,
	/// Extra handler specs appended after tracing.
	pub extra: Vec<HandlerSpec>,
}

/// Error raised when a client profile cannot be loaded.
#[derive(Clone, Debug, ThisError)]
#[error("Client profile for `{client}` could not be loaded.")]
pub struct ProfileError {
	/// Client type whose profile failed to load.
	pub client: String,
}

/// Source of per-client chain customizations.
pub trait ClientProfileSource: Send + Sync {
	/// Returns the profile for a logical client type.
	///
	/// A missing client is not an error; sources should return the default
	/// profile. Errors are reserved for sources backed by fallible storage.
	fn profile(&self, client: &str) -> Result<ClientProfile, ProfileError>;
}

/// Infallible in-memory profile source.
#[derive(Clone, Debug, Default)]
pub struct ClientProfileRegistry(HashMap<String, ClientProfile>);
impl ClientProfileRegistry {
	/// Creates an empty registry (every client gets the default profile).
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a profile for a logical client type.
	pub fn with(mut self, client: impl Into<String>, profile: ClientProfile) -> Self {
		self.0.insert(client.into(), profile);

		self
	}
}
impl ClientProfileSource for ClientProfileRegistry {
	fn profile(&self, client: &str) -> Result<ClientProfile, ProfileError> {
		Ok(self.0.get(client).cloned().unwrap_or_default())
	}
}

/// Inputs for [`minimal_chain`].
pub struct MinimalChainInputs<'a> {
	/// Logical client type (breaker key and profile lookup).
	pub client: &'a str,
	/// Logical name used for log correlation (the factory's provider type).
	pub logical_name: &'a str,
	/// Tunables cached by the requester factory.
	pub options: &'a PipelineOptions,
	/// Deployment environment flags.
	pub environment: ExecutionEnvironment,
	/// Whether the accept-language injector is included (on by default).
	pub include_accept_language: bool,
	/// Read-consistency level, when one was supplied.
	pub consistency: Option<ConsistencyLevel>,
	/// Per-client customization source.
	pub profiles: &'a dyn ClientProfileSource,
}

/// Inputs for [`full_chain`].
pub struct FullChainInputs<'a> {
	/// Logical client type (breaker key and profile lookup).
	pub client: &'a str,
	/// Logical name used for log correlation.
	pub logical_name: &'a str,
	/// Tunables cached by the requester factory.
	pub options: &'a PipelineOptions,
	/// Deployment environment flags.
	pub environment: ExecutionEnvironment,
	/// Feature flags gating the too-many-requests short circuit.
	pub features: &'a dyn FeatureFlags,
	/// Whether the accept-language injector is included (on by default).
	pub include_accept_language: bool,
	/// Read-consistency level, when one was supplied.
	pub consistency: Option<ConsistencyLevel>,
	/// Host targeted by fault injection.
	pub target_host: &'a str,
	/// Fault-injection probability in percent; `0` disables injection.
	pub fault_percentage: u8,
	/// Set when the root context asked to bypass loopback handling.
	pub bypass_loopback: bool,
	/// Per-client customization source.
	pub profiles: &'a dyn ClientProfileSource,
}

/// Assembles the minimal chain used by narrow, single-purpose clients.
///
/// Hosted deployments gain the circuit breaker (inside the retry boundary)
/// and, when a consistency level was supplied, the consistency-header
/// injector.
pub fn minimal_chain(inputs: &MinimalChainInputs) -> Vec<HandlerSpec> {
	let profile = load_profile(inputs.profiles, inputs.client);
	let mut specs = vec![HandlerSpec::ContextCapture];

	if inputs.include_accept_language {
		specs.push(HandlerSpec::AcceptLanguage);
	}

	specs.push(HandlerSpec::Retry {
		max_retry_count: inputs.options.max_retry_count,
		logical_name: inputs.logical_name.into(),
	});
	specs.push(tracing_spec(inputs.logical_name, inputs.options, profile.sensitive_headers));
	specs.extend(profile.extra);

	if inputs.environment.is_hosted() {
		specs.push(HandlerSpec::Throttling { client: inputs.client.into() });

		if let Some(level) = inputs.consistency {
			specs.push(HandlerSpec::ConsistencyHeader { level });
		}
	}

	specs
}

/// Assembles the full chain used by general service-to-service clients.
///
/// This is the canonical ordering contract; the minimal chain is a subset of
/// it. The connection lock is always last, and the loopback handler (when
/// on-premises without the bypass flag) sits immediately before it.
pub fn full_chain(inputs: &FullChainInputs) -> Vec<HandlerSpec> {
	let profile = load_profile(inputs.profiles, inputs.client);
	let hosted = inputs.environment.is_hosted();
	let mut specs = vec![HandlerSpec::ContextCapture];

	if hosted
		&& inputs.features.enabled(CONFIGURE_AWAIT_FLAG)
		&& inputs.features.enabled(TOO_MANY_REQUESTS_FLAG)
	{
		specs.push(HandlerSpec::TooManyRequestsShortCircuit);
	}

	specs.push(HandlerSpec::Impersonation);
	specs.push(HandlerSpec::SubjectDescriptorImpersonation);

	if inputs.include_accept_language {
		specs.push(HandlerSpec::AcceptLanguage);
	}

	specs.push(HandlerSpec::ClientIpForwarding);
	specs.push(HandlerSpec::Retry {
		max_retry_count: inputs.options.max_retry_count,
		logical_name: inputs.logical_name.into(),
	});
	specs.push(tracing_spec(inputs.logical_name, inputs.options, profile.sensitive_headers));
	specs.extend(profile.extra);

	if hosted {
		specs.push(HandlerSpec::Unauthorized);
		specs.push(HandlerSpec::Priority);
		specs.push(HandlerSpec::Throttling { client: inputs.client.into() });
		specs.push(HandlerSpec::FaultInjection {
			host: inputs.target_host.into(),
			percentage: inputs.fault_percentage,
		});
		specs.push(HandlerSpec::AccessMapping);

		if let Some(level) = inputs.consistency {
			specs.push(HandlerSpec::ConsistencyHeader { level });
		}
	}
	if inputs.environment.is_on_premises() && !inputs.bypass_loopback {
		specs.push(HandlerSpec::Loopback);
	}

	specs.push(HandlerSpec::ConnectionLock);

	specs
}

fn tracing_spec(
	logical_name: &str,
	options: &PipelineOptions,
	sensitive_headers: Vec<String>,
) -> HandlerSpec {
	HandlerSpec::Tracing {
		logical_name: logical_name.into(),
		slow_request_threshold: options.slow_request_threshold,
		trace_percentage: options.trace_percentage,
		sensitive_headers,
	}
}

fn load_profile(profiles: &dyn ClientProfileSource, client: &str) -> ClientProfile {
	profiles.profile(client).unwrap_or_else(|err| {
		obs::warn(format_args!("Falling back to the default client profile: {err}"));

		ClientProfile::default()
	})
}
