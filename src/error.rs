//! Crate-level error types shared across providers, the requester, and the pipeline.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Canonical error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Programming-contract violation by the caller.
	#[error(transparent)]
	Contract(#[from] ContractError),
	/// Local configuration or request-construction problem.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// Transport failure (DNS, TCP, TLS, timeout).
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Failure raised by a pipeline handler (breaker, throttle, cancellation).
	#[error(transparent)]
	Pipeline(#[from] PipelineError),
	/// Token-exchange call failed or returned an unusable response.
	#[error(transparent)]
	Exchange(#[from] ExchangeError),
}

/// Caller contract violations; never tolerated silently.
#[derive(Debug, ThisError)]
pub enum ContractError {
	/// The exchange provider was handed a request its evaluator rejects.
	///
	/// Callers must gate token retrieval behind `can_process`; reaching this
	/// error means the pre-filter was skipped.
	#[error("Request targeting `{host}` is not eligible for this token provider.")]
	RequestNotEligible {
		/// Host of the offending request, or `<absent>` when the request has none.
		host: String,
	},
}

/// Configuration and request-construction failures.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(#[from] http::Error),
	/// The exchange endpoint could not be derived from the request URL.
	#[error("Exchange endpoint could not be derived from the request URL.")]
	InvalidEndpoint {
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// The runtime backing a blocking call variant could not be built.
	#[cfg(feature = "blocking")]
	#[error("Blocking runtime could not be constructed.")]
	BlockingRuntime {
		/// Underlying IO failure from the runtime builder.
		#[source]
		source: std::io::Error,
	},
}

/// Transport-level failures (network, IO).
#[derive(Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while dispatching the request.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: BoxError,
	},
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while dispatching the request.")]
	Io(#[from] std::io::Error),
	/// The call context's deadline elapsed before the request completed.
	#[error("Deadline elapsed before the request completed.")]
	DeadlineExceeded,
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Box::new(src) }
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		if e.is_timeout() { Self::DeadlineExceeded } else { Self::network(e) }
	}
}

/// Failures raised by individual pipeline handlers.
#[derive(Debug, ThisError)]
pub enum PipelineError {
	/// The ambient call context was canceled.
	#[error("Call was canceled before completion.")]
	Cancelled,
	/// The circuit breaker for the client type is open.
	#[error("Circuit breaker for client `{client}` is open.")]
	CircuitOpen {
		/// Logical client type guarded by the breaker.
		client: String,
	},
	/// The target host is throttling requests.
	#[error("Host `{host}` is throttling requests.")]
	Throttled {
		/// Throttling host.
		host: String,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// A configured fault was injected for the target host.
	#[error("Injected fault for host `{host}`.")]
	FaultInjected {
		/// Host the fault plan targets.
		host: String,
	},
}

/// Failures specific to the token-exchange call.
#[derive(Debug, ThisError)]
pub enum ExchangeError {
	/// The exchange call failed below the HTTP layer.
	#[error("Exchange call failed with status {status}: {message}.")]
	CallFailed {
		/// Best-effort status code captured from the last response context.
		status: u16,
		/// Innermost failure message reported by the requester.
		message: String,
	},
	/// The exchange endpoint returned a non-2xx status.
	#[error("Exchange endpoint returned status {status}.")]
	Status {
		/// HTTP status code returned by the exchange endpoint.
		status: u16,
	},
	/// The exchange endpoint returned a body that is not valid JSON.
	#[error("Exchange endpoint returned a malformed response body.")]
	ResponseParse {
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
		/// HTTP status code of the malformed response.
		status: u16,
	},
}
