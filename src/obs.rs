//! Optional observability helpers for the request pipeline.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit structured spans named `registry_exchange.request` with the `stage`
//!   (pipeline stage) and `client` (logical client type) fields.
//! - Enable `metrics` to increment the `registry_exchange_request_total` counter for every
//!   attempt/success/failure, labeled by `stage` + `outcome`.

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Pipeline stages observed by the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestStage {
	/// A single physical attempt inside the retry boundary.
	Attempt,
	/// The retry-wrapped dispatch as seen by the requester.
	Dispatch,
	/// The AAD-to-registry token exchange call.
	Exchange,
}
impl RequestStage {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RequestStage::Attempt => "attempt",
			RequestStage::Dispatch => "dispatch",
			RequestStage::Exchange => "exchange",
		}
	}
}
impl Display for RequestStage {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestOutcome {
	/// Entry to a pipeline stage.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl RequestOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			RequestOutcome::Attempt => "attempt",
			RequestOutcome::Success => "success",
			RequestOutcome::Failure => "failure",
		}
	}
}
impl Display for RequestOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Emits a warning event when the `tracing` feature is enabled.
pub(crate) fn warn(message: impl Display) {
	#[cfg(feature = "tracing")]
	::tracing::warn!("{message}");
	#[cfg(not(feature = "tracing"))]
	let _ = message;
}

/// Emits a debug event when the `tracing` feature is enabled.
pub(crate) fn debug(message: impl Display) {
	#[cfg(feature = "tracing")]
	::tracing::debug!("{message}");
	#[cfg(not(feature = "tracing"))]
	let _ = message;
}
