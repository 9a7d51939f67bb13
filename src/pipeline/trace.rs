//! Per-attempt tracing with sampling and sensitive-header redaction.

// std
use std::time::Instant;
// self
use crate::{
	_prelude::*,
	context::CallContext,
	obs::{self, RequestOutcome, RequestSpan, RequestStage, record_request_outcome},
	pipeline::{Handler, HandlerFuture, HandlerKind, Next},
	transport::WireRequest,
};

/// Traces individual attempts; sits inside the retry boundary so every
/// physical attempt is measured honestly.
pub struct TracingHandler {
	logical_name: String,
	slow_request_threshold: Duration,
	trace_percentage: u8,
	sensitive_headers: Vec<String>,
}
impl TracingHandler {
	/// Creates a tracing handler.
	///
	/// `trace_percentage` is clamped to `0..=100`; `sensitive_headers` are
	/// matched case-insensitively against header names before any value is
	/// logged.
	pub fn new(
		logical_name: String,
		slow_request_threshold: Duration,
		trace_percentage: u8,
		sensitive_headers: Vec<String>,
	) -> Self {
		Self {
			logical_name,
			slow_request_threshold,
			trace_percentage: trace_percentage.min(100),
			sensitive_headers,
		}
	}

	fn sampled(&self) -> bool {
		match self.trace_percentage {
			0 => false,
			100 => true,
			pct => rand::rng().random_range(0_u8..100) < pct,
		}
	}

	fn redacted_headers(&self, request: &WireRequest) -> Vec<String> {
		request
			.headers()
			.iter()
			.map(|(name, value)| {
				let sensitive = self
					.sensitive_headers
					.iter()
					.any(|header| header.eq_ignore_ascii_case(name.as_str()));
				let rendered = if sensitive {
					"***"
				} else {
					value.to_str().unwrap_or("<binary>")
				};

				format!("{name}: {rendered}")
			})
			.collect()
	}
}
impl Handler for TracingHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Tracing
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if !self.sampled() {
				return next.run(request, ctx).await;
			}

			let span = RequestSpan::new(RequestStage::Attempt, &self.logical_name);
			let headers = self.redacted_headers(&request);
			let started = Instant::now();

			record_request_outcome(RequestStage::Attempt, RequestOutcome::Attempt);

			let outcome = span.instrument(next.run(request, ctx)).await;
			let elapsed = started.elapsed();

			if Duration::try_from(elapsed).unwrap_or(Duration::MAX) > self.slow_request_threshold
			{
				obs::warn(format_args!(
					"Slow `{}` request took {elapsed:?} (threshold {}); headers: [{}].",
					self.logical_name,
					self.slow_request_threshold,
					headers.join(", ")
				));
			}

			match &outcome {
				Ok(_) => record_request_outcome(RequestStage::Attempt, RequestOutcome::Success),
				Err(_) => record_request_outcome(RequestStage::Attempt, RequestOutcome::Failure),
			}

			outcome
		})
	}
}
