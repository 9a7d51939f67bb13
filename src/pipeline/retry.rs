//! Retry with jittered exponential backoff.

// self
use crate::{
	_prelude::*,
	context::CallContext,
	error::{PipelineError, TransportError},
	obs,
	pipeline::{Handler, HandlerFuture, HandlerKind, Next, clone_request},
	transport::WireRequest,
};

const BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 5_000;

/// Replays transient failures up to a configured number of times.
///
/// The handler keeps the original message as a template and replays a fresh
/// copy per attempt. Everything placed after it in the chain observes each
/// physical attempt; everything before it observes only the final outcome.
pub struct RetryHandler {
	max_retry_count: u32,
	logical_name: String,
}
impl RetryHandler {
	/// Creates a retry handler for the given budget and log label.
	pub fn new(max_retry_count: u32, logical_name: String) -> Self {
		Self { max_retry_count, logical_name }
	}
}
impl Handler for RetryHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Retry
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			let mut attempt = 0_u32;

			loop {
				if ctx.is_cancelled() {
					return Err(PipelineError::Cancelled.into());
				}

				let message = clone_request(&request)?;
				let outcome = next.run(message, ctx).await;
				let retry = attempt < self.max_retry_count
					&& match &outcome {
						Ok(response) => retryable_status(response.status()),
						Err(err) => retryable_error(err),
					};

				if !retry {
					return outcome;
				}

				attempt += 1;

				obs::debug(format_args!(
					"Retrying `{}` call, attempt {attempt} of {}.",
					self.logical_name, self.max_retry_count
				));
				tokio::select! {
					_ = tokio::time::sleep(backoff_delay(attempt)) => {},
					_ = ctx.cancellation().cancelled() =>
						return Err(PipelineError::Cancelled.into()),
				}
			}
		})
	}
}

fn retryable_status(status: http::StatusCode) -> bool {
	matches!(status.as_u16(), 408 | 429 | 502 | 503 | 504)
}

fn retryable_error(err: &Error) -> bool {
	matches!(err, Error::Transport(TransportError::Network { .. } | TransportError::Io(_)))
}

fn backoff_delay(attempt: u32) -> std::time::Duration {
	let exp = BASE_BACKOFF_MS.saturating_mul(1_u64 << attempt.min(6));
	let capped = exp.min(MAX_BACKOFF_MS);
	let jitter = rand::rng().random_range(0..=capped / 2);

	std::time::Duration::from_millis(capped / 2 + jitter)
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::error::ConfigError;

	#[test]
	fn transient_statuses_are_retryable() {
		for status in [408, 429, 502, 503, 504] {
			assert!(retryable_status(
				http::StatusCode::from_u16(status).expect("Fixture status should be valid.")
			));
		}
		for status in [200, 201, 400, 401, 404, 500] {
			assert!(!retryable_status(
				http::StatusCode::from_u16(status).expect("Fixture status should be valid.")
			));
		}
	}

	#[test]
	fn only_transport_failures_are_retryable() {
		assert!(retryable_error(
			&TransportError::network(std::io::Error::other("connection reset")).into()
		));
		assert!(!retryable_error(&TransportError::DeadlineExceeded.into()));
		assert!(!retryable_error(&PipelineError::Cancelled.into()));
		assert!(!retryable_error(
			&PipelineError::CircuitOpen { client: "acr".into() }.into()
		));
		assert!(!retryable_error(
			&ConfigError::InvalidEndpoint { source: url::ParseError::EmptyHost }.into()
		));
	}

	#[test]
	fn backoff_grows_and_stays_capped() {
		for attempt in 1..10 {
			let delay = backoff_delay(attempt);

			assert!(delay.as_millis() as u64 <= MAX_BACKOFF_MS);
			assert!(delay.as_millis() as u64 >= BASE_BACKOFF_MS / 2);
		}
	}
}
