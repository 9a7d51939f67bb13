//! Failure-volume circuit breaking and throttle short-circuiting.
//!
//! Both handlers draw on state owned by the [`PipelineBuilder`], so the
//! observed failure volume spans every requester the owning factory creates.
//! The breaker sits inside the retry boundary: each failed physical attempt
//! counts toward its volume.

// std
use std::time::Instant;
// self
use crate::{
	_prelude::*,
	context::CallContext,
	error::PipelineError,
	pipeline::{Handler, HandlerFuture, HandlerKind, Next},
	transport::{WireRequest, parse_retry_after},
};

/// Circuit-breaker tuning shared by every breaker a builder creates.
#[derive(Clone, Copy, Debug)]
pub struct BreakerPolicy {
	/// Consecutive failures that trip the breaker.
	pub failure_threshold: u32,
	/// How long the breaker stays open before admitting a probe.
	pub cooldown: std::time::Duration,
}
impl Default for BreakerPolicy {
	fn default() -> Self {
		Self { failure_threshold: 5, cooldown: std::time::Duration::from_secs(30) }
	}
}

#[derive(Debug, Default)]
struct BreakerWindow {
	failures: u32,
	opened_at: Option<Instant>,
}

/// Breaker state for one logical client type.
#[derive(Debug)]
pub struct BreakerState {
	policy: BreakerPolicy,
	window: Mutex<BreakerWindow>,
}
impl BreakerState {
	fn new(policy: BreakerPolicy) -> Self {
		Self { policy, window: Mutex::new(BreakerWindow::default()) }
	}

	/// Returns whether the next attempt may proceed.
	///
	/// While open, one probe is admitted per elapsed cooldown; granting the
	/// probe restarts the cooldown so concurrent callers cannot stampede.
	pub fn admit(&self) -> bool {
		let mut window = self.window.lock();

		match window.opened_at {
			None => true,
			Some(opened_at) =>
				if opened_at.elapsed() >= self.policy.cooldown {
					window.opened_at = Some(Instant::now());

					true
				} else {
					false
				},
		}
	}

	/// Records a successful attempt, closing the breaker.
	pub fn record_success(&self) {
		let mut window = self.window.lock();

		window.failures = 0;
		window.opened_at = None;
	}

	/// Records a failed attempt, tripping the breaker at the threshold.
	pub fn record_failure(&self) {
		let mut window = self.window.lock();

		window.failures = window.failures.saturating_add(1);

		if window.failures >= self.policy.failure_threshold {
			window.opened_at = Some(Instant::now());
		}
	}

	/// Returns whether the breaker is currently open.
	pub fn is_open(&self) -> bool {
		self.window.lock().opened_at.is_some()
	}
}

/// Breaker states keyed by logical client type.
#[derive(Debug, Default)]
pub struct BreakerRegistry(Mutex<HashMap<String, Arc<BreakerState>>>);
impl BreakerRegistry {
	/// Returns (and creates on demand) the breaker state for a client type.
	pub fn state(&self, client: &str, policy: BreakerPolicy) -> Arc<BreakerState> {
		let mut states = self.0.lock();

		states
			.entry(client.to_owned())
			.or_insert_with(|| Arc::new(BreakerState::new(policy)))
			.clone()
	}
}

/// Circuit breaker guarding one logical client type.
pub struct CircuitBreakerHandler {
	client: String,
	state: Arc<BreakerState>,
}
impl CircuitBreakerHandler {
	/// Creates a breaker handler over shared state.
	pub fn new(client: String, state: Arc<BreakerState>) -> Self {
		Self { client, state }
	}
}
impl Handler for CircuitBreakerHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::Throttling
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			if !self.state.admit() {
				return Err(PipelineError::CircuitOpen { client: self.client.clone() }.into());
			}

			match next.run(request, ctx).await {
				Ok(response) => {
					if response.status().is_server_error() {
						self.state.record_failure();
					} else {
						self.state.record_success();
					}

					Ok(response)
				},
				Err(err) => {
					self.state.record_failure();

					Err(err)
				},
			}
		})
	}
}

/// Hosts currently under a throttle suspension, keyed by host name.
#[derive(Debug, Default)]
pub struct ThrottleRegistry(Mutex<HashMap<String, Instant>>);
impl ThrottleRegistry {
	const DEFAULT_SUSPENSION: std::time::Duration = std::time::Duration::from_secs(30);

	/// Returns the remaining suspension for a host, clearing expired entries.
	pub fn remaining(&self, host: &str) -> Option<std::time::Duration> {
		let mut hosts = self.0.lock();
		let until = hosts.get(host)?;
		let remaining =
			until.checked_duration_since(Instant::now()).filter(|span| !span.is_zero());

		if remaining.is_none() {
			hosts.remove(host);
		}

		remaining
	}

	/// Suspends a host for the hinted duration (or the default).
	pub fn suspend(&self, host: &str, retry_after: Option<Duration>) {
		let span = retry_after
			.and_then(|hint| u64::try_from(hint.whole_seconds()).ok())
			.map(std::time::Duration::from_secs)
			.unwrap_or(Self::DEFAULT_SUSPENSION);

		self.0.lock().insert(host.to_owned(), Instant::now() + span);
	}
}

/// Fails fast against hosts known to be throttling and records new 429s.
///
/// Placed as early as possible in the full chain so a suspended host is
/// rejected before any other work happens.
pub struct TooManyRequestsHandler {
	throttles: Arc<ThrottleRegistry>,
}
impl TooManyRequestsHandler {
	/// Creates a handler over the builder's shared throttle registry.
	pub fn new(throttles: Arc<ThrottleRegistry>) -> Self {
		Self { throttles }
	}
}
impl Handler for TooManyRequestsHandler {
	fn kind(&self) -> HandlerKind {
		HandlerKind::TooManyRequestsShortCircuit
	}

	fn handle<'a>(
		&'a self,
		request: WireRequest,
		ctx: &'a CallContext,
		next: Next<'a>,
	) -> HandlerFuture<'a> {
		Box::pin(async move {
			let host = request.uri().host().unwrap_or_default().to_owned();

			if let Some(remaining) = self.throttles.remaining(&host) {
				return Err(PipelineError::Throttled {
					host,
					retry_after: Duration::try_from(remaining).ok(),
				}
				.into());
			}

			let response = next.run(request, ctx).await?;

			if response.status() == http::StatusCode::TOO_MANY_REQUESTS {
				let retry_after = parse_retry_after(response.headers());

				self.throttles.suspend(&host, retry_after);

				return Err(PipelineError::Throttled { host, retry_after }.into());
			}

			Ok(response)
		})
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn breaker_trips_at_the_threshold_and_admits_a_probe() {
		let policy =
			BreakerPolicy { failure_threshold: 2, cooldown: std::time::Duration::ZERO };
		let state = BreakerState::new(policy);

		assert!(state.admit());

		state.record_failure();

		assert!(!state.is_open());

		state.record_failure();

		assert!(state.is_open());
		// Zero cooldown: the probe is admitted immediately but the breaker
		// stays open until a success is recorded.
		assert!(state.admit());

		state.record_success();

		assert!(!state.is_open());
	}

	#[test]
	fn breaker_stays_closed_across_interleaved_successes() {
		let state = BreakerState::new(BreakerPolicy::default());

		for _ in 0..10 {
			state.record_failure();
			state.record_success();
		}

		assert!(!state.is_open());
	}

	#[test]
	fn registry_shares_state_per_client() {
		let registry = BreakerRegistry::default();
		let first = registry.state("acr", BreakerPolicy::default());
		let second = registry.state("acr", BreakerPolicy::default());

		assert!(Arc::ptr_eq(&first, &second));

		let other = registry.state("service", BreakerPolicy::default());

		assert!(!Arc::ptr_eq(&first, &other));
	}

	#[test]
	fn throttle_suspension_expires() {
		let registry = ThrottleRegistry::default();

		registry.suspend("contoso.azurecr.io", Some(Duration::seconds(0)));

		assert!(registry.remaining("contoso.azurecr.io").is_none());

		registry.suspend("contoso.azurecr.io", Some(Duration::seconds(60)));

		assert!(registry.remaining("contoso.azurecr.io").is_some());
		assert!(registry.remaining("unrelated.example.com").is_none());
	}
}
