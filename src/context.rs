//! Ambient call context propagated through the pipeline.
//!
//! The context is captured once per requester (from the process-wide request
//! context this crate does not own) and read by every handler. Cancellation is
//! observable at every layer: the flag is checked at context capture and
//! between retry attempts, travels to the transport inside the dispatch
//! envelope, and the pipeline races the in-flight dispatch against
//! [`CancellationFlag::cancelled`] so a canceled call resolves as a failure
//! instead of hanging.

// std
use std::{
	net::IpAddr,
	pin::pin,
	sync::atomic::{AtomicBool, Ordering},
	time::Instant,
};
// crates.io
use tokio::sync::Notify;
// self
use crate::_prelude::*;

/// Relative priority stamped onto outbound requests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RequestPriority {
	/// Below-normal priority.
	Low,
	/// Default priority.
	#[default]
	Normal,
	/// Above-normal priority.
	High,
}
impl RequestPriority {
	/// Returns a stable label suitable for header values.
	pub const fn as_str(self) -> &'static str {
		match self {
			RequestPriority::Low => "low",
			RequestPriority::Normal => "normal",
			RequestPriority::High => "high",
		}
	}
}
impl Display for RequestPriority {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Shared cooperative cancellation flag with an awaitable edge.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<CancellationState>);
impl CancellationFlag {
	/// Creates a flag in the not-canceled state.
	pub fn new() -> Self {
		Self::default()
	}

	/// Marks the flag as canceled and wakes every pending waiter.
	pub fn cancel(&self) {
		self.0.canceled.store(true, Ordering::SeqCst);
		self.0.notify.notify_waiters();
	}

	/// Returns whether the flag was canceled.
	pub fn is_cancelled(&self) -> bool {
		self.0.canceled.load(Ordering::SeqCst)
	}

	/// Resolves once the flag is canceled; resolves immediately when it
	/// already was.
	pub async fn cancelled(&self) {
		while !self.is_cancelled() {
			let mut notified = pin!(self.0.notify.notified());

			// Register the waiter before re-checking the flag so a
			// concurrent `cancel` cannot slip between them unobserved.
			notified.as_mut().enable();

			if self.is_cancelled() {
				return;
			}

			notified.await;
		}
	}
}

#[derive(Debug, Default)]
struct CancellationState {
	canceled: AtomicBool,
	notify: Notify,
}

/// Ambient per-call context read by pipeline handlers.
#[derive(Clone, Debug)]
pub struct CallContext {
	activity_id: String,
	culture: String,
	client_ip: Option<IpAddr>,
	priority: RequestPriority,
	impersonation: Option<String>,
	subject_descriptor: Option<String>,
	access_mapping: Option<String>,
	local_authority: Option<String>,
	bypass_loopback: bool,
	cancellation: CancellationFlag,
	deadline: Option<Instant>,
}
impl CallContext {
	/// Creates a context with a freshly generated activity identifier.
	pub fn new() -> Self {
		let mut rng = rand::rng();
		let activity_id = format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>());

		Self {
			activity_id,
			culture: "en-US".into(),
			client_ip: None,
			priority: RequestPriority::default(),
			impersonation: None,
			subject_descriptor: None,
			access_mapping: None,
			local_authority: None,
			bypass_loopback: false,
			cancellation: CancellationFlag::new(),
			deadline: None,
		}
	}

	/// Overrides the activity identifier.
	pub fn with_activity_id(mut self, activity_id: impl Into<String>) -> Self {
		self.activity_id = activity_id.into();

		self
	}

	/// Overrides the accept-language culture (defaults to `en-US`).
	pub fn with_culture(mut self, culture: impl Into<String>) -> Self {
		self.culture = culture.into();

		self
	}

	/// Sets the originating client IP forwarded for anti-DoS accounting.
	pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
		self.client_ip = Some(ip);

		self
	}

	/// Sets the request priority.
	pub fn with_priority(mut self, priority: RequestPriority) -> Self {
		self.priority = priority;

		self
	}

	/// Sets the impersonated identity.
	pub fn with_impersonation(mut self, identity: impl Into<String>) -> Self {
		self.impersonation = Some(identity.into());

		self
	}

	/// Sets the impersonated subject descriptor.
	pub fn with_subject_descriptor(mut self, descriptor: impl Into<String>) -> Self {
		self.subject_descriptor = Some(descriptor.into());

		self
	}

	/// Sets the client access mapping to preserve across the call.
	pub fn with_access_mapping(mut self, mapping: impl Into<String>) -> Self {
		self.access_mapping = Some(mapping.into());

		self
	}

	/// Sets the authority considered local for loopback routing.
	pub fn with_local_authority(mut self, authority: impl Into<String>) -> Self {
		self.local_authority = Some(authority.into());

		self
	}

	/// Disables loopback handling even on-premises.
	pub fn bypass_loopback(mut self) -> Self {
		self.bypass_loopback = true;

		self
	}

	/// Attaches a shared cancellation flag.
	pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
		self.cancellation = flag;

		self
	}

	/// Sets an absolute deadline for calls made under this context.
	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);

		self
	}

	/// Returns the activity identifier used for trace correlation.
	pub fn activity_id(&self) -> &str {
		&self.activity_id
	}

	/// Returns the accept-language culture.
	pub fn culture(&self) -> &str {
		&self.culture
	}

	/// Returns the originating client IP, when known.
	pub fn client_ip(&self) -> Option<IpAddr> {
		self.client_ip
	}

	/// Returns the request priority.
	pub fn priority(&self) -> RequestPriority {
		self.priority
	}

	/// Returns the impersonated identity, when set.
	pub fn impersonation(&self) -> Option<&str> {
		self.impersonation.as_deref()
	}

	/// Returns the impersonated subject descriptor, when set.
	pub fn subject_descriptor(&self) -> Option<&str> {
		self.subject_descriptor.as_deref()
	}

	/// Returns the client access mapping, when set.
	pub fn access_mapping(&self) -> Option<&str> {
		self.access_mapping.as_deref()
	}

	/// Returns the authority considered local for loopback routing.
	pub fn local_authority(&self) -> Option<&str> {
		self.local_authority.as_deref()
	}

	/// Returns whether loopback handling was bypassed by the root context.
	pub fn is_loopback_bypassed(&self) -> bool {
		self.bypass_loopback
	}

	/// Returns the shared cancellation flag.
	pub fn cancellation(&self) -> &CancellationFlag {
		&self.cancellation
	}

	/// Returns whether the context was canceled.
	pub fn is_cancelled(&self) -> bool {
		self.cancellation.is_cancelled()
	}

	/// Returns the absolute deadline, when one was set.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}
}
impl Default for CallContext {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn cancellation_flag_is_shared() {
		let flag = CancellationFlag::new();
		let ctx = CallContext::new().with_cancellation(flag.clone());

		assert!(!ctx.is_cancelled());

		flag.cancel();

		assert!(ctx.is_cancelled());
	}

	#[tokio::test]
	async fn cancelled_wait_wakes_on_cancel() {
		let flag = CancellationFlag::new();
		let waiter = flag.clone();
		let handle = tokio::spawn(async move { waiter.cancelled().await });

		tokio::time::sleep(std::time::Duration::from_millis(20)).await;
		flag.cancel();
		tokio::time::timeout(std::time::Duration::from_secs(1), handle)
			.await
			.expect("Wait should resolve once the flag is canceled.")
			.expect("Waiter task should not panic.");

		// A late waiter observes the edge immediately.
		flag.cancelled().await;
	}

	#[test]
	fn generated_activity_ids_differ() {
		assert_ne!(CallContext::new().activity_id(), CallContext::new().activity_id());
	}
}
