//! Transport primitives for outbound HTTP dispatch.
//!
//! The module exposes [`Transport`] alongside [`ResponseMetadata`] and
//! [`ResponseMetadataSlot`] so downstream crates can integrate custom HTTP
//! stacks without losing the requester's failure-mapping hooks.
//! Implementations call [`ResponseMetadataSlot::take`] before dispatching a
//! request and [`ResponseMetadataSlot::store`] once an HTTP status or retry
//! hint is known, enabling the requester to report a best-effort status code
//! even when the call fails below the HTTP layer.

// std
use std::time::Instant;
// crates.io
use http::{HeaderMap, StatusCode, header::RETRY_AFTER};
use time::format_description::well_known::Rfc2822;
// self
use crate::{_prelude::*, context::CancellationFlag, error::TransportError};

/// Outbound wire request handed to the transport.
pub type WireRequest = http::Request<Vec<u8>>;
/// Wire response produced by the transport.
pub type WireResponse = http::Response<Vec<u8>>;
/// Boxed future returned by [`Transport::dispatch`].
pub type TransportFuture<'a> =
	Pin<Box<dyn Future<Output = Result<WireResponse, TransportError>> + 'a + Send>>;

/// Determines how much of the response the transport buffers before returning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionOption {
	/// Buffer the complete response body.
	#[default]
	ResponseContentRead,
	/// Return once the status and headers are available; the body is left empty.
	ResponseHeadersRead,
}

/// Per-dispatch parameters passed alongside the wire request.
#[derive(Clone, Debug)]
pub struct DispatchEnvelope {
	/// Buffering behavior requested by the caller.
	pub option: CompletionOption,
	/// Slot receiving response metadata for failure mapping.
	pub slot: ResponseMetadataSlot,
	/// Absolute deadline inherited from the call context, if any.
	pub deadline: Option<Instant>,
	/// Cancellation flag inherited from the call context.
	///
	/// Transports whose stack supports aborting an in-flight call should
	/// observe it; the pipeline additionally races the dispatch against
	/// [`CancellationFlag::cancelled`], so a canceled call always resolves
	/// even over a transport that ignores the flag.
	pub cancellation: CancellationFlag,
}

/// Abstraction over HTTP stacks capable of executing one outbound call.
///
/// A transport handle is exclusively owned by the requester that wraps it and
/// is dropped with it; implementations therefore never need interior pooling.
/// The returned future must be `Send` so requester futures can hop executors.
///
/// # Metadata Contract
///
/// - Call [`ResponseMetadataSlot::take`] before submitting the HTTP request so stale information
///   never leaks across retry attempts.
/// - Once a response (successful or erroneous) provides a status, save it with
///   [`ResponseMetadataSlot::store`].
pub trait Transport: Send + Sync {
	/// Executes one outbound call.
	fn dispatch(&self, request: WireRequest, envelope: DispatchEnvelope) -> TransportFuture<'_>;
}

/// Mints fresh transport handles for disposable requesters.
pub trait TransportFactory: Send + Sync {
	/// Returns a transport handle for exactly one requester.
	fn handle(&self) -> Box<dyn Transport>;
}

/// Captures metadata from the most recent HTTP response for failure mapping.
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadata {
	/// HTTP status code observed on the wire, if available.
	pub status: Option<u16>,
	/// Retry-After hint expressed as a relative duration.
	pub retry_after: Option<Duration>,
}

/// Thread-safe slot for sharing [`ResponseMetadata`] between the transport and
/// the requester's failure mapping.
///
/// The requester creates a fresh slot per send and reads the captured metadata
/// after the pipeline resolves; transports borrow the slot just long enough to
/// call [`store`](ResponseMetadataSlot::store).
#[derive(Clone, Debug, Default)]
pub struct ResponseMetadataSlot(Arc<Mutex<Option<ResponseMetadata>>>);
impl ResponseMetadataSlot {
	/// Stores new metadata for the current attempt.
	pub fn store(&self, meta: ResponseMetadata) {
		*self.0.lock() = Some(meta);
	}

	/// Returns the captured metadata, if any, consuming it from the slot.
	pub fn take(&self) -> Option<ResponseMetadata> {
		self.0.lock().take()
	}
}

/// Parses a Retry-After header as either delta-seconds or an HTTP date.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let value = headers.get(RETRY_AFTER)?;
	let raw = value.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(Duration::seconds(secs as i64));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return Some(delta);
		}
	}

	None
}

/// Synthesizes a [`WireResponse`] carrying only a status code.
pub(crate) fn status_only_response(status: StatusCode) -> WireResponse {
	let mut response = WireResponse::new(Vec::new());

	*response.status_mut() = status;

	response
}

/// Thin wrapper around [`ReqwestClient`] so shared HTTP behavior lives in one
/// place. The wrapped client should not follow redirects when used for token
/// exchanges; exchange endpoints return results directly.
#[cfg(feature = "reqwest")]
#[derive(Clone, Default)]
pub struct ReqwestTransport(ReqwestClient);
#[cfg(feature = "reqwest")]
impl ReqwestTransport {
	/// Wraps an existing [`ReqwestClient`].
	pub fn with_client(client: ReqwestClient) -> Self {
		Self(client)
	}
}
#[cfg(feature = "reqwest")]
impl Transport for ReqwestTransport {
	fn dispatch(&self, request: WireRequest, envelope: DispatchEnvelope) -> TransportFuture<'_> {
		let client = self.0.clone();

		Box::pin(async move {
			envelope.slot.take();

			let mut outbound =
				reqwest::Request::try_from(request).map_err(TransportError::from)?;

			if let Some(deadline) = envelope.deadline {
				let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
					return Err(TransportError::DeadlineExceeded);
				};

				*outbound.timeout_mut() = Some(remaining);
			}

			let response = client.execute(outbound).await.map_err(TransportError::from)?;
			let status = response.status();
			let headers = response.headers().to_owned();
			let retry_after = parse_retry_after(&headers);

			envelope.slot.store(ResponseMetadata { status: Some(status.as_u16()), retry_after });

			let body = match envelope.option {
				CompletionOption::ResponseContentRead =>
					response.bytes().await.map_err(TransportError::from)?.to_vec(),
				CompletionOption::ResponseHeadersRead => Vec::new(),
			};
			let mut wire = WireResponse::new(body);

			*wire.status_mut() = status;
			*wire.headers_mut() = headers;

			Ok(wire)
		})
	}
}
#[cfg(feature = "reqwest")]
impl TransportFactory for ReqwestTransport {
	fn handle(&self) -> Box<dyn Transport> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn slot_consumes_metadata_once() {
		let slot = ResponseMetadataSlot::default();

		slot.store(ResponseMetadata { status: Some(503), retry_after: None });

		assert_eq!(slot.take().and_then(|meta| meta.status), Some(503));
		assert!(slot.take().is_none());
	}

	#[test]
	fn retry_after_parses_delta_seconds() {
		let mut headers = HeaderMap::new();

		headers.insert(RETRY_AFTER, http::HeaderValue::from_static("17"));

		assert_eq!(parse_retry_after(&headers), Some(Duration::seconds(17)));
	}

	#[test]
	fn status_only_response_has_empty_body() {
		let response = status_only_response(StatusCode::BAD_GATEWAY);

		assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
		assert!(response.body().is_empty());
	}
}
