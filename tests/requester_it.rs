// crates.io
use httpmock::prelude::*;
// self
use registry_exchange::{
	context::{CallContext, CancellationFlag},
	env::MemorySettings,
	http::{self, Method, StatusCode},
	requester::{Requester, RequesterFactory},
	transport::{CompletionOption, ReqwestTransport, WireRequest},
};
// std
use std::time::Instant;

const SETTINGS_ROOT: &str = "/external-providers/http-requester";

// The mock server presents a self-signed certificate; accept it for tests.
fn insecure_transport() -> ReqwestTransport {
	let client = registry_exchange::reqwest::Client::builder()
		.danger_accept_invalid_certs(true)
		.danger_accept_invalid_hostnames(true)
		.build()
		.expect("Insecure test client should build.");

	ReqwestTransport::with_client(client)
}

fn requester_with(context: CallContext, settings: &MemorySettings) -> Requester {
	RequesterFactory::new(context, settings, "acr")
		.requester(Box::new(insecure_transport()))
}

fn get(server: &MockServer, path: &str) -> WireRequest {
	http::Request::builder()
		.method(Method::GET)
		.uri(server.url(path))
		.body(Vec::new())
		.expect("Fixture request should build.")
}

#[tokio::test]
async fn success_reads_the_body_and_stamps_context_headers() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(GET)
				.path("/v2/")
				.header("accept-language", "en-US")
				.header_exists("x-request-activity-id");
			then.status(200).body("registry says hi");
		})
		.await;
	let requester = requester_with(CallContext::new(), &MemorySettings::default());
	let result =
		requester.send(get(&server, "/v2/"), CompletionOption::ResponseContentRead).await;

	assert!(result.success);
	assert_eq!(result.status, StatusCode::OK);
	assert_eq!(
		result.response.map(|response| response.into_body()),
		Some(b"registry says hi".to_vec())
	);

	mock.assert_async().await;
}

#[tokio::test]
async fn transient_statuses_are_retried_up_to_the_budget() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/v2/");
			then.status(503);
		})
		.await;
	let settings = MemorySettings::default()
		.with(format!("{SETTINGS_ROOT}/max-retry-count"), 2);
	let requester = requester_with(CallContext::new(), &settings);
	let result =
		requester.send(get(&server, "/v2/"), CompletionOption::ResponseContentRead).await;

	// A response, even a throttling one, resolves the pipeline.
	assert!(result.success);
	assert_eq!(result.status, StatusCode::SERVICE_UNAVAILABLE);
	// Initial attempt plus two retries.
	assert_eq!(mock.hits_async().await, 3);
}

#[tokio::test]
async fn headers_read_skips_the_body() {
	let server = MockServer::start_async().await;
	let _mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/v2/");
			then.status(200).body("never buffered");
		})
		.await;
	let requester = requester_with(CallContext::new(), &MemorySettings::default());
	let result =
		requester.send(get(&server, "/v2/"), CompletionOption::ResponseHeadersRead).await;

	assert!(result.success);
	assert!(result.response.is_some_and(|response| response.body().is_empty()));
}

#[tokio::test]
async fn cancelled_context_resolves_as_a_failure() {
	let server = MockServer::start_async().await;
	let mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/v2/");
			then.status(200);
		})
		.await;
	let flag = CancellationFlag::new();

	flag.cancel();

	let requester =
		requester_with(CallContext::new().with_cancellation(flag), &MemorySettings::default());
	let result =
		requester.send(get(&server, "/v2/"), CompletionOption::ResponseContentRead).await;

	assert!(!result.success);
	assert_eq!(result.status, StatusCode::INTERNAL_SERVER_ERROR);
	assert!(result.error_message.is_some());
	assert_eq!(mock.hits_async().await, 0);
}

#[tokio::test]
async fn elapsed_deadline_resolves_as_a_failure_instead_of_hanging() {
	let server = MockServer::start_async().await;
	let _mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/v2/");
			then.status(200).delay(std::time::Duration::from_secs(30));
		})
		.await;
	let requester = requester_with(
		CallContext::new().with_deadline(Instant::now()),
		&MemorySettings::default(),
	);
	let result =
		requester.send(get(&server, "/v2/"), CompletionOption::ResponseContentRead).await;

	assert!(!result.success);
	assert!(result.error_message.is_some());
}

#[tokio::test]
async fn send_simple_always_yields_a_response() {
	let server = MockServer::start_async().await;
	let flag = CancellationFlag::new();

	flag.cancel();

	let requester =
		requester_with(CallContext::new().with_cancellation(flag), &MemorySettings::default());
	let response = requester.send_simple(get(&server, "/v2/")).await;

	assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
	assert!(response.body().is_empty());
}
