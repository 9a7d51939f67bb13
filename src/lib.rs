//! Registry token exchange for outbound HTTP—trade directory access tokens for registry refresh
//! tokens through a resilient, environment-aware middleware pipeline built for production.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod context;
pub mod env;
pub mod error;
pub mod evaluator;
pub mod obs;
pub mod pipeline;
pub mod provider;
pub mod request;
pub mod requester;
pub mod transport;

mod _prelude {
	pub use std::{
		collections::{BTreeMap, HashMap},
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::Mutex;
	pub use rand::Rng as _;
	#[cfg(feature = "reqwest")]
	pub use reqwest::{Client as ReqwestClient, Error as ReqwestError};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};
	pub use url::Url;

	pub use crate::error::{Error, Result};
}

pub use http;
#[cfg(feature = "reqwest")] pub use reqwest;
pub use url;
#[cfg(test)] use httpmock as _;
