//! Deployment environment, feature flags, and tunable settings collaborators.
//!
//! All three are read-only inputs consumed by the chain assembler and the
//! requester factory; the crate never writes back to any of them.

// std
use std::ops::BitOr;
// self
use crate::_prelude::*;

/// Feature flag gating the cooperative-scheduling request path.
pub const CONFIGURE_AWAIT_FLAG: &str = "http-pipeline.configure-await";
/// Feature flag gating the too-many-requests short-circuit handler.
pub const TOO_MANY_REQUESTS_FLAG: &str = "http-pipeline.too-many-requests";

/// Deployment environment flags associated with the ambient request context.
///
/// Bit layout follows the upstream execution-environment contract:
/// on-premises `0x1`, dev-fabric `0x2`, cloud `0x4`, ssl-only `0x8`,
/// proxy `0x10`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExecutionEnvironment(u8);
impl ExecutionEnvironment {
	/// No environment flags set.
	pub const NONE: Self = Self(0x0);
	/// On-premises deployment, including the on-premises proxy.
	pub const ON_PREMISES: Self = Self(0x1);
	/// Dev-fabric deployment.
	pub const DEV_FABRIC: Self = Self(0x2);
	/// Cloud deployment.
	pub const CLOUD: Self = Self(0x4);
	/// Only the SSL endpoint should process traffic.
	pub const SSL_ONLY: Self = Self(0x8);
	/// On-premises proxy.
	pub const PROXY: Self = Self(0x10);

	/// Returns `true` when every flag in `other` is set.
	pub const fn contains(self, other: Self) -> bool {
		self.0 & other.0 == other.0
	}

	/// Returns `true` for on-premises deployments.
	pub const fn is_on_premises(self) -> bool {
		self.contains(Self::ON_PREMISES)
	}

	/// Returns `true` for dev-fabric deployments.
	pub const fn is_dev_fabric(self) -> bool {
		self.contains(Self::DEV_FABRIC)
	}

	/// Returns `true` for cloud deployments.
	pub const fn is_cloud(self) -> bool {
		self.contains(Self::CLOUD)
	}

	/// Returns `true` for hosted deployments (cloud or dev-fabric).
	pub const fn is_hosted(self) -> bool {
		self.is_cloud() || self.is_dev_fabric()
	}

	/// Returns `true` for the on-premises proxy.
	pub const fn is_proxy(self) -> bool {
		self.contains(Self::PROXY)
	}

	/// Returns `true` when only the SSL endpoint should process traffic.
	pub const fn is_ssl_only(self) -> bool {
		self.contains(Self::SSL_ONLY)
	}
}
impl BitOr for ExecutionEnvironment {
	type Output = Self;

	fn bitor(self, rhs: Self) -> Self {
		Self(self.0 | rhs.0)
	}
}

/// Boolean feature lookups consumed by the chain assembler.
pub trait FeatureFlags: Send + Sync {
	/// Returns whether the named feature is enabled.
	fn enabled(&self, name: &str) -> bool;
}

/// Feature flag set backed by a static map; unknown flags are disabled.
#[derive(Clone, Debug, Default)]
pub struct StaticFeatureFlags(HashMap<String, bool>);
impl StaticFeatureFlags {
	/// Creates an empty flag set (everything disabled).
	pub fn new() -> Self {
		Self::default()
	}

	/// Enables or disables a named flag.
	pub fn with(mut self, name: impl Into<String>, enabled: bool) -> Self {
		self.0.insert(name.into(), enabled);

		self
	}
}
impl FeatureFlags for StaticFeatureFlags {
	fn enabled(&self, name: &str) -> bool {
		self.0.get(name).copied().unwrap_or(false)
	}
}

/// Read-only typed settings lookup by path, with caller-supplied defaults.
pub trait SettingsStore: Send + Sync {
	/// Returns the integer stored under `path`, or `default` when absent.
	fn integer(&self, path: &str, default: i64) -> i64;
}

/// In-memory settings store used by tests and local setups.
#[derive(Clone, Debug, Default)]
pub struct MemorySettings(HashMap<String, i64>);
impl MemorySettings {
	/// Creates an empty store (every lookup yields its default).
	pub fn new() -> Self {
		Self::default()
	}

	/// Sets a value under the given path.
	pub fn with(mut self, path: impl Into<String>, value: i64) -> Self {
		self.0.insert(path.into(), value);

		self
	}
}
impl SettingsStore for MemorySettings {
	fn integer(&self, path: &str, default: i64) -> i64 {
		self.0.get(path).copied().unwrap_or(default)
	}
}
