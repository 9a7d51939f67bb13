// self
use crate::obs::{RequestOutcome, RequestStage};

/// Records a stage outcome via the global metrics recorder (when enabled).
pub fn record_request_outcome(stage: RequestStage, outcome: RequestOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"registry_exchange_request_total",
			"stage" => stage.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (stage, outcome);
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn record_request_outcome_noop_without_metrics() {
		record_request_outcome(RequestStage::Dispatch, RequestOutcome::Failure);
	}
}
