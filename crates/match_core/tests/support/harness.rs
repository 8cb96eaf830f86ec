use match_core::config::MatchingConfig;
use match_core::engine::RoundOutcome;
use match_core::logging::init_logging;
use match_core::test_helpers::{test_config, TestHarness};
use match_core::types::{AttemptId, DriverId, RequestId};

/// Harness with test defaults and logging routed to the test output.
pub fn harness() -> TestHarness {
    harness_with(test_config())
}

pub fn harness_with(config: MatchingConfig) -> TestHarness {
    init_logging("warn");
    TestHarness::new(config).expect("engine should build")
}

/// Tick once and expect a proposal; returns `(request, attempt, driver)`.
pub fn expect_proposal(harness: &TestHarness) -> (RequestId, AttemptId, DriverId) {
    let report = harness.engine.tick().expect("tick");
    match report.round {
        Some(RoundOutcome::Proposed {
            request,
            attempt,
            driver,
        }) => (request, attempt, driver),
        other => panic!("expected a proposal, got {other:?}"),
    }
}

/// Tick until the engine is idle at the current clock reading.
pub fn drain(harness: &TestHarness) {
    harness.engine.run_until_idle(1_000).expect("run");
}
