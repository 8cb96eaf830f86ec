mod support;

use std::sync::{Arc, OnceLock, Weak};

use match_core::clock::ManualClock;
use match_core::collaborators::{NotificationDispatcher, NotifyError};
use match_core::engine::{DecisionOutcome, RoundOutcome};
use match_core::test_helpers::{test_config, TEST_START_MS};
use match_core::types::{
    AttemptId, AttemptState, Availability, Decision, DriverId, DriverState, NewRideRequest,
    RequestState, RequestSummary,
};
use match_core::{MatchError, MatchingEngine};
use parking_lot::Mutex;

use support::geography::{north_of_pickup, pickup};
use support::harness::{expect_proposal, harness};

#[test]
fn replayed_decisions_are_no_ops() {
    let h = harness();
    h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    let request = h.submit("rider-a", pickup()).expect("submit");
    let (_, attempt, _) = expect_proposal(&h);

    let first = h
        .engine
        .record_driver_decision(attempt, Decision::Accept)
        .expect("accept");
    let replay = h
        .engine
        .record_driver_decision(attempt, Decision::Accept)
        .expect("replay");
    let contradicting = h
        .engine
        .record_driver_decision(attempt, Decision::Reject)
        .expect("late reject");

    assert_eq!(first, DecisionOutcome::Matched);
    assert_eq!(replay, DecisionOutcome::AlreadyResolved(AttemptState::Accepted));
    assert_eq!(
        contradicting,
        DecisionOutcome::AlreadyResolved(AttemptState::Accepted)
    );
    assert_eq!(h.trips.events().len(), 1);
    assert_eq!(
        h.engine.request(request).map(|r| r.state),
        Some(RequestState::Matched)
    );
    assert_eq!(h.engine.telemetry().replayed_decisions, 2);
}

#[test]
fn unanswered_proposal_times_out_and_moves_on() {
    let h = harness();
    let d1 = h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    let d2 = h.add_driver(2, north_of_pickup(2.0)).expect("d2");
    let request = h.submit("rider-a", pickup()).expect("submit");
    let (_, first, _) = expect_proposal(&h);

    h.advance(h.engine.config().decision_window_ms - 1);
    assert_eq!(h.engine.tick().expect("tick").deadlines_fired, 0);

    h.advance(1);
    let report = h.engine.tick().expect("tick");
    assert_eq!(report.deadlines_fired, 1);
    assert!(matches!(
        report.round,
        Some(RoundOutcome::Proposed { driver, .. }) if driver == d2
    ));

    assert_eq!(
        h.engine.attempt(first).map(|a| a.state),
        Some(AttemptState::TimedOut)
    );
    assert_eq!(h.engine.driver_state(d1), Some(DriverState::Available));
    assert_eq!(h.engine.telemetry().timed_out, 1);
    assert_eq!(h.engine.attempts(request).len(), 2);
}

#[test]
fn a_deadline_fires_once() {
    let h = harness();
    h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    h.submit("rider-a", pickup()).expect("submit");
    expect_proposal(&h);

    h.advance(h.engine.config().decision_window_ms);
    assert_eq!(h.engine.fire_due_deadlines(), 1);
    assert_eq!(h.engine.fire_due_deadlines(), 0);
}

#[test]
fn late_acceptance_is_refused_as_expired() {
    let h = harness();
    let d1 = h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    let request = h.submit("rider-a", pickup()).expect("submit");
    let (_, attempt, _) = expect_proposal(&h);

    h.advance(h.engine.config().decision_window_ms);
    let err = h
        .engine
        .record_driver_decision(attempt, Decision::Accept)
        .expect_err("too late");

    assert!(matches!(
        err,
        MatchError::Expired { attempt: Some(a), .. } if a == attempt
    ));
    assert_eq!(
        h.engine.attempt(attempt).map(|a| a.state),
        Some(AttemptState::TimedOut)
    );
    assert_eq!(
        h.engine.request(request).map(|r| r.state),
        Some(RequestState::Pending)
    );
    assert_eq!(h.engine.driver_state(d1), Some(DriverState::Available));
    assert!(h.trips.events().is_empty());
    // The timer was disarmed along with the attempt.
    assert_eq!(h.engine.fire_due_deadlines(), 0);
}

#[test]
fn driver_going_offline_withdraws_the_proposal() {
    let h = harness();
    let d1 = h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    let d2 = h.add_driver(2, north_of_pickup(2.0)).expect("d2");
    let request = h.submit("rider-a", pickup()).expect("submit");
    let (_, first, _) = expect_proposal(&h);

    let state = h
        .engine
        .update_driver_availability(d1, Availability::Offline)
        .expect("offline");
    assert_eq!(state, DriverState::Offline);
    assert_eq!(
        h.engine.attempt(first).map(|a| a.state),
        Some(AttemptState::Rejected)
    );
    assert_eq!(
        h.engine.request(request).map(|r| r.state),
        Some(RequestState::Pending)
    );

    let (_, _, driver) = expect_proposal(&h);
    assert_eq!(driver, d2);

    // A decision from the withdrawn proposal changes nothing.
    let outcome = h
        .engine
        .record_driver_decision(first, Decision::Accept)
        .expect("stale accept");
    assert_eq!(outcome, DecisionOutcome::AlreadyResolved(AttemptState::Rejected));
    assert_eq!(h.engine.driver_state(d1), Some(DriverState::Offline));
}

#[test]
fn availability_reports_cannot_interrupt_a_trip() {
    let h = harness();
    let d1 = h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    h.submit("rider-a", pickup()).expect("submit");
    let (_, attempt, _) = expect_proposal(&h);
    h.engine
        .record_driver_decision(attempt, Decision::Accept)
        .expect("accept");

    let err = h
        .engine
        .update_driver_availability(d1, Availability::Offline)
        .expect_err("on trip");
    assert!(matches!(err, MatchError::Conflict { .. }));
    assert_eq!(h.engine.driver_state(d1), Some(DriverState::OnTrip(attempt)));
}

#[test]
fn unreachable_driver_is_skipped_within_the_round() {
    let h = harness();
    let d1 = h.add_driver(1, north_of_pickup(1.0)).expect("d1");
    let d2 = h.add_driver(2, north_of_pickup(2.0)).expect("d2");
    h.notifier.fail_for(d1);
    let request = h.submit("rider-a", pickup()).expect("submit");

    let (_, _, driver) = expect_proposal(&h);

    assert_eq!(driver, d2);
    assert_eq!(h.engine.driver_state(d1), Some(DriverState::Available));
    let attempts = h.engine.attempts(request);
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].driver_id, d1);
    assert_eq!(attempts[0].state, AttemptState::Cancelled);
    assert_eq!(attempts[1].state, AttemptState::Proposed);
    assert_eq!(h.engine.telemetry().notification_failures, 1);
}

#[test]
fn unknown_attempts_are_not_found() {
    let h = harness();
    let err = h
        .engine
        .record_driver_decision(AttemptId(999), Decision::Accept)
        .expect_err("unknown");
    assert!(matches!(err, MatchError::NotFound { kind: "attempt", id: 999 }));
}

#[test]
fn repeated_rejections_exhaust_the_request() {
    let h = support::harness::harness_with(
        match_core::test_helpers::test_config().with_retry_limit(1),
    );
    for id in 1..=3 {
        h.add_driver(id, north_of_pickup(id as f64 * 0.5)).expect("driver");
    }
    let request = h.submit("rider-a", pickup()).expect("submit");

    let (_, first, _) = expect_proposal(&h);
    h.engine
        .record_driver_decision(first, Decision::Reject)
        .expect("reject");
    let (_, second, _) = expect_proposal(&h);
    h.engine
        .record_driver_decision(second, Decision::Reject)
        .expect("reject");

    assert_eq!(
        h.engine.request(request).map(|r| r.state),
        Some(RequestState::Expired)
    );
    assert_eq!(h.engine.queue_len(), 0);
    let notices = h.feedback.notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].exhausted);
}

/// Dispatcher whose driver answers before `notify_driver` has returned.
#[derive(Default)]
struct AnsweringNotifier {
    engine: OnceLock<Weak<MatchingEngine>>,
    answers: Mutex<Vec<Result<DecisionOutcome, MatchError>>>,
}

impl NotificationDispatcher for AnsweringNotifier {
    fn notify_driver(
        &self,
        _driver: DriverId,
        attempt: AttemptId,
        _summary: &RequestSummary,
    ) -> Result<(), NotifyError> {
        if let Some(engine) = self.engine.get().and_then(Weak::upgrade) {
            let answer = engine.record_driver_decision(attempt, Decision::Accept);
            self.answers.lock().push(answer);
        }
        Ok(())
    }
}

#[test]
fn answering_inside_the_notification_is_refused_instead_of_blocking() {
    let notifier = Arc::new(AnsweringNotifier::default());
    let engine = Arc::new(
        MatchingEngine::builder(test_config())
            .with_clock(Arc::new(ManualClock::new(TEST_START_MS)))
            .with_notifier(notifier.clone())
            .build()
            .expect("engine"),
    );
    assert!(notifier.engine.set(Arc::downgrade(&engine)).is_ok());
    let driver = DriverId(1);
    engine
        .update_driver_position(driver, north_of_pickup(1.0), TEST_START_MS)
        .expect("position");
    engine
        .update_driver_availability(driver, Availability::Available)
        .expect("available");
    engine
        .submit_request(NewRideRequest::new("rider-a", pickup(), north_of_pickup(4.0)))
        .expect("submit");

    let Some(RoundOutcome::Proposed { attempt, .. }) = engine.tick().expect("tick").round else {
        panic!("expected a proposal");
    };

    let answers = std::mem::take(&mut *notifier.answers.lock());
    assert_eq!(answers.len(), 1);
    assert!(matches!(answers[0], Err(MatchError::Reentrant { .. })));
    assert_eq!(
        engine.attempt(attempt).map(|a| a.state),
        Some(AttemptState::Proposed)
    );

    // Delivered after the notification returned, the same answer applies.
    assert_eq!(
        engine
            .record_driver_decision(attempt, Decision::Accept)
            .expect("accept"),
        DecisionOutcome::Matched
    );
    assert_eq!(engine.driver_state(driver), Some(DriverState::OnTrip(attempt)));
}
