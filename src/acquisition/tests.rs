use std::cell::RefCell;
use std::collections::VecDeque;

use pretty_assertions::assert_eq;
use time::macros::datetime;

use super::*;
use crate::market_data::historical::ToDuration;

type Step = Result<Option<BarEvent>, Error>;

// Per request: either the request itself fails, or the stream replays the steps.
enum Script {
    Fail(Error),
    Replay(Vec<Step>),
}

#[derive(Default)]
struct FakeSource {
    scripts: RefCell<VecDeque<Script>>,
    requests: RefCell<Vec<(OffsetDateTime, String)>>,
    // Answers to connection checks, one per window. Connected once exhausted.
    connection: RefCell<VecDeque<Result<(), Error>>>,
    connection_waits: RefCell<Vec<StdDuration>>,
}

impl FakeSource {
    fn new(scripts: Vec<Script>) -> Self {
        FakeSource {
            scripts: RefCell::new(scripts.into()),
            ..Default::default()
        }
    }

    fn with_connection(self, checks: Vec<Result<(), Error>>) -> Self {
        *self.connection.borrow_mut() = checks.into();
        self
    }

    fn requests(&self) -> Vec<(OffsetDateTime, String)> {
        self.requests.borrow().clone()
    }
}

struct FakeStream {
    steps: VecDeque<Step>,
}

impl BarStream for FakeStream {
    fn next_event(&mut self, _timeout: StdDuration) -> Result<Option<BarEvent>, Error> {
        self.steps.pop_front().unwrap_or(Ok(None))
    }
}

impl BarSource for FakeSource {
    type Stream = FakeStream;

    fn request_bars(&self, request: &WindowRequest<'_>) -> Result<FakeStream, Error> {
        self.requests.borrow_mut().push((request.end(), request.duration.to_string()));

        match self.scripts.borrow_mut().pop_front() {
            Some(Script::Fail(e)) => Err(e),
            Some(Script::Replay(steps)) => Ok(FakeStream { steps: steps.into() }),
            None => Ok(FakeStream { steps: VecDeque::new() }),
        }
    }

    fn await_connection(&self, timeout: StdDuration) -> Result<(), Error> {
        self.connection_waits.borrow_mut().push(timeout);
        self.connection.borrow_mut().pop_front().unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct RecordingSink {
    bars: Vec<Bar>,
    finished: usize,
    finish_error: Option<Error>,
}

impl BarSink for RecordingSink {
    fn write_window(&mut self, bars: &[Bar]) -> Result<usize, Error> {
        self.bars.extend_from_slice(bars);
        Ok(bars.len())
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.finished += 1;
        match self.finish_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct FailingSink;

impl BarSink for FailingSink {
    fn write_window(&mut self, _bars: &[Bar]) -> Result<usize, Error> {
        Err(Error::Simple("disk full".into()))
    }
}

fn bar(date: &str, close: f64) -> Bar {
    Bar {
        date: date.into(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        ..Default::default()
    }
}

fn completed(bars: &[Bar]) -> Script {
    let mut steps: Vec<Step> = bars.iter().cloned().map(|b| Ok(Some(BarEvent::Bar(b)))).collect();
    steps.push(Ok(Some(BarEvent::End {
        start: "start".into(),
        end: "end".into(),
    })));
    Script::Replay(steps)
}

fn notice(code: i32, message: &str) -> Notice {
    Notice {
        code,
        message: message.into(),
    }
}

fn errored(code: i32, message: &str) -> Script {
    Script::Replay(vec![Ok(Some(BarEvent::Error(notice(code, message))))])
}

fn two_hours() -> HistoryRequest {
    HistoryRequest::new(
        Contract::futures("MNQ"),
        datetime!(2023-09-23 00:00 UTC),
        datetime!(2023-09-23 02:00 UTC),
    )
}

fn settings() -> AcquisitionSettings {
    AcquisitionSettings {
        wait_ceiling: StdDuration::from_secs(5),
        pause: StdDuration::ZERO,
        reconnect_wait: StdDuration::from_secs(1),
    }
}

#[test]
fn test_plan_windows() {
    let windows = plan_windows(datetime!(2023-09-23 00:00 UTC), datetime!(2023-09-23 02:00 UTC), time::Duration::HOUR).unwrap();

    assert_eq!(
        windows,
        vec![
            Window {
                start: datetime!(2023-09-23 00:00 UTC),
                end: datetime!(2023-09-23 01:00 UTC)
            },
            Window {
                start: datetime!(2023-09-23 01:00 UTC),
                end: datetime!(2023-09-23 02:00 UTC)
            },
        ]
    );
}

#[test]
fn test_plan_windows_clips_last_window() {
    let windows = plan_windows(datetime!(2023-09-23 00:00 UTC), datetime!(2023-09-23 01:30 UTC), time::Duration::HOUR).unwrap();

    assert_eq!(windows.len(), 2);
    assert_eq!(windows[1].start, datetime!(2023-09-23 01:00 UTC));
    assert_eq!(windows[1].end, datetime!(2023-09-23 01:30 UTC));
    assert_eq!(windows[1].length(), time::Duration::minutes(30));
}

#[test]
fn test_plan_windows_empty_range() {
    let start = datetime!(2023-09-23 00:00 UTC);

    assert!(plan_windows(start, start, time::Duration::HOUR).unwrap().is_empty());
    assert!(plan_windows(start, start - time::Duration::HOUR, time::Duration::HOUR).unwrap().is_empty());
}

#[test]
fn test_plan_windows_invalid_size() {
    let start = datetime!(2023-09-23 00:00 UTC);
    let end = datetime!(2023-09-23 02:00 UTC);

    assert!(matches!(plan_windows(start, end, time::Duration::ZERO), Err(Error::InvalidArgument(_))));
    assert!(matches!(
        plan_windows(start, end, time::Duration::milliseconds(500)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        plan_windows(start, end, time::Duration::seconds(i64::from(i32::MAX) + 1)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_window_display() {
    let window = Window {
        start: datetime!(2023-09-23 00:00 UTC),
        end: datetime!(2023-09-23 01:00 UTC),
    };

    assert_eq!(window.to_string(), "2023-09-23 00:00:00 to 2023-09-23 01:00:00");
}

#[test]
fn test_acquire_all_windows_complete() {
    let source = FakeSource::new(vec![
        completed(&[bar("1695427200", 1.0), bar("1695427205", 2.0)]),
        completed(&[bar("1695430800", 3.0)]),
    ]);
    let mut sink: Vec<Bar> = Vec::new();

    let summary = acquire(&source, &two_hours(), &settings(), &mut sink).unwrap();

    assert_eq!(summary.windows_requested, 2);
    assert_eq!(summary.windows_completed, 2);
    assert_eq!(summary.bars_persisted, 3);
    assert!(summary.skipped.is_empty());
    assert_eq!(sink.iter().map(|b| b.close).collect::<Vec<_>>(), vec![1.0, 2.0, 3.0]);

    assert_eq!(
        source.requests(),
        vec![
            (datetime!(2023-09-23 01:00 UTC), "3600 S".to_string()),
            (datetime!(2023-09-23 02:00 UTC), "3600 S".to_string()),
        ]
    );
}

#[test]
fn test_acquire_clipped_window_duration() {
    let source = FakeSource::new(vec![completed(&[]), completed(&[])]);
    let mut request = two_hours();
    request.end = datetime!(2023-09-23 01:15 UTC);

    let summary = acquire(&source, &request, &settings(), &mut Vec::new()).unwrap();

    assert_eq!(summary.windows_completed, 2);
    assert_eq!(summary.bars_persisted, 0);
    assert_eq!(source.requests()[1], (datetime!(2023-09-23 01:15 UTC), 900.seconds().to_string()));
}

#[test]
fn test_acquire_empty_range_sends_nothing() {
    let source = FakeSource::default();
    let mut request = two_hours();
    request.end = request.start;

    let summary = acquire(&source, &request, &settings(), &mut Vec::new()).unwrap();

    assert_eq!(summary, RunSummary::default());
    assert!(source.requests().is_empty());
}

#[test]
fn test_acquire_skips_errored_window() {
    let source = FakeSource::new(vec![
        errored(162, "Historical Market Data Service error message:HMDS query returned no data"),
        completed(&[bar("1695430800", 3.0)]),
    ]);
    let mut sink: Vec<Bar> = Vec::new();

    let summary = acquire(&source, &two_hours(), &settings(), &mut sink).unwrap();

    assert_eq!(summary.windows_requested, 2);
    assert_eq!(summary.windows_completed, 1);
    assert_eq!(summary.windows_errored, 1);
    assert_eq!(sink.len(), 1);

    assert_eq!(summary.skipped.len(), 1);
    assert_eq!(summary.skipped[0].window.start, datetime!(2023-09-23 00:00 UTC));
    match &summary.skipped[0].reason {
        SkipReason::Errored(err) => assert_eq!(err.class, ErrorClass::NoData),
        other => panic!("unexpected reason {other:?}"),
    }
}

#[test]
fn test_acquire_skips_timed_out_window() {
    let source = FakeSource::new(vec![Script::Replay(vec![Ok(Some(BarEvent::Bar(bar("1695427200", 1.0))))]), completed(&[])]);
    let mut sink: Vec<Bar> = Vec::new();

    let summary = acquire(&source, &two_hours(), &settings(), &mut sink).unwrap();

    assert_eq!(summary.windows_timed_out, 1);
    assert_eq!(summary.windows_completed, 1);
    assert_eq!(summary.skipped[0].reason, SkipReason::TimedOut);
    // bars of an incomplete window are discarded
    assert!(sink.is_empty());
}

#[test]
fn test_acquire_continues_after_connection_reset() {
    let source = FakeSource::new(vec![Script::Fail(Error::ConnectionReset), completed(&[bar("1695430800", 3.0)])]);
    let mut sink: Vec<Bar> = Vec::new();

    let summary = acquire(&source, &two_hours(), &settings(), &mut sink).unwrap();

    assert_eq!(summary.windows_errored, 1);
    assert_eq!(summary.windows_completed, 1);
    match &summary.skipped[0].reason {
        SkipReason::Errored(err) => assert_eq!(err.class, ErrorClass::ConnectionReset),
        other => panic!("unexpected reason {other:?}"),
    }
}

#[test]
fn test_acquire_stream_error_is_unexpected() {
    let source = FakeSource::new(vec![
        Script::Replay(vec![Err(Error::UnexpectedEndOfStream)]),
        completed(&[bar("1695430800", 3.0)]),
    ]);

    let summary = acquire(&source, &two_hours(), &settings(), &mut Vec::new()).unwrap();

    assert_eq!(summary.windows_errored, 1);
    match &summary.skipped[0].reason {
        SkipReason::Errored(err) => {
            assert_eq!(err.class, ErrorClass::Unexpected);
            assert_eq!(err.notice.code, -1);
        }
        other => panic!("unexpected reason {other:?}"),
    }
}

#[test]
fn test_acquire_stops_on_shutdown() {
    let source = FakeSource::new(vec![Script::Replay(vec![Err(Error::Shutdown)]), completed(&[])]);

    let result = acquire(&source, &two_hours(), &settings(), &mut Vec::new());

    assert!(matches!(result, Err(Error::Shutdown)));
    assert_eq!(source.requests().len(), 1);
}

#[test]
fn test_acquire_stops_when_connection_fails() {
    let source = FakeSource::new(vec![Script::Fail(Error::ConnectionFailed), completed(&[])]);

    let result = acquire(&source, &two_hours(), &settings(), &mut Vec::new());

    assert!(matches!(result, Err(Error::ConnectionFailed)));
    assert_eq!(source.requests().len(), 1);
}

#[test]
fn test_acquire_waits_for_connection_before_each_window() {
    let source = FakeSource::new(vec![completed(&[bar("1695427200", 1.0)]), completed(&[bar("1695430800", 3.0)])]);

    let summary = acquire(&source, &two_hours(), &settings(), &mut Vec::new()).unwrap();

    assert_eq!(summary.windows_completed, 2);
    assert_eq!(*source.connection_waits.borrow(), vec![StdDuration::from_secs(1); 2]);
}

#[test]
fn test_acquire_stops_when_connection_does_not_return() {
    let source = FakeSource::new(vec![completed(&[bar("1695427200", 1.0)]), completed(&[bar("1695430800", 3.0)])])
        .with_connection(vec![Ok(()), Err(Error::ConnectionFailed)]);
    let mut sink = RecordingSink::default();

    let result = acquire(&source, &two_hours(), &settings(), &mut sink);

    assert!(matches!(result, Err(Error::ConnectionFailed)));
    // the second window is never sent, so it is not lost as a skipped window
    assert_eq!(source.requests().len(), 1);
    assert_eq!(sink.bars.len(), 1);
    assert_eq!(sink.finished, 1);
}

#[test]
fn test_acquire_finishes_sink() {
    let source = FakeSource::new(vec![completed(&[bar("1695427200", 1.0)]), completed(&[])]);
    let mut sink = RecordingSink::default();

    acquire(&source, &two_hours(), &settings(), &mut sink).unwrap();
    assert_eq!(sink.finished, 1);

    let source = FakeSource::new(vec![Script::Fail(Error::Shutdown)]);
    let mut sink = RecordingSink::default();

    assert!(matches!(acquire(&source, &two_hours(), &settings(), &mut sink), Err(Error::Shutdown)));
    assert_eq!(sink.finished, 1);
}

#[test]
fn test_acquire_reports_finish_failure() {
    let source = FakeSource::new(vec![completed(&[bar("1695427200", 1.0)]), completed(&[])]);
    let mut sink = RecordingSink {
        finish_error: Some(Error::Simple("rename failed".into())),
        ..Default::default()
    };

    let result = acquire(&source, &two_hours(), &settings(), &mut sink);

    assert!(matches!(result, Err(Error::Simple(_))));
}

#[test]
fn test_acquire_counts_persistence_failures() {
    let source = FakeSource::new(vec![completed(&[bar("1695427200", 1.0)]), completed(&[bar("1695430800", 3.0)])]);

    let summary = acquire(&source, &two_hours(), &settings(), &mut FailingSink).unwrap();

    assert_eq!(summary.windows_completed, 2);
    assert_eq!(summary.persistence_failures, 2);
    assert_eq!(summary.bars_persisted, 0);
    assert_eq!(summary.skipped[1].reason, SkipReason::NotPersisted("error occurred: disk full".into()));
}

#[test]
fn test_await_window_ignores_warnings() {
    let mut stream = FakeStream {
        steps: vec![
            Ok(Some(BarEvent::Error(notice(2104, "Market data farm connection is OK:usfarm")))),
            Ok(Some(BarEvent::Bar(bar("1695427200", 1.0)))),
            Ok(Some(BarEvent::End {
                start: "start".into(),
                end: "end".into(),
            })),
        ]
        .into(),
    };

    let outcome = await_window(&mut stream, StdDuration::from_secs(5)).unwrap();

    assert_eq!(outcome, WindowOutcome::Completed(vec![bar("1695427200", 1.0)]));
}

#[test]
fn test_await_window_zero_ceiling() {
    let mut stream = FakeStream {
        steps: vec![Ok(Some(BarEvent::Bar(bar("1695427200", 1.0))))].into(),
    };

    assert_eq!(await_window(&mut stream, StdDuration::ZERO).unwrap(), WindowOutcome::TimedOut);
}

#[test]
fn test_classify() {
    assert_eq!(
        ErrorClass::classify(&notice(162, "Historical Market Data Service error message:HMDS query returned no data")),
        ErrorClass::NoData
    );
    assert_eq!(
        ErrorClass::classify(&notice(162, "Historical Market Data Service error message:Historical data request pacing violation")),
        ErrorClass::Pacing
    );
    assert_eq!(
        ErrorClass::classify(&notice(200, "No security definition has been found for the request")),
        ErrorClass::NoSecurityDefinition
    );
    assert_eq!(
        ErrorClass::classify(&notice(354, "Requested market data is not subscribed")),
        ErrorClass::NotSubscribed
    );
    assert_eq!(ErrorClass::classify(&notice(321, "Error validating request")), ErrorClass::Unexpected);
}

#[test]
fn test_summary_display() {
    let summary = RunSummary {
        windows_requested: 2,
        windows_completed: 1,
        windows_timed_out: 1,
        bars_persisted: 720,
        skipped: vec![SkippedWindow {
            window: Window {
                start: datetime!(2023-09-23 01:00 UTC),
                end: datetime!(2023-09-23 02:00 UTC),
            },
            reason: SkipReason::TimedOut,
        }],
        ..Default::default()
    };

    assert_eq!(
        summary.to_string(),
        "windows: 2 requested, 1 completed, 0 errored, 1 timed out\n\
         bars persisted: 720, persistence failures: 0\n  \
         skipped 2023-09-23 01:00:00 to 2023-09-23 02:00:00: timed out"
    );
}

#[test]
fn test_history_request_defaults() {
    let request = two_hours();

    assert_eq!(request.window, time::Duration::HOUR);
    assert_eq!(request.bar_size, BarSize::Sec5);
    assert_eq!(request.what_to_show, WhatToShow::Trades);
    assert_eq!(request.trading_hours, TradingHours::Extended);
    assert_eq!(AcquisitionSettings::default().wait_ceiling, StdDuration::from_secs(60));
    assert_eq!(AcquisitionSettings::default().pause, StdDuration::from_secs(1));
    assert_eq!(AcquisitionSettings::default().reconnect_wait, StdDuration::from_secs(600));
}
