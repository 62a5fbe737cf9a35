//! Walks a date range one window at a time.
//!
//! Each window gets exactly one historical bars request. The controller waits on the
//! request's own event stream until it completes, errors or the wait ceiling passes,
//! persists completed windows and then always moves on to the next window. Failed
//! windows are skipped, never retried within a run.

use std::fmt::{self, Display};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use log::{debug, error, info, warn};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::contracts::Contract;
use crate::market_data::historical::{Bar, BarSize, Duration, WhatToShow};
use crate::market_data::TradingHours;
use crate::messages::Notice;
use crate::sink::BarSink;
use crate::Error;

#[cfg(test)]
mod tests;

/// How long to wait for a window before giving up on it.
pub const DEFAULT_WAIT_CEILING: StdDuration = StdDuration::from_secs(60);
/// Pause between consecutive window requests.
pub const DEFAULT_PAUSE: StdDuration = StdDuration::from_secs(1);
/// How long to wait for a lost connection to come back before stopping the run.
pub const DEFAULT_RECONNECT_WAIT: StdDuration = StdDuration::from_secs(600);

/// HMDS query returned no data, or a pacing violation.
pub const NO_DATA_CODE: i32 = 162;
pub const NO_SECURITY_DEFINITION_CODE: i32 = 200;
pub const NOT_SUBSCRIBED_CODE: i32 = 354;

// Code used for window errors raised locally rather than by TWS.
const LOCAL_ERROR_CODE: i32 = -1;

/// Timing of the acquisition loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquisitionSettings {
    pub wait_ceiling: StdDuration,
    pub pause: StdDuration,
    pub reconnect_wait: StdDuration,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        AcquisitionSettings {
            wait_ceiling: DEFAULT_WAIT_CEILING,
            pause: DEFAULT_PAUSE,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
        }
    }
}

/// What to fetch: an instrument, a half-open range `[start, end)` and how to slice it.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoryRequest {
    pub contract: Contract,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    pub window: time::Duration,
    pub bar_size: BarSize,
    pub what_to_show: WhatToShow,
    pub trading_hours: TradingHours,
}

impl HistoryRequest {
    /// One hour windows of 5 second TRADES bars, all trading hours.
    pub fn new(contract: Contract, start: OffsetDateTime, end: OffsetDateTime) -> Self {
        HistoryRequest {
            contract,
            start,
            end,
            window: time::Duration::HOUR,
            bar_size: BarSize::Sec5,
            what_to_show: WhatToShow::Trades,
            trading_hours: TradingHours::Extended,
        }
    }

    /// Splits the range into windows.
    pub fn windows(&self) -> Result<Vec<Window>, Error> {
        plan_windows(self.start, self.end, self.window)
    }

    fn window_request(&self, window: Window) -> WindowRequest<'_> {
        let lookback = i32::try_from(window.length().whole_seconds()).unwrap_or(i32::MAX);

        WindowRequest {
            contract: &self.contract,
            window,
            duration: Duration::seconds(lookback),
            bar_size: self.bar_size,
            what_to_show: self.what_to_show,
            trading_hours: self.trading_hours,
        }
    }
}

/// Half-open interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
}

impl Window {
    pub fn length(&self) -> time::Duration {
        self.end - self.start
    }
}

impl Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        let start = self.start.format(format).map_err(|_| fmt::Error)?;
        let end = self.end.format(format).map_err(|_| fmt::Error)?;
        write!(f, "{start} to {end}")
    }
}

/// Partitions `[start, end)` into consecutive windows of `size`. The last window is clipped to `end`.
///
/// ```
/// use ibkr_history::acquisition::plan_windows;
/// use time::macros::datetime;
///
/// let windows = plan_windows(datetime!(2023-09-23 00:00 UTC), datetime!(2023-09-23 02:00 UTC), time::Duration::HOUR).unwrap();
/// assert_eq!(windows.len(), 2);
/// assert_eq!(windows[1].end, datetime!(2023-09-23 02:00 UTC));
/// ```
pub fn plan_windows(start: OffsetDateTime, end: OffsetDateTime, size: time::Duration) -> Result<Vec<Window>, Error> {
    if size < time::Duration::SECOND {
        return Err(Error::InvalidArgument(format!("window size must be at least one second, got {size}")));
    }
    if size.whole_seconds() > i64::from(i32::MAX) {
        return Err(Error::InvalidArgument(format!("window size too large: {size}")));
    }

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let window_end = (cursor + size).min(end);
        windows.push(Window { start: cursor, end: window_end });
        cursor += size;
    }

    Ok(windows)
}

/// Parameters of the single request issued for one window. Built fresh for every window.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowRequest<'a> {
    pub contract: &'a Contract,
    pub window: Window,
    /// Lookback from the window end, in seconds.
    pub duration: Duration,
    pub bar_size: BarSize,
    pub what_to_show: WhatToShow,
    pub trading_hours: TradingHours,
}

impl WindowRequest<'_> {
    /// The instant the request reaches back from.
    pub fn end(&self) -> OffsetDateTime {
        self.window.end
    }
}

/// What a historical bars request reports back.
#[derive(Clone, Debug, PartialEq)]
pub enum BarEvent {
    Bar(Bar),
    /// All bars have been delivered. `start` and `end` are as reported by TWS.
    End {
        start: String,
        end: String,
    },
    Error(Notice),
}

/// Issues historical bars requests.
pub trait BarSource {
    type Stream: BarStream;

    /// Sends one request. Its events are read from the returned stream.
    fn request_bars(&self, request: &WindowRequest<'_>) -> Result<Self::Stream, Error>;

    /// Blocks until requests can be sent, for at most `timeout`. An error ends the run.
    fn await_connection(&self, _timeout: StdDuration) -> Result<(), Error> {
        Ok(())
    }
}

/// Events of one request.
pub trait BarStream {
    /// Waits up to `timeout` for the next event. `Ok(None)` means the wait timed out.
    fn next_event(&mut self, timeout: StdDuration) -> Result<Option<BarEvent>, Error>;
}

/// Why a window was skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    NoData,
    Pacing,
    NoSecurityDefinition,
    NotSubscribed,
    ConnectionReset,
    Unexpected,
}

impl ErrorClass {
    pub fn classify(notice: &Notice) -> ErrorClass {
        match notice.code {
            NO_DATA_CODE if notice.message.to_lowercase().contains("pacing violation") => ErrorClass::Pacing,
            NO_DATA_CODE => ErrorClass::NoData,
            NO_SECURITY_DEFINITION_CODE => ErrorClass::NoSecurityDefinition,
            NOT_SUBSCRIBED_CODE => ErrorClass::NotSubscribed,
            _ => ErrorClass::Unexpected,
        }
    }
}

impl Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::NoData => "no data",
            ErrorClass::Pacing => "pacing violation",
            ErrorClass::NoSecurityDefinition => "no security definition",
            ErrorClass::NotSubscribed => "not subscribed",
            ErrorClass::ConnectionReset => "connection reset",
            ErrorClass::Unexpected => "unexpected error",
        };
        write!(f, "{name}")
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WindowError {
    pub class: ErrorClass,
    pub notice: Notice,
}

impl WindowError {
    fn from_error(error: &Error) -> WindowError {
        let class = match error {
            Error::ConnectionReset => ErrorClass::ConnectionReset,
            _ => ErrorClass::Unexpected,
        };

        WindowError {
            class,
            notice: Notice {
                code: LOCAL_ERROR_CODE,
                message: error.to_string(),
            },
        }
    }
}

impl From<Notice> for WindowError {
    fn from(notice: Notice) -> Self {
        WindowError {
            class: ErrorClass::classify(&notice),
            notice,
        }
    }
}

impl Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.notice)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WindowOutcome {
    Completed(Vec<Bar>),
    Errored(WindowError),
    TimedOut,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SkipReason {
    Errored(WindowError),
    TimedOut,
    NotPersisted(String),
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Errored(err) => write!(f, "{err}"),
            SkipReason::TimedOut => write!(f, "timed out"),
            SkipReason::NotPersisted(err) => write!(f, "not persisted: {err}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SkippedWindow {
    pub window: Window,
    pub reason: SkipReason,
}

/// Totals of one acquisition run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub windows_requested: usize,
    pub windows_completed: usize,
    pub windows_errored: usize,
    pub windows_timed_out: usize,
    pub bars_persisted: usize,
    pub persistence_failures: usize,
    /// Windows that left a gap in the output, in request order.
    pub skipped: Vec<SkippedWindow>,
}

impl RunSummary {
    fn skip(&mut self, window: Window, reason: SkipReason) {
        self.skipped.push(SkippedWindow { window, reason });
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "windows: {} requested, {} completed, {} errored, {} timed out",
            self.windows_requested, self.windows_completed, self.windows_errored, self.windows_timed_out
        )?;
        write!(f, "bars persisted: {}, persistence failures: {}", self.bars_persisted, self.persistence_failures)?;
        for skipped in &self.skipped {
            write!(f, "\n  skipped {}: {}", skipped.window, skipped.reason)?;
        }
        Ok(())
    }
}

// Errors after which no further window can succeed.
fn is_fatal(error: &Error) -> bool {
    matches!(error, Error::Shutdown | Error::ConnectionFailed)
}

/// Runs the acquisition loop over every window of `request`, handing completed windows to `sink`.
///
/// Per-window failures are skipped and reported in the summary. Only a lost or shut down
/// connection stops the run early and is returned as an error. The sink is finished either way.
pub fn acquire<S, K>(source: &S, request: &HistoryRequest, settings: &AcquisitionSettings, sink: &mut K) -> Result<RunSummary, Error>
where
    S: BarSource,
    K: BarSink + ?Sized,
{
    let result = run_windows(source, request, settings, sink);

    match (result, sink.finish()) {
        (Ok(summary), Ok(())) => {
            info!("{summary}");
            Ok(summary)
        }
        (Ok(_), Err(e)) => {
            error!("could not finish output: {e}");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(finish_err)) => {
            error!("could not finish output after stopping: {finish_err}");
            Err(e)
        }
    }
}

fn run_windows<S, K>(source: &S, request: &HistoryRequest, settings: &AcquisitionSettings, sink: &mut K) -> Result<RunSummary, Error>
where
    S: BarSource,
    K: BarSink + ?Sized,
{
    let windows = request.windows()?;
    let total = windows.len();

    info!(
        "requesting {total} windows of {} for {} from {} to {}",
        request.window, request.contract.symbol, request.start, request.end
    );

    let mut summary = RunSummary::default();

    for (i, window) in windows.into_iter().enumerate() {
        if i > 0 && !settings.pause.is_zero() {
            thread::sleep(settings.pause);
        }

        // Blocks while the transport reconnects.
        if let Err(e) = source.await_connection(settings.reconnect_wait) {
            error!("stopping after {} of {total} windows, connection lost: {e}", summary.windows_requested);
            return Err(e);
        }

        info!("window {}/{total}: {window}", i + 1);
        summary.windows_requested += 1;

        let window_request = request.window_request(window);
        let outcome = match request_window(source, &window_request, settings.wait_ceiling) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("stopping after {} of {total} windows: {e}", summary.windows_requested);
                return Err(e);
            }
        };

        match outcome {
            WindowOutcome::Completed(bars) => {
                summary.windows_completed += 1;
                if bars.is_empty() {
                    info!("window {window} completed without bars");
                }

                match sink.write_window(&bars) {
                    Ok(written) => {
                        debug!("persisted {written} bars for {window}");
                        summary.bars_persisted += written;
                    }
                    Err(e) => {
                        error!("could not persist window {window}: {e}");
                        summary.persistence_failures += 1;
                        summary.skip(window, SkipReason::NotPersisted(e.to_string()));
                    }
                }
            }
            WindowOutcome::Errored(err) => {
                if err.class == ErrorClass::Unexpected {
                    error!("skipping window {window}: {err}");
                } else {
                    warn!("skipping window {window}: {err}");
                }
                summary.windows_errored += 1;
                summary.skip(window, SkipReason::Errored(err));
            }
            WindowOutcome::TimedOut => {
                error!("no response for window {window} within {:?}", settings.wait_ceiling);
                summary.windows_timed_out += 1;
                summary.skip(window, SkipReason::TimedOut);
            }
        }
    }

    Ok(summary)
}

// Sends the window's request and waits for its outcome. The stream is dropped before returning.
fn request_window<S: BarSource>(source: &S, request: &WindowRequest<'_>, ceiling: StdDuration) -> Result<WindowOutcome, Error> {
    match source.request_bars(request) {
        Ok(mut stream) => await_window(&mut stream, ceiling),
        Err(e) if is_fatal(&e) => Err(e),
        Err(e) => Ok(WindowOutcome::Errored(WindowError::from_error(&e))),
    }
}

/// Collects a window's bars until the request ends, errors or `ceiling` elapses.
pub fn await_window<T: BarStream + ?Sized>(stream: &mut T, ceiling: StdDuration) -> Result<WindowOutcome, Error> {
    let deadline = Instant::now() + ceiling;
    let mut bars = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WindowOutcome::TimedOut);
        }

        match stream.next_event(remaining) {
            Ok(Some(BarEvent::Bar(bar))) => bars.push(bar),
            Ok(Some(BarEvent::End { start, end })) => {
                debug!("received {} bars from {start} to {end}", bars.len());
                return Ok(WindowOutcome::Completed(bars));
            }
            Ok(Some(BarEvent::Error(notice))) if notice.is_warning() => {
                warn!("{notice}");
            }
            Ok(Some(BarEvent::Error(notice))) => return Ok(WindowOutcome::Errored(WindowError::from(notice))),
            Ok(None) => return Ok(WindowOutcome::TimedOut),
            Err(e) if is_fatal(&e) => return Err(e),
            Err(e) => return Ok(WindowOutcome::Errored(WindowError::from_error(&e))),
        }
    }
}
