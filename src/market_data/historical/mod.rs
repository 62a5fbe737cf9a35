//! Historical bars, head timestamps and the request parameters that shape them.

use std::fmt::{self, Display};
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::macros::{format_description, time};
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use time_tz::{OffsetResult, PrimitiveDateTimeExt};

use crate::connection::common::find_time_zone;
use crate::ToField;

pub(crate) mod decoders;
pub(crate) mod encoders;
pub(crate) mod sync;

pub use sync::HistoricalBarStream;


/// Bar describes a historical data bar.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Bar {
    /// The bar's date exactly as sent by TWS: epoch seconds (date format 2), `yyyymmdd` for daily bars,
    /// or `yyyymmdd hh:mm:ss` optionally followed by a time zone name.
    pub date: String,
    /// The bar's open price.
    pub open: f64,
    /// The bar's high price.
    pub high: f64,
    /// The bar's low price.
    pub low: f64,
    /// The bar's close price.
    pub close: f64,
    /// The bar's traded volume if available (only available for TRADES)
    pub volume: f64,
    /// The bar's Weighted Average Price (only available for TRADES)
    pub wap: f64,
    /// The number of trades during the bar's timespan (only available for TRADES)
    pub count: i32,
}

impl Bar {
    /// The bar's start instant in UTC, or None when `date` is in none of the known formats.
    ///
    /// ```
    /// use ibkr_history::market_data::historical::Bar;
    /// use time::macros::datetime;
    ///
    /// let bar = Bar { date: "1695427200".into(), ..Default::default() };
    /// assert_eq!(bar.timestamp(), Some(datetime!(2023-09-23 00:00 UTC)));
    ///
    /// let bar = Bar { date: "not a date".into(), ..Default::default() };
    /// assert_eq!(bar.timestamp(), None);
    /// ```
    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        parse_bar_date(&self.date)
    }
}

fn parse_bar_date(text: &str) -> Option<OffsetDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text.len() == 8 && text.bytes().all(|b| b.is_ascii_digit()) {
        let date = Date::parse(text, format_description!("[year][month][day]")).ok()?;
        return Some(date.with_time(time!(00:00)).assume_utc());
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        let seconds: i64 = text.parse().ok()?;
        return OffsetDateTime::from_unix_timestamp(seconds).ok();
    }

    let format = format_description!("[year][month][day] [hour]:[minute]:[second]");

    // 20230923-01:00:00 is always UTC
    if let Some((date, clock)) = text.split_once('-') {
        let parsed = PrimitiveDateTime::parse(&format!("{date} {clock}"), format).ok()?;
        return Some(parsed.assume_utc());
    }

    let mut parts = text.split_whitespace();
    let (date, clock) = (parts.next()?, parts.next()?);
    let zone: Vec<&str> = parts.collect();

    let parsed = PrimitiveDateTime::parse(&format!("{date} {clock}"), format).ok()?;
    if zone.is_empty() {
        return Some(parsed.assume_utc());
    }

    let time_zone = find_time_zone(&zone.join(" "))?;
    match parsed.assume_timezone(time_zone) {
        OffsetResult::Some(date_time) => Some(date_time.to_offset(time::UtcOffset::UTC)),
        OffsetResult::Ambiguous(earliest, _) => Some(earliest.to_offset(time::UtcOffset::UTC)),
        OffsetResult::None => None,
    }
}

/// Bars received for one historical data request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalData {
    /// Start of the period covered, as sent by TWS.
    pub start: String,
    /// End of the period covered, as sent by TWS.
    pub end: String,
    pub bars: Vec<Bar>,
}

/// Bar size setting of a historical request.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarSize {
    Sec,
    Sec5,
    Sec15,
    Sec30,
    Min,
    Min2,
    Min3,
    Min5,
    Min15,
    Min20,
    Min30,
    Hour,
    Hour2,
    Hour3,
    Hour4,
    Hour8,
    Day,
    Week,
    Month,
}

impl Display for BarSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sec => write!(f, "1 secs"),
            Self::Sec5 => write!(f, "5 secs"),
            Self::Sec15 => write!(f, "15 secs"),
            Self::Sec30 => write!(f, "30 secs"),
            Self::Min => write!(f, "1 min"),
            Self::Min2 => write!(f, "2 mins"),
            Self::Min3 => write!(f, "3 mins"),
            Self::Min5 => write!(f, "5 mins"),
            Self::Min15 => write!(f, "15 mins"),
            Self::Min20 => write!(f, "20 mins"),
            Self::Min30 => write!(f, "30 mins"),
            Self::Hour => write!(f, "1 hour"),
            Self::Hour2 => write!(f, "2 hours"),
            Self::Hour3 => write!(f, "3 hours"),
            Self::Hour4 => write!(f, "4 hours"),
            Self::Hour8 => write!(f, "8 hours"),
            Self::Day => write!(f, "1 day"),
            Self::Week => write!(f, "1 week"),
            Self::Month => write!(f, "1 month"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct BarSizeParseError(String);

impl Display for BarSizeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid bar size: {}", self.0)
    }
}

impl std::error::Error for BarSizeParseError {}

impl FromStr for BarSize {
    type Err = BarSizeParseError;

    /// Accepts both the variant style (`SEC5`, `MIN15`) and the wire style (`5 secs`, `15 mins`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s.to_uppercase().split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "SEC" | "1 SECS" | "1 SEC" => Ok(Self::Sec),
            "SEC5" | "5 SECS" => Ok(Self::Sec5),
            "SEC15" | "15 SECS" => Ok(Self::Sec15),
            "SEC30" | "30 SECS" => Ok(Self::Sec30),
            "MIN" | "1 MIN" => Ok(Self::Min),
            "MIN2" | "2 MINS" => Ok(Self::Min2),
            "MIN3" | "3 MINS" => Ok(Self::Min3),
            "MIN5" | "5 MINS" => Ok(Self::Min5),
            "MIN15" | "15 MINS" => Ok(Self::Min15),
            "MIN20" | "20 MINS" => Ok(Self::Min20),
            "MIN30" | "30 MINS" => Ok(Self::Min30),
            "HOUR" | "1 HOUR" => Ok(Self::Hour),
            "HOUR2" | "2 HOURS" => Ok(Self::Hour2),
            "HOUR3" | "3 HOURS" => Ok(Self::Hour3),
            "HOUR4" | "4 HOURS" => Ok(Self::Hour4),
            "HOUR8" | "8 HOURS" => Ok(Self::Hour8),
            "DAY" | "1 DAY" => Ok(Self::Day),
            "WEEK" | "1 WEEK" => Ok(Self::Week),
            "MONTH" | "1 MONTH" => Ok(Self::Month),
            _ => Err(BarSizeParseError(s.to_string())),
        }
    }
}

impl ToField for BarSize {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

/// How far back from the end instant a request reaches, e.g. `3600 S`.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duration {
    value: i32,
    unit: char,
}

impl Duration {
    pub const SECOND: Self = Self::seconds(1);
    pub const DAY: Self = Self::days(1);
    pub const WEEK: Self = Self::weeks(1);
    pub const MONTH: Self = Self::months(1);
    pub const YEAR: Self = Self::years(1);

    pub const fn seconds(seconds: i32) -> Self {
        Self { value: seconds, unit: 'S' }
    }

    pub const fn days(days: i32) -> Self {
        Self { value: days, unit: 'D' }
    }

    pub const fn weeks(weeks: i32) -> Self {
        Self { value: weeks, unit: 'W' }
    }

    pub const fn months(months: i32) -> Self {
        Self { value: months, unit: 'M' }
    }

    pub const fn years(years: i32) -> Self {
        Self { value: years, unit: 'Y' }
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}

#[derive(Debug, PartialEq)]
pub enum DurationParseError {
    EmptyString,
    MissingDelimiter(String),
    ParseIntError(ParseIntError),
    UnsupportedUnit(String),
}

impl From<ParseIntError> for DurationParseError {
    fn from(err: ParseIntError) -> Self {
        DurationParseError::ParseIntError(err)
    }
}

impl Display for DurationParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DurationParseError::EmptyString => write!(f, "Empty duration string"),
            DurationParseError::ParseIntError(err) => write!(f, "Parse integer error: {err}"),
            DurationParseError::MissingDelimiter(msg) => write!(f, "Missing delimiter: {msg}"),
            DurationParseError::UnsupportedUnit(unit) => write!(f, "Unsupported duration unit: {unit}"),
        }
    }
}

impl std::error::Error for DurationParseError {}

impl FromStr for Duration {
    type Err = DurationParseError;

    fn from_str(val: &str) -> Result<Self, DurationParseError> {
        if val.is_empty() {
            return Err(DurationParseError::EmptyString);
        }

        let upper = val.to_uppercase();
        let Some((value_part, unit_part)) = upper.rsplit_once(' ') else {
            return Err(DurationParseError::MissingDelimiter(val.to_string()));
        };

        let value = value_part.parse::<i32>()?;
        match unit_part {
            "S" => Ok(Self::seconds(value)),
            "D" => Ok(Self::days(value)),
            "W" => Ok(Self::weeks(value)),
            "M" => Ok(Self::months(value)),
            "Y" => Ok(Self::years(value)),
            _ => Err(DurationParseError::UnsupportedUnit(unit_part.to_string())),
        }
    }
}

impl ToField for Duration {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

pub trait ToDuration {
    fn seconds(&self) -> Duration;
    fn days(&self) -> Duration;
    fn weeks(&self) -> Duration;
    fn months(&self) -> Duration;
    fn years(&self) -> Duration;
}

impl ToDuration for i32 {
    fn seconds(&self) -> Duration {
        Duration::seconds(*self)
    }

    fn days(&self) -> Duration {
        Duration::days(*self)
    }

    fn weeks(&self) -> Duration {
        Duration::weeks(*self)
    }

    fn months(&self) -> Duration {
        Duration::months(*self)
    }

    fn years(&self) -> Duration {
        Duration::years(*self)
    }
}

/// The type of data a historical request returns.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WhatToShow {
    #[default]
    Trades,
    MidPoint,
    Bid,
    Ask,
    BidAsk,
    HistoricalVolatility,
    OptionImpliedVolatility,
    FeeRate,
    Schedule,
    AdjustedLast,
}

impl Display for WhatToShow {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Trades => write!(f, "TRADES"),
            Self::MidPoint => write!(f, "MIDPOINT"),
            Self::Bid => write!(f, "BID"),
            Self::Ask => write!(f, "ASK"),
            Self::BidAsk => write!(f, "BID_ASK"),
            Self::HistoricalVolatility => write!(f, "HISTORICAL_VOLATILITY"),
            Self::OptionImpliedVolatility => write!(f, "OPTION_IMPLIED_VOLATILITY"),
            Self::FeeRate => write!(f, "FEE_RATE"),
            Self::Schedule => write!(f, "SCHEDULE"),
            Self::AdjustedLast => write!(f, "ADJUSTED_LAST"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct WhatToShowParseError(String);

impl Display for WhatToShowParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid what to show: {}", self.0)
    }
}

impl std::error::Error for WhatToShowParseError {}

impl FromStr for WhatToShow {
    type Err = WhatToShowParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "TRADES" => Ok(Self::Trades),
            "MIDPOINT" => Ok(Self::MidPoint),
            "BID" => Ok(Self::Bid),
            "ASK" => Ok(Self::Ask),
            "BID_ASK" => Ok(Self::BidAsk),
            "HISTORICAL_VOLATILITY" => Ok(Self::HistoricalVolatility),
            "OPTION_IMPLIED_VOLATILITY" => Ok(Self::OptionImpliedVolatility),
            "FEE_RATE" => Ok(Self::FeeRate),
            "SCHEDULE" => Ok(Self::Schedule),
            "ADJUSTED_LAST" => Ok(Self::AdjustedLast),
            _ => Err(WhatToShowParseError(s.to_string())),
        }
    }
}

impl ToField for WhatToShow {
    fn to_field(&self) -> String {
        self.to_string()
    }
}
