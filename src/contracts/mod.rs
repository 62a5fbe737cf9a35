//! Instrument descriptors and the contract details TWS returns for them.

use std::fmt::{self, Display};
use std::str::FromStr;

use log::warn;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, PrimitiveDateTime};

use crate::messages::RequestMessage;
use crate::{Error, ToField};

pub(crate) mod decoders;
pub(crate) mod encoders;
pub(crate) mod sync;


/// SecurityType enumerates available security types
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityType {
    /// Stock (or ETF)
    #[default]
    Stock,
    Option,
    Future,
    ContinuousFuture,
    Index,
    FuturesOption,
    ForexPair,
    /// Combo
    Spread,
    Warrant,
    Bond,
    Commodity,
    MutualFund,
    Crypto,
    /// Contract for difference
    CFD,
    Other(String),
}

impl ToField for SecurityType {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityType::Stock => write!(f, "STK"),
            SecurityType::Option => write!(f, "OPT"),
            SecurityType::Future => write!(f, "FUT"),
            SecurityType::ContinuousFuture => write!(f, "CONTFUT"),
            SecurityType::Index => write!(f, "IND"),
            SecurityType::FuturesOption => write!(f, "FOP"),
            SecurityType::ForexPair => write!(f, "CASH"),
            SecurityType::Spread => write!(f, "BAG"),
            SecurityType::Warrant => write!(f, "WAR"),
            SecurityType::Bond => write!(f, "BOND"),
            SecurityType::Commodity => write!(f, "CMDTY"),
            SecurityType::MutualFund => write!(f, "FUND"),
            SecurityType::Crypto => write!(f, "CRYPTO"),
            SecurityType::CFD => write!(f, "CFD"),
            SecurityType::Other(name) => write!(f, "{name}"),
        }
    }
}

impl SecurityType {
    pub fn from(name: &str) -> SecurityType {
        match name {
            "STK" => SecurityType::Stock,
            "OPT" => SecurityType::Option,
            "FUT" => SecurityType::Future,
            "CONTFUT" => SecurityType::ContinuousFuture,
            "IND" => SecurityType::Index,
            "FOP" => SecurityType::FuturesOption,
            "CASH" => SecurityType::ForexPair,
            "BAG" => SecurityType::Spread,
            "WAR" => SecurityType::Warrant,
            "BOND" => SecurityType::Bond,
            "CMDTY" => SecurityType::Commodity,
            "FUND" => SecurityType::MutualFund,
            "CRYPTO" => SecurityType::Crypto,
            "CFD" => SecurityType::CFD,
            other => {
                warn!("unknown security type: {other}, keeping it as Other");
                SecurityType::Other(other.to_string())
            }
        }
    }
}

impl FromStr for SecurityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(Error::InvalidArgument("security type must not be empty".into()));
        }
        Ok(SecurityType::from(&s.to_uppercase()))
    }
}

/// Contract describes an instrument's definition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// The unique IB contract identifier.
    pub contract_id: i32,
    /// The underlying's asset symbol.
    pub symbol: String,
    pub security_type: SecurityType,
    /// The contract's last trading day or contract month (for Options and Futures).
    /// Strings with format YYYYMM will be interpreted as the Contract Month whereas YYYYMMDD will be interpreted as Last Trading Day.
    pub last_trade_date_or_contract_month: String,
    /// The option's strike price.
    pub strike: f64,
    /// Either Put or Call (i.e. Options). Valid values are P, PUT, C, CALL.
    pub right: String,
    /// The instrument's multiplier (i.e. options, futures).
    pub multiplier: String,
    /// The destination exchange.
    pub exchange: String,
    /// The underlying's currency.
    pub currency: String,
    /// The contract's symbol within its primary exchange.
    pub local_symbol: String,
    /// The contract's primary exchange. For smart routed contracts, used to define contract in case of ambiguity.
    pub primary_exchange: String,
    /// The trading class name for this contract, e.g. "MNQ".
    pub trading_class: String,
    /// Allows contract details and historical data queries for expired futures contracts.
    pub include_expired: bool,
    /// Security's identifier type when querying contract details, e.g. ISIN or CUSIP.
    pub security_id_type: String,
    pub security_id: String,
    pub combo_legs: Vec<ComboLeg>,
    pub issuer_id: String,
}

impl Contract {
    /// Creates a stock contract from the specified symbol.
    ///
    /// Currency defaults to USD and exchange defaults to SMART.
    ///
    /// ```
    /// use ibkr_history::contracts::Contract;
    ///
    /// let aapl = Contract::stock("AAPL");
    /// assert_eq!(aapl.symbol, "AAPL");
    /// assert_eq!(aapl.exchange, "SMART");
    /// ```
    pub fn stock(symbol: &str) -> Contract {
        Contract {
            symbol: symbol.to_string(),
            security_type: SecurityType::Stock,
            currency: "USD".to_string(),
            exchange: "SMART".to_string(),
            ..Default::default()
        }
    }

    /// Creates a futures contract from the specified symbol. Currency defaults to USD.
    ///
    /// ```
    /// use ibkr_history::contracts::Contract;
    ///
    /// let mut mnq = Contract::futures("MNQ");
    /// mnq.exchange = "CME".into();
    /// mnq.last_trade_date_or_contract_month = "20241220".into();
    /// mnq.include_expired = true;
    /// assert_eq!(mnq.currency, "USD");
    /// ```
    pub fn futures(symbol: &str) -> Contract {
        Contract {
            symbol: symbol.to_string(),
            security_type: SecurityType::Future,
            currency: "USD".to_string(),
            ..Default::default()
        }
    }

    /// Returns true if this contract represents a combo.
    pub fn is_bag(&self) -> bool {
        self.security_type == SecurityType::Spread
    }

    pub(crate) fn push_fields(&self, message: &mut RequestMessage) {
        message.push_field(&self.contract_id);
        message.push_field(&self.symbol);
        message.push_field(&self.security_type);
        message.push_field(&self.last_trade_date_or_contract_month);
        message.push_field(&self.strike);
        message.push_field(&self.right);
        message.push_field(&self.multiplier);
        message.push_field(&self.exchange);
        message.push_field(&self.primary_exchange);
        message.push_field(&self.currency);
        message.push_field(&self.local_symbol);
        message.push_field(&self.trading_class);
        message.push_field(&self.include_expired);
    }
}

/// A leg of a combo contract.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComboLeg {
    pub contract_id: i32,
    /// Relative number of contracts for the leg.
    pub ratio: i32,
    /// BUY or SELL.
    pub action: String,
    pub exchange: String,
}

/// Extended contract details returned by a contract data request.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractDetails {
    /// A fully-defined Contract object.
    pub contract: Contract,
    pub market_name: String,
    /// The minimum allowed price variation.
    pub min_tick: f64,
    pub price_magnifier: i32,
    /// Supported order types for this product.
    pub order_types: Vec<String>,
    /// Valid exchange fields when placing an order for this contract.
    pub valid_exchanges: Vec<String>,
    /// For derivatives, the contract ID of the underlying instrument.
    pub under_contract_id: i32,
    /// Descriptive name of the product.
    pub long_name: String,
    pub contract_month: String,
    pub industry: String,
    pub category: String,
    pub subcategory: String,
    /// The time zone for the trading hours of the product, e.g. US/Central.
    pub time_zone_id: String,
    /// Trading hours, one entry per session, e.g. `20231219:1700-20231220:1600` or `20231221:CLOSED`.
    pub trading_hours: Vec<String>,
    /// Liquid (regular) hours, in the same format as `trading_hours`.
    pub liquid_hours: Vec<String>,
    pub ev_rule: String,
    pub ev_multiplier: f64,
    pub agg_group: i32,
    pub sec_id_list: Vec<TagValue>,
    pub under_symbol: String,
    pub under_security_type: String,
    pub market_rule_ids: Vec<String>,
    pub real_expiration_date: String,
    pub last_trade_time: String,
    pub stock_type: String,
    pub min_size: f64,
    pub size_increment: f64,
    pub suggested_size_increment: f64,
}

impl ContractDetails {
    /// Trading sessions parsed from `trading_hours`. Entries that cannot be parsed are skipped with a warning.
    pub fn trading_periods(&self) -> Vec<TradingPeriod> {
        parse_periods(&self.trading_hours)
    }

    /// Liquid sessions parsed from `liquid_hours`.
    pub fn liquid_periods(&self) -> Vec<TradingPeriod> {
        parse_periods(&self.liquid_hours)
    }
}

fn parse_periods(hours: &[String]) -> Vec<TradingPeriod> {
    hours
        .iter()
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match entry.parse() {
            Ok(period) => Some(period),
            Err(e) => {
                warn!("skipping trading period {entry:?}: {e}");
                None
            }
        })
        .collect()
}

/// TagValue is a convenience struct to define key-value pairs.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct TagValue {
    pub tag: String,
    pub value: String,
}

/// One session from a contract's trading or liquid hours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TradingPeriod {
    Open { start: PrimitiveDateTime, end: PrimitiveDateTime },
    Closed(Date),
}

impl FromStr for TradingPeriod {
    type Err = Error;

    // 20231219:1700-20231220:1600 or 20231221:CLOSED
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(date) = s.strip_suffix(":CLOSED") {
            let date = Date::parse(date, format_description!("[year][month][day]"))?;
            return Ok(TradingPeriod::Closed(date));
        }

        let Some((start, end)) = s.split_once('-') else {
            return Err(Error::Simple(format!("invalid trading period: {s}")));
        };

        let format = format_description!("[year][month][day]:[hour][minute]");
        Ok(TradingPeriod::Open {
            start: PrimitiveDateTime::parse(start, format)?,
            end: PrimitiveDateTime::parse(end, format)?,
        })
    }
}

impl Display for TradingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let date_format = format_description!("[year]-[month]-[day]");
        let time_format = format_description!("[year]-[month]-[day] [hour]:[minute]");

        match self {
            TradingPeriod::Open { start, end } => {
                let start = start.format(time_format).map_err(|_| fmt::Error)?;
                let end = end.format(time_format).map_err(|_| fmt::Error)?;
                write!(f, "{start} - {end}")
            }
            TradingPeriod::Closed(date) => {
                let date = date.format(date_format).map_err(|_| fmt::Error)?;
                write!(f, "{date} CLOSED")
            }
        }
    }
}
