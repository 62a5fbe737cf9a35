//! Windowed retrieval of historical price bars from Interactive Brokers
//! [TWS](https://interactivebrokers.github.io/tws-api/introduction.html) or IB Gateway.
//!
//! The crate talks the TWS socket protocol directly. A [Client](crate::client::Client)
//! connects, negotiates the server version and then routes every response to the
//! request that asked for it. On top of that the [acquisition](crate::acquisition) module
//! walks a date range one window at a time, waits for each window with a deadline,
//! and hands completed windows to a [BarSink](crate::sink::BarSink) such as the Parquet
//! backed [ParquetSink](crate::sink::ParquetSink).
//!
//!```no_run
//!     use ibkr_history::acquisition::{acquire, AcquisitionSettings, HistoryRequest};
//!     use ibkr_history::client::Client;
//!     use ibkr_history::contracts::Contract;
//!     use ibkr_history::sink::ParquetSink;
//!     use time::macros::datetime;
//!
//!     fn main() -> anyhow::Result<()> {
//!         let client = Client::connect("127.0.0.1:7497", 123)?;
//!
//!         let mut contract = Contract::futures("MNQ");
//!         contract.exchange = "CME".into();
//!         contract.last_trade_date_or_contract_month = "20241220".into();
//!         contract.include_expired = true;
//!
//!         let request = HistoryRequest::new(contract, datetime!(2023-09-23 00:00 UTC), datetime!(2023-10-23 00:00 UTC));
//!         let mut sink = ParquetSink::new("all_data.parquet");
//!
//!         let summary = acquire(&client, &request, &AcquisitionSettings::default(), &mut sink)?;
//!         println!("{summary}");
//!
//!         Ok(())
//!     }
//!```

use time::macros::format_description;
use time::OffsetDateTime;

/// Drives the window by window request/wait/persist cycle.
pub mod acquisition;

/// TWS API Client.
pub mod client;

/// Connection handshake and session metadata.
pub mod connection;

/// A [Contract](crate::contracts::Contract) describes the instrument a request is about.
pub mod contracts;

mod errors;

/// Reads a persisted bar file back for inspection.
pub mod inspect;

/// Historical market data types, encoders and decoders.
pub mod market_data;

pub mod messages;

mod server_versions;

/// Destinations for completed windows.
pub mod sink;

pub(crate) mod transport;

#[cfg(test)]
pub(crate) mod stubs;

pub use errors::Error;

pub(crate) trait ToField {
    fn to_field(&self) -> String;
}

impl ToField for bool {
    fn to_field(&self) -> String {
        if *self {
            String::from("1")
        } else {
            String::from("0")
        }
    }
}

impl ToField for String {
    fn to_field(&self) -> String {
        self.clone()
    }
}

impl ToField for &str {
    fn to_field(&self) -> String {
        <&str>::clone(self).to_string()
    }
}

impl ToField for usize {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for i32 {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for Option<i32> {
    fn to_field(&self) -> String {
        encode_option_field(self)
    }
}

impl ToField for f64 {
    fn to_field(&self) -> String {
        self.to_string()
    }
}

impl ToField for Option<f64> {
    fn to_field(&self) -> String {
        encode_option_field(self)
    }
}

// TWS accepts end instants as "yyyymmdd hh:mm:ss UTC"
impl ToField for Option<OffsetDateTime> {
    fn to_field(&self) -> String {
        match self {
            Some(date_time) => {
                let adjusted = date_time.to_offset(time::UtcOffset::UTC);
                let formatted = adjusted
                    .format(format_description!("[year][month][day] [hour]:[minute]:[second]"))
                    .unwrap_or_default();
                format!("{formatted} UTC")
            }
            None => String::new(),
        }
    }
}

fn encode_option_field<T: ToField>(val: &Option<T>) -> String {
    match val {
        Some(val) => val.to_field(),
        None => String::from(""),
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    pub(crate) fn assert_send_and_sync<T: Send + Sync>() {}

    #[test]
    fn test_send_and_sync() {
        assert_send_and_sync::<client::Client>();
        assert_send_and_sync::<Error>();
    }

    #[test]
    fn test_to_field() {
        assert_eq!(true.to_field(), "1");
        assert_eq!(false.to_field(), "0");
        assert_eq!(Some(5).to_field(), "5");
        assert_eq!(None::<i32>.to_field(), "");
        assert_eq!(3.5.to_field(), "3.5");
    }

    #[test]
    fn test_date_time_to_field() {
        assert_eq!(Some(datetime!(2023-09-23 01:00 UTC)).to_field(), "20230923 01:00:00 UTC");
        assert_eq!(Some(datetime!(2023-09-23 03:00 +02:00)).to_field(), "20230923 01:00:00 UTC");
        assert_eq!(None::<OffsetDateTime>.to_field(), "");
    }
}
