use std::time::Duration;

use anyhow::Context;
use clap::{arg, value_parser, ArgMatches, Command};
use log::info;
use time::macros::{format_description, time};
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use ibkr_history::acquisition::{acquire, AcquisitionSettings, HistoryRequest};
use ibkr_history::client::Client;
use ibkr_history::contracts::{Contract, SecurityType};
use ibkr_history::market_data::historical::{BarSize, WhatToShow};
use ibkr_history::market_data::TradingHours;
use ibkr_history::sink::ParquetSink;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("fetch_bars")
        .version("1.0")
        .about("Fetches historical bars one window at a time and appends them to a Parquet file")
        .arg(arg!(--connection_url <VALUE>).default_value("127.0.0.1:7497"))
        .arg(arg!(--client_id <ID>).value_parser(value_parser!(i32)).default_value("123"))
        .arg(arg!(--symbol <SYMBOL>).default_value("MNQ"))
        .arg(arg!(--security_type <TYPE>).default_value("FUT"))
        .arg(arg!(--exchange <EXCHANGE>).default_value("CME"))
        .arg(arg!(--currency <CURRENCY>).default_value("USD"))
        .arg(arg!(--expiry <YYYYMMDD>).default_value("20241220"))
        .arg(arg!(--start <DATETIME> "range start, YYYY-MM-DD or YYYY-MM-DD HH:MM:SS, UTC").default_value("2023-09-23"))
        .arg(arg!(--end <DATETIME> "range end (exclusive), UTC").default_value("2023-10-23"))
        .arg(arg!(--window <SECONDS>).value_parser(value_parser!(i64)).default_value("3600"))
        .arg(arg!(--bar_size <SIZE>).default_value("5 secs"))
        .arg(arg!(--what_to_show <TYPE>).default_value("TRADES"))
        .arg(arg!(--regular_hours "only bars from regular trading hours"))
        .arg(arg!(--output <PATH>).default_value("all_data.parquet"))
        .arg(arg!(--wait <SECONDS> "per window wait ceiling").value_parser(value_parser!(u64)).default_value("60"))
        .arg(arg!(--pause <SECONDS> "pause between windows").value_parser(value_parser!(f64)).default_value("1"))
        .arg(
            arg!(--reconnect_wait <SECONDS> "how long to wait for a lost connection before stopping")
                .value_parser(value_parser!(u64))
                .default_value("600"),
        )
        .get_matches();

    let connection_url = matches.get_one::<String>("connection_url").expect("connection_url is required");
    let client_id = *matches.get_one::<i32>("client_id").expect("client_id is required");
    let output = matches.get_one::<String>("output").expect("output is required");

    let mut request = HistoryRequest::new(
        extract_contract(&matches)?,
        parse_instant(matches.get_one::<String>("start").expect("start is required"))?,
        parse_instant(matches.get_one::<String>("end").expect("end is required"))?,
    );
    request.window = time::Duration::seconds(*matches.get_one::<i64>("window").expect("window is required"));
    request.bar_size = matches.get_one::<String>("bar_size").expect("bar_size is required").parse::<BarSize>()?;
    request.what_to_show = matches
        .get_one::<String>("what_to_show")
        .expect("what_to_show is required")
        .parse::<WhatToShow>()?;
    if matches.get_flag("regular_hours") {
        request.trading_hours = TradingHours::Regular;
    }

    let settings = AcquisitionSettings {
        wait_ceiling: Duration::from_secs(*matches.get_one::<u64>("wait").expect("wait is required")),
        pause: Duration::try_from_secs_f64(*matches.get_one::<f64>("pause").expect("pause is required"))?,
        reconnect_wait: Duration::from_secs(*matches.get_one::<u64>("reconnect_wait").expect("reconnect_wait is required")),
    };

    let client = Client::connect(connection_url, client_id).with_context(|| format!("could not connect to {connection_url}"))?;
    info!("connected {client:?}");

    let mut sink = ParquetSink::new(output);
    let result = acquire(&client, &request, &settings, &mut sink);

    client.disconnect();

    let summary = result.context("acquisition stopped")?;
    println!("{summary}");
    println!("output: {}", sink.path().display());

    Ok(())
}

fn extract_contract(matches: &ArgMatches) -> anyhow::Result<Contract> {
    let mut contract = Contract::futures(&matches.get_one::<String>("symbol").expect("symbol is required").to_uppercase());
    contract.security_type = matches
        .get_one::<String>("security_type")
        .expect("security_type is required")
        .parse::<SecurityType>()?;
    contract.exchange = matches.get_one::<String>("exchange").expect("exchange is required").clone();
    contract.currency = matches.get_one::<String>("currency").expect("currency is required").clone();
    contract.last_trade_date_or_contract_month = matches.get_one::<String>("expiry").expect("expiry is required").clone();
    contract.include_expired = true;
    Ok(contract)
}

fn parse_instant(text: &str) -> anyhow::Result<OffsetDateTime> {
    if let Ok(date_time) = PrimitiveDateTime::parse(text, format_description!("[year]-[month]-[day] [hour]:[minute]:[second]")) {
        return Ok(date_time.assume_utc());
    }

    let date = Date::parse(text, format_description!("[year]-[month]-[day]")).with_context(|| format!("invalid date: {text}"))?;
    Ok(date.with_time(time!(00:00)).assume_utc())
}
