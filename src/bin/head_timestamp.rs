use std::time::Duration;

use anyhow::Context;
use clap::{arg, value_parser, ArgMatches, Command};
use log::info;

use ibkr_history::client::Client;
use ibkr_history::contracts::{Contract, SecurityType};
use ibkr_history::market_data::historical::WhatToShow;
use ibkr_history::market_data::TradingHours;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = command().get_matches();

    let connection_url = matches.get_one::<String>("connection_url").expect("connection_url is required");
    let client_id = *matches.get_one::<i32>("client_id").expect("client_id is required");
    let wait = Duration::from_secs(*matches.get_one::<u64>("wait").expect("wait is required"));

    let contract = extract_contract(&matches)?;
    let what_to_show = matches
        .get_one::<String>("what_to_show")
        .expect("what_to_show is required")
        .parse::<WhatToShow>()?;
    let trading_hours = if matches.get_flag("regular_hours") {
        TradingHours::Regular
    } else {
        TradingHours::Extended
    };

    let client = Client::connect(connection_url, client_id).with_context(|| format!("could not connect to {connection_url}"))?;
    info!("connected {client:?}");

    let result = client.head_timestamp_within(&contract, what_to_show, trading_hours, wait);

    client.disconnect();

    match result.context("head timestamp request failed")? {
        Some(timestamp) => println!("earliest available data point for {}: {timestamp}", contract.symbol),
        None => println!("head timestamp not received within {wait:?}"),
    }

    Ok(())
}

fn command() -> Command {
    Command::new("head_timestamp")
        .version("1.0")
        .about("Finds the earliest available data point for a contract")
        .arg(arg!(--connection_url <VALUE>).default_value("127.0.0.1:7497"))
        .arg(arg!(--client_id <ID>).value_parser(value_parser!(i32)).default_value("123"))
        .arg(arg!(--symbol <SYMBOL>).default_value("MNQ"))
        .arg(arg!(--security_type <TYPE>).default_value("FUT"))
        .arg(arg!(--exchange <EXCHANGE>).default_value("CME"))
        .arg(arg!(--currency <CURRENCY>).default_value("USD"))
        .arg(arg!(--local_symbol <SYMBOL>).default_value("MNQZ4"))
        .arg(arg!(--expiry <YYYYMMDD> "contract month or expiry, instead of the local symbol"))
        .arg(arg!(--include_expired "also match expired contracts"))
        .arg(arg!(--what_to_show <TYPE>).default_value("TRADES"))
        .arg(arg!(--regular_hours "only consider regular trading hours"))
        .arg(arg!(--wait <SECONDS>).value_parser(value_parser!(u64)).default_value("60"))
}

// Without an expiry the contract is identified by its local symbol.
fn extract_contract(matches: &ArgMatches) -> anyhow::Result<Contract> {
    let mut contract = Contract::futures(&matches.get_one::<String>("symbol").expect("symbol is required").to_uppercase());
    contract.security_type = matches
        .get_one::<String>("security_type")
        .expect("security_type is required")
        .parse::<SecurityType>()?;
    contract.exchange = matches.get_one::<String>("exchange").expect("exchange is required").clone();
    contract.currency = matches.get_one::<String>("currency").expect("currency is required").clone();
    match matches.get_one::<String>("expiry") {
        Some(expiry) => contract.last_trade_date_or_contract_month = expiry.clone(),
        None => contract.local_symbol = matches.get_one::<String>("local_symbol").expect("local_symbol is required").clone(),
    }
    contract.include_expired = matches.get_flag("include_expired");
    Ok(contract)
}
