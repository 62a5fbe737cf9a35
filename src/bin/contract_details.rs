use anyhow::Context;
use clap::{arg, value_parser, ArgMatches, Command};
use log::{debug, info};

use ibkr_history::client::Client;
use ibkr_history::contracts::{Contract, SecurityType};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = command().get_matches();

    let connection_url = matches.get_one::<String>("connection_url").expect("connection_url is required");
    let client_id = *matches.get_one::<i32>("client_id").expect("client_id is required");

    let contract = extract_contract(&matches)?;
    debug!("contract {contract:?}");

    let client = Client::connect(connection_url, client_id).with_context(|| format!("could not connect to {connection_url}"))?;
    info!("connected {client:?}");

    let results = client.contract_details(&contract)?;
    if results.is_empty() {
        println!("no contracts found for {}", contract.symbol);
    }

    for details in &results {
        let contract = &details.contract;
        println!("contract id:    {}", contract.contract_id);
        println!("symbol:         {}", contract.symbol);
        println!("security type:  {}", contract.security_type);
        println!("expiry:         {}", contract.last_trade_date_or_contract_month);
        println!("exchange:       {}", contract.exchange);
        println!("currency:       {}", contract.currency);
        println!("local symbol:   {}", contract.local_symbol);
        println!("long name:      {}", details.long_name);
        println!("multiplier:     {}", contract.multiplier);
        println!("time zone:      {}", details.time_zone_id);

        println!("trading hours:");
        for period in details.trading_periods() {
            println!("  {period}");
        }

        println!("liquid hours:");
        for period in details.liquid_periods() {
            println!("  {period}");
        }
        println!();
    }

    client.disconnect();

    Ok(())
}

fn command() -> Command {
    Command::new("contract_details")
        .version("1.0")
        .about("Looks up contract details and trading hours")
        .arg(arg!(--connection_url <VALUE>).default_value("127.0.0.1:7497"))
        .arg(arg!(--client_id <ID>).value_parser(value_parser!(i32)).default_value("123"))
        .arg(arg!(--symbol <SYMBOL>).default_value("MNQ"))
        .arg(arg!(--security_type <TYPE>).default_value("FUT"))
        .arg(arg!(--exchange <EXCHANGE>).default_value("CME"))
        .arg(arg!(--currency <CURRENCY>).default_value("USD"))
        .arg(arg!(--expiry <YYYYMM> "contract month or expiry").default_value("202312"))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_contract() {
        let matches = command().try_get_matches_from(["contract_details"]).unwrap();

        let contract = extract_contract(&matches).unwrap();

        assert_eq!(contract.symbol, "MNQ");
        assert_eq!(contract.security_type, SecurityType::Future);
        assert_eq!(contract.exchange, "CME");
        assert_eq!(contract.last_trade_date_or_contract_month, "202312");
        assert!(contract.include_expired);
    }
}
