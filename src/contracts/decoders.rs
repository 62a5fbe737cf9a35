use log::debug;

use super::{ContractDetails, SecurityType, TagValue};
use crate::messages::ResponseMessage;
use crate::{server_versions, Error};

pub(crate) fn decode_contract_details(server_version: i32, message: &mut ResponseMessage) -> Result<ContractDetails, Error> {
    message.skip(); // message type

    let mut message_version = 8;
    if server_version < server_versions::SIZE_RULES {
        message_version = message.next_int()?;
    }

    let mut request_id = -1;
    if message_version >= 3 {
        request_id = message.next_int()?;
    }

    debug!("decoding contract details: request_id {request_id}, server_version {server_version}, message_version {message_version}");

    let mut details = ContractDetails::default();

    details.contract.symbol = message.next_string()?;
    details.contract.security_type = SecurityType::from(&message.next_string()?);
    read_last_trade_date(&mut details, &message.next_string()?);
    details.contract.strike = message.next_double()?;
    details.contract.right = message.next_string()?;
    details.contract.exchange = message.next_string()?;
    details.contract.currency = message.next_string()?;
    details.contract.local_symbol = message.next_string()?;
    details.market_name = message.next_string()?;
    details.contract.trading_class = message.next_string()?;
    details.contract.contract_id = message.next_int()?;
    details.min_tick = message.next_double()?;
    if (server_versions::MD_SIZE_MULTIPLIER..server_versions::SIZE_RULES).contains(&server_version) {
        message.skip(); // md size multiplier, no longer used
    }
    details.contract.multiplier = message.next_string()?;
    details.order_types = split_to_vec(&message.next_string()?, ',');
    details.valid_exchanges = split_to_vec(&message.next_string()?, ',');
    if message_version >= 2 {
        details.price_magnifier = message.next_int()?;
    }
    if message_version >= 4 {
        details.under_contract_id = message.next_int()?;
    }
    if message_version >= 5 {
        details.long_name = message.next_string()?;
        details.contract.primary_exchange = message.next_string()?;
    }
    if message_version >= 6 {
        details.contract_month = message.next_string()?;
        details.industry = message.next_string()?;
        details.category = message.next_string()?;
        details.subcategory = message.next_string()?;
        details.time_zone_id = message.next_string()?;
        details.trading_hours = split_to_vec(&message.next_string()?, ';');
        details.liquid_hours = split_to_vec(&message.next_string()?, ';');
    }
    if message_version >= 8 {
        details.ev_rule = message.next_string()?;
        details.ev_multiplier = message.next_double()?;
    }
    if message_version >= 7 {
        let sec_id_list_count = message.next_int()?;
        for _ in 0..sec_id_list_count {
            let tag = message.next_string()?;
            let value = message.next_string()?;
            details.sec_id_list.push(TagValue { tag, value });
        }
    }
    if server_version >= server_versions::AGG_GROUP {
        details.agg_group = message.next_int()?;
    }
    if server_version >= server_versions::UNDERLYING_INFO {
        details.under_symbol = message.next_string()?;
        details.under_security_type = message.next_string()?;
    }
    if server_version >= server_versions::MARKET_RULES {
        details.market_rule_ids = split_to_vec(&message.next_string()?, ',');
    }
    if server_version >= server_versions::REAL_EXPIRATION_DATE {
        details.real_expiration_date = message.next_string()?;
    }
    if server_version >= server_versions::STOCK_TYPE {
        details.stock_type = message.next_string()?;
    }
    if (server_versions::FRACTIONAL_SIZE_SUPPORT..server_versions::SIZE_RULES).contains(&server_version) {
        message.skip(); // size min tick, no longer used
    }
    if server_version >= server_versions::SIZE_RULES {
        details.min_size = message.next_double()?;
        details.size_increment = message.next_double()?;
        details.suggested_size_increment = message.next_double()?;
    }

    Ok(details)
}

// "20241220 08:30 US/Central" or "20241220-08:30"
fn read_last_trade_date(details: &mut ContractDetails, last_trade_date_or_contract_month: &str) {
    if last_trade_date_or_contract_month.is_empty() {
        return;
    }

    let parts: Vec<&str> = if last_trade_date_or_contract_month.contains('-') {
        last_trade_date_or_contract_month.split('-').collect()
    } else {
        last_trade_date_or_contract_month.split_whitespace().collect()
    };

    if let Some(date) = parts.first() {
        details.contract.last_trade_date_or_contract_month = date.to_string();
    }
    if let Some(time) = parts.get(1) {
        details.last_trade_time = time.to_string();
    }
}

fn split_to_vec(value: &str, separator: char) -> Vec<String> {
    value.split(separator).filter(|s| !s.is_empty()).map(String::from).collect()
}
