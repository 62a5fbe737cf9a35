use time::OffsetDateTime;

use super::{BarSize, Duration, WhatToShow};
use crate::contracts::{Contract, TagValue};
use crate::market_data::TradingHours;
use crate::messages::{OutgoingMessages, RequestMessage};
use crate::{server_versions, Error};

// 1 for yyyyMMdd HH:mm:ss, 2 for system time format in seconds.
pub(crate) const DATE_FORMAT: i32 = 2;

#[allow(clippy::too_many_arguments)]
pub(crate) fn encode_request_historical_data(
    server_version: i32,
    request_id: i32,
    contract: &Contract,
    end_date: Option<OffsetDateTime>,
    duration: Duration,
    bar_size: BarSize,
    what_to_show: WhatToShow,
    trading_hours: TradingHours,
    keep_up_to_date: bool,
    chart_options: &[TagValue],
) -> Result<RequestMessage, Error> {
    const VERSION: i32 = 6;

    let mut message = RequestMessage::new();

    message.push_field(&OutgoingMessages::RequestHistoricalData);
    if server_version < server_versions::SYNT_REALTIME_BARS {
        message.push_field(&VERSION);
    }
    message.push_field(&request_id);

    if server_version >= server_versions::TRADING_CLASS {
        message.push_field(&contract.contract_id);
    }
    message.push_field(&contract.symbol);
    message.push_field(&contract.security_type);
    message.push_field(&contract.last_trade_date_or_contract_month);
    message.push_field(&contract.strike);
    message.push_field(&contract.right);
    message.push_field(&contract.multiplier);
    message.push_field(&contract.exchange);
    message.push_field(&contract.primary_exchange);
    message.push_field(&contract.currency);
    message.push_field(&contract.local_symbol);
    if server_version >= server_versions::TRADING_CLASS {
        message.push_field(&contract.trading_class);
    }
    message.push_field(&contract.include_expired);

    message.push_field(&end_date);
    message.push_field(&bar_size);
    message.push_field(&duration);
    message.push_field(&trading_hours.use_rth());
    message.push_field(&what_to_show);
    message.push_field(&DATE_FORMAT);

    if contract.is_bag() {
        message.push_field(&contract.combo_legs.len());
        for leg in &contract.combo_legs {
            message.push_field(&leg.contract_id);
            message.push_field(&leg.ratio);
            message.push_field(&leg.action);
            message.push_field(&leg.exchange);
        }
    }

    if server_version >= server_versions::SYNT_REALTIME_BARS {
        message.push_field(&keep_up_to_date);
    }

    if server_version >= server_versions::LINKING {
        message.push_field(&encode_tag_values(chart_options));
    }

    Ok(message)
}

fn encode_tag_values(tag_values: &[TagValue]) -> String {
    tag_values.iter().map(|tv| format!("{}={};", tv.tag, tv.value)).collect()
}

pub(crate) fn encode_cancel_historical_data(request_id: i32) -> Result<RequestMessage, Error> {
    const VERSION: i32 = 1;

    let mut message = RequestMessage::new();

    message.push_field(&OutgoingMessages::CancelHistoricalData);
    message.push_field(&VERSION);
    message.push_field(&request_id);

    Ok(message)
}

pub(crate) fn encode_request_head_timestamp(
    request_id: i32,
    contract: &Contract,
    what_to_show: WhatToShow,
    trading_hours: TradingHours,
) -> Result<RequestMessage, Error> {
    let mut message = RequestMessage::new();

    message.push_field(&OutgoingMessages::RequestHeadTimestamp);
    message.push_field(&request_id);
    contract.push_fields(&mut message);
    message.push_field(&trading_hours.use_rth());
    message.push_field(&what_to_show);
    message.push_field(&DATE_FORMAT);

    Ok(message)
}

pub(crate) fn encode_cancel_head_timestamp(request_id: i32) -> Result<RequestMessage, Error> {
    let mut message = RequestMessage::new();

    message.push_field(&OutgoingMessages::CancelHeadTimestamp);
    message.push_field(&request_id);

    Ok(message)
}
