use std::sync::Arc;
use std::time::Duration as StdDuration;

use pretty_assertions::assert_eq;
use time::macros::datetime;

use super::Client;
use crate::acquisition::{acquire, AcquisitionSettings, BarEvent, BarSource, BarStream, HistoryRequest};
use crate::contracts::tests::MNQ_CONTRACT_DATA;
use crate::contracts::Contract;
use crate::market_data::historical::tests::HISTORICAL_DATA;
use crate::market_data::historical::{BarSize, ToDuration, WhatToShow};
use crate::market_data::TradingHours;
use crate::messages::Notice;
use crate::server_versions;
use crate::stubs::MessageBusStub;
use crate::transport::MessageBus;
use crate::Error;

const TIMEOUT: StdDuration = StdDuration::from_millis(100);

fn mnq() -> Contract {
    let mut contract = Contract::futures("MNQ");
    contract.exchange = "CME".into();
    contract.last_trade_date_or_contract_month = "20241220".into();
    contract.include_expired = true;
    contract
}

fn stubbed(message_bus: MessageBusStub) -> (Arc<MessageBusStub>, Client) {
    let message_bus = Arc::new(message_bus);
    let client = Client::stubbed(message_bus.clone(), server_versions::WSH_EVENT_DATA_FILTERS_DATE);
    (message_bus, client)
}

fn sent(message_bus: &MessageBusStub) -> Vec<String> {
    message_bus.request_messages().iter().map(|m| m.encode_simple()).collect()
}

#[test]
fn test_request_ids() {
    let (_, client) = stubbed(MessageBusStub::default());

    assert_eq!(client.client_id(), 100);
    assert_eq!(client.next_request_id(), 9000);
    assert_eq!(client.next_request_id(), 9001);
    assert!(client.is_connected());
}

#[test]
fn test_head_timestamp() {
    let (message_bus, client) = stubbed(MessageBusStub::with_responses(&["88|9000|1678323335|"]));

    let timestamp = client.head_timestamp(&mnq(), WhatToShow::Trades, TradingHours::Extended).unwrap();

    assert_eq!(timestamp, datetime!(2023-03-09 00:55:35 UTC));
    assert_eq!(sent(&message_bus), vec!["87|9000|0|MNQ|FUT|20241220|0|||CME||USD|||1|0|TRADES|2|"]);
}

#[test]
fn test_head_timestamp_error() {
    let (_, client) = stubbed(MessageBusStub::with_responses(&[
        "4|2|9000|200|No security definition has been found for the request||",
    ]));

    let err = client.head_timestamp(&mnq(), WhatToShow::Trades, TradingHours::Extended).unwrap_err();

    assert!(matches!(err, Error::Message(200, _)), "{err:?}");
}

#[test]
fn test_head_timestamp_times_out() {
    let (message_bus, client) = stubbed(MessageBusStub::holding_open());

    let timestamp = client
        .head_timestamp_within(&mnq(), WhatToShow::Trades, TradingHours::Regular, TIMEOUT)
        .unwrap();

    assert_eq!(timestamp, None);
    assert_eq!(
        sent(&message_bus),
        vec!["87|9000|0|MNQ|FUT|20241220|0|||CME||USD|||1|1|TRADES|2|", "90|9000|"]
    );
}

#[test]
fn test_head_timestamp_requires_server_version() {
    let message_bus = Arc::new(MessageBusStub::default());
    let client = Client::stubbed(message_bus.clone(), server_versions::MD_SIZE_MULTIPLIER);

    let err = client.head_timestamp(&mnq(), WhatToShow::Trades, TradingHours::Extended).unwrap_err();

    assert!(matches!(err, Error::ServerVersion(server_versions::REQ_HEAD_TIMESTAMP, _, _)), "{err:?}");
    assert!(message_bus.request_messages().is_empty());
}

#[test]
fn test_historical_bars() {
    let (message_bus, client) = stubbed(MessageBusStub::with_responses(&[HISTORICAL_DATA]));

    let mut stream = client
        .historical_bars(
            &mnq(),
            Some(datetime!(2023-09-23 01:00 UTC)),
            3600.seconds(),
            BarSize::Sec5,
            WhatToShow::Trades,
            TradingHours::Extended,
        )
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = stream.next_event(TIMEOUT).unwrap() {
        let done = matches!(event, BarEvent::End { .. });
        events.push(event);
        if done {
            break;
        }
    }

    assert_eq!(events.len(), 3);
    match &events[0] {
        BarEvent::Bar(bar) => {
            assert_eq!(bar.date, "1695427200");
            assert_eq!(bar.open, 14720.25);
            assert_eq!(bar.volume, 52.0);
            assert_eq!(bar.count, 17);
        }
        other => panic!("expected bar, got {other:?}"),
    }
    assert_eq!(
        events[2],
        BarEvent::End {
            start: "20230923  00:00:00".into(),
            end: "20230923  01:00:00".into()
        }
    );

    assert_eq!(
        sent(&message_bus),
        vec!["20|9000|0|MNQ|FUT|20241220|0|||CME||USD|||1|20230923 01:00:00 UTC|5 secs|3600 S|0|TRADES|2|0||"]
    );
}

#[test]
fn test_historical_bars_error_notice() {
    let (_, client) = stubbed(MessageBusStub::with_responses(&[
        "4|2|9000|162|Historical Market Data Service error message:HMDS query returned no data: MNQZ4@CME Trades||",
    ]));

    let mut stream = client
        .historical_bars(&mnq(), None, 3600.seconds(), BarSize::Sec5, WhatToShow::Trades, TradingHours::Extended)
        .unwrap();

    let event = stream.next_event(TIMEOUT).unwrap();

    assert_eq!(
        event,
        Some(BarEvent::Error(Notice {
            code: 162,
            message: "Historical Market Data Service error message:HMDS query returned no data: MNQZ4@CME Trades".into(),
        }))
    );
}

#[test]
fn test_historical_bars_stream_times_out() {
    let (message_bus, client) = stubbed(MessageBusStub::holding_open());

    let mut stream = client
        .historical_bars(&mnq(), None, 3600.seconds(), BarSize::Sec5, WhatToShow::Trades, TradingHours::Extended)
        .unwrap();

    assert_eq!(stream.next_event(TIMEOUT).unwrap(), None);

    stream.cancel().unwrap();
    assert_eq!(sent(&message_bus)[1], "25|1|9000|");
}

#[test]
fn test_historical_bars_unexpected_message() {
    let (_, client) = stubbed(MessageBusStub::with_responses(&["88|9000|1678323335|"]));

    let mut stream = client
        .historical_bars(&mnq(), None, 3600.seconds(), BarSize::Sec5, WhatToShow::Trades, TradingHours::Extended)
        .unwrap();

    assert!(matches!(stream.next_event(TIMEOUT), Err(Error::UnexpectedResponse(_))));
}

#[test]
fn test_historical_bars_rejects_adjusted_last_with_end_date() {
    let (message_bus, client) = stubbed(MessageBusStub::default());

    let result = client.historical_bars(
        &mnq(),
        Some(datetime!(2023-09-23 01:00 UTC)),
        3600.seconds(),
        BarSize::Sec5,
        WhatToShow::AdjustedLast,
        TradingHours::Extended,
    );

    assert!(matches!(result, Err(Error::InvalidArgument(_))));
    assert!(message_bus.request_messages().is_empty());
}

#[test]
fn test_bar_source_requests_window() {
    let (message_bus, client) = stubbed(MessageBusStub::with_responses(&[HISTORICAL_DATA]));

    let request = HistoryRequest::new(mnq(), datetime!(2023-09-23 00:00 UTC), datetime!(2023-09-23 01:00 UTC));
    let windows = request.windows().unwrap();
    let window_request = crate::acquisition::WindowRequest {
        contract: &request.contract,
        window: windows[0],
        duration: 3600.seconds(),
        bar_size: request.bar_size,
        what_to_show: request.what_to_show,
        trading_hours: request.trading_hours,
    };

    let mut stream = client.request_bars(&window_request).unwrap();

    assert!(matches!(stream.next_event(TIMEOUT).unwrap(), Some(BarEvent::Bar(_))));
    assert_eq!(
        sent(&message_bus),
        vec!["20|9000|0|MNQ|FUT|20241220|0|||CME||USD|||1|20230923 01:00:00 UTC|5 secs|3600 S|0|TRADES|2|0||"]
    );
}

#[test]
fn test_acquire_without_connection_sends_nothing() {
    let (message_bus, client) = stubbed(MessageBusStub::disconnected());
    let request = HistoryRequest::new(mnq(), datetime!(2023-09-23 00:00 UTC), datetime!(2023-09-23 02:00 UTC));

    let result = acquire(&client, &request, &AcquisitionSettings::default(), &mut Vec::new());

    assert!(matches!(result, Err(Error::ConnectionFailed)), "{result:?}");
    assert!(!client.is_connected());
    assert!(message_bus.request_messages().is_empty());
}

#[test]
fn test_contract_details() {
    let (message_bus, client) = stubbed(MessageBusStub::with_responses(&[MNQ_CONTRACT_DATA, "52|1|9000|"]));

    let details = client.contract_details(&mnq()).unwrap();

    assert_eq!(details.len(), 1);
    assert_eq!(details[0].contract.symbol, "MNQ");
    assert_eq!(details[0].contract.local_symbol, "MNQZ4");
    assert_eq!(details[0].contract.contract_id, 711280073);
    assert_eq!(details[0].time_zone_id, "US/Central");
    assert_eq!(sent(&message_bus), vec!["9|8|9000|0|MNQ|FUT|20241220|0|||CME||USD|||1|||"]);
}

#[test]
fn test_contract_details_error() {
    let (_, client) = stubbed(MessageBusStub::with_responses(&[
        "4|2|9000|200|No security definition has been found for the request||",
    ]));

    let err = client.contract_details(&mnq()).unwrap_err();

    assert!(matches!(err, Error::Message(200, _)), "{err:?}");
}

#[test]
fn test_contract_details_requires_server_version() {
    let message_bus = Arc::new(MessageBusStub::default());
    let client = Client::stubbed(message_bus, server_versions::SEC_ID_TYPE);

    let mut contract = mnq();
    contract.trading_class = "MNQ".into();

    let err = client.contract_details(&contract).unwrap_err();

    assert!(matches!(err, Error::ServerVersion(server_versions::TRADING_CLASS, _, _)), "{err:?}");
}
