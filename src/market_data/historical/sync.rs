use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use log::{debug, warn};
use time::OffsetDateTime;

use super::{decoders, encoders, BarSize, Duration, WhatToShow};
use crate::acquisition::{BarEvent, BarStream};
use crate::client::Client;
use crate::contracts::Contract;
use crate::market_data::TradingHours;
use crate::messages::{IncomingMessages, Notice, ResponseMessage};
use crate::transport::common::MAX_RETRIES;
use crate::transport::{InternalSubscription, MessageBus};
use crate::{server_versions, Error};

// Returns the timestamp of earliest available historical data for a contract and data type.
// With a timeout, `None` means no answer arrived in time and the request was cancelled.
pub(crate) fn head_timestamp(
    client: &Client,
    contract: &Contract,
    what_to_show: WhatToShow,
    trading_hours: TradingHours,
    timeout: Option<StdDuration>,
) -> Result<Option<OffsetDateTime>, Error> {
    client.check_server_version(server_versions::REQ_HEAD_TIMESTAMP, "It does not support head time stamp requests.")?;

    for attempt in 0..MAX_RETRIES {
        let request_id = client.next_request_id();
        let request = encoders::encode_request_head_timestamp(request_id, contract, what_to_show, trading_hours)?;
        let subscription = client.send_request(request_id, request)?;

        let response = match timeout {
            Some(timeout) => match subscription.next_timeout(timeout) {
                Some(response) => response,
                None => {
                    warn!("no head timestamp for request {request_id} within {timeout:?}");
                    if client.server_version >= server_versions::CANCEL_HEADTIMESTAMP {
                        client.cancel_request(request_id, encoders::encode_cancel_head_timestamp(request_id)?)?;
                    }
                    return Ok(None);
                }
            },
            None => subscription.next().ok_or(Error::UnexpectedEndOfStream)?,
        };

        match response {
            Ok(mut message) if message.message_type() == IncomingMessages::HeadTimestamp => {
                return Ok(Some(decoders::decode_head_timestamp(&mut message)?));
            }
            Ok(message) if message.message_type() == IncomingMessages::Error => return Err(Error::from(message)),
            Ok(message) => return Err(Error::UnexpectedResponse(message)),
            Err(Error::ConnectionReset) => {
                debug!("connection reset while waiting for head timestamp, retrying (attempt {attempt})");
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::ConnectionReset)
}

// Sends one historical bars request. The stream delivers its bars.
pub(crate) fn historical_bars(
    client: &Client,
    contract: &Contract,
    end_date: Option<OffsetDateTime>,
    duration: Duration,
    bar_size: BarSize,
    what_to_show: WhatToShow,
    trading_hours: TradingHours,
) -> Result<HistoricalBarStream, Error> {
    if !contract.trading_class.is_empty() || contract.contract_id > 0 {
        client.check_server_version(
            server_versions::TRADING_CLASS,
            "It does not support contract_id nor trading class parameters when requesting historical data.",
        )?;
    }

    if what_to_show == WhatToShow::AdjustedLast && end_date.is_some() {
        return Err(Error::InvalidArgument(
            "end_date must be None when requesting WhatToShow::AdjustedLast.".into(),
        ));
    }

    let request_id = client.next_request_id();
    let request = encoders::encode_request_historical_data(
        client.server_version,
        request_id,
        contract,
        end_date,
        duration,
        bar_size,
        what_to_show,
        trading_hours,
        false,
        &[],
    )?;

    let subscription = client.send_request(request_id, request)?;

    Ok(HistoricalBarStream {
        request_id,
        server_version: client.server_version,
        subscription,
        message_bus: Arc::clone(&client.message_bus),
        pending: VecDeque::new(),
    })
}

/// Responses of one historical bars request.
///
/// Bars are delivered first, then [BarEvent::End]. An error reported by TWS for the request
/// arrives as [BarEvent::Error].
pub struct HistoricalBarStream {
    request_id: i32,
    server_version: i32,
    subscription: InternalSubscription,
    message_bus: Arc<dyn MessageBus>,
    pending: VecDeque<BarEvent>,
}

impl HistoricalBarStream {
    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    /// Tells TWS to stop working on the request.
    pub fn cancel(&self) -> Result<(), Error> {
        let message = encoders::encode_cancel_historical_data(self.request_id)?;
        self.message_bus.cancel_subscription(self.request_id, &message)
    }

    fn process(&mut self, mut message: ResponseMessage) -> Result<(), Error> {
        match message.message_type() {
            IncomingMessages::HistoricalData => {
                let data = decoders::decode_historical_data(self.server_version, &mut message)?;
                self.pending.extend(data.bars.into_iter().map(BarEvent::Bar));
                self.pending.push_back(BarEvent::End {
                    start: data.start,
                    end: data.end,
                });
                Ok(())
            }
            IncomingMessages::Error => {
                self.pending.push_back(BarEvent::Error(Notice::from(&message)));
                Ok(())
            }
            _ => Err(Error::UnexpectedResponse(message)),
        }
    }
}

impl BarStream for HistoricalBarStream {
    fn next_event(&mut self, timeout: StdDuration) -> Result<Option<BarEvent>, Error> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }

        match self.subscription.next_timeout(timeout) {
            Some(Ok(message)) => {
                self.process(message)?;
                Ok(self.pending.pop_front())
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for HistoricalBarStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoricalBarStream")
            .field("request_id", &self.request_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}
