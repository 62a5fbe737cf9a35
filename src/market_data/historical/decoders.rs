use time::OffsetDateTime;

use super::{Bar, HistoricalData};
use crate::messages::ResponseMessage;
use crate::{server_versions, Error};

pub(crate) fn decode_head_timestamp(message: &mut ResponseMessage) -> Result<OffsetDateTime, Error> {
    message.skip(); // message type
    message.skip(); // request_id

    let head_timestamp = message.next_date_time()?;

    Ok(head_timestamp)
}

pub(crate) fn decode_historical_data(server_version: i32, message: &mut ResponseMessage) -> Result<HistoricalData, Error> {
    message.skip(); // message type

    let mut message_version = i32::MAX;
    if server_version < server_versions::SYNT_REALTIME_BARS {
        message_version = message.next_int()?;
    }

    message.skip(); // request_id

    let mut data = HistoricalData::default();
    if message_version > 2 {
        data.start = message.next_string()?;
        data.end = message.next_string()?;
    }

    let bars_count = message.next_int()?;
    data.bars.reserve(bars_count.max(0) as usize);

    for _ in 0..bars_count {
        let date = message.next_string()?;
        let open = message.next_double()?;
        let high = message.next_double()?;
        let low = message.next_double()?;
        let close = message.next_double()?;
        let volume = message.next_double()?;
        let wap = message.next_double()?;

        if server_version < server_versions::SYNT_REALTIME_BARS {
            message.skip(); // has gaps
        }

        let mut count = -1;
        if message_version >= 3 {
            count = message.next_int()?;
        }

        data.bars.push(Bar {
            date,
            open,
            high,
            low,
            close,
            volume,
            wap,
            count,
        });
    }

    Ok(data)
}
