//! Handshake and session setup messages.

use log::{debug, error, warn};
use time::macros::format_description;
use time::OffsetDateTime;
use time_tz::{timezones, OffsetResult, PrimitiveDateTimeExt, TimeZone, Tz};

use crate::messages::{encode_length, IncomingMessages, Notice, OutgoingMessages, RequestMessage, ResponseMessage};
use crate::{server_versions, Error};

pub(crate) const MIN_SERVER_VERSION: i32 = 100;
pub(crate) const MAX_SERVER_VERSION: i32 = server_versions::WSH_EVENT_DATA_FILTERS_DATE;

/// Server version and clock reported in reply to the handshake.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HandshakeData {
    pub server_version: i32,
    pub server_time: String,
}

/// Session details collected after `StartApi`.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct AccountInfo {
    pub next_order_id: Option<i32>,
    pub managed_accounts: Option<String>,
}

impl AccountInfo {
    pub(crate) fn merge(&mut self, other: AccountInfo) {
        if other.next_order_id.is_some() {
            self.next_order_id = other.next_order_id;
        }
        if other.managed_accounts.is_some() {
            self.managed_accounts = other.managed_accounts;
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.next_order_id.is_some() && self.managed_accounts.is_some()
    }
}

/// Builds and parses the messages exchanged while a session is being set up.
#[derive(Debug)]
pub(crate) struct ConnectionHandler {
    pub min_version: i32,
    pub max_version: i32,
}

impl Default for ConnectionHandler {
    fn default() -> Self {
        Self {
            min_version: MIN_SERVER_VERSION,
            max_version: MAX_SERVER_VERSION,
        }
    }
}

impl ConnectionHandler {
    /// `API\0` followed by the length prefixed supported version range.
    pub fn format_handshake(&self) -> Result<Vec<u8>, Error> {
        let version_range = format!("v{}..{}", self.min_version, self.max_version);
        debug!("handshake version range: {version_range}");

        let mut handshake = Vec::from(b"API\0".as_slice());
        handshake.extend_from_slice(&encode_length(&version_range)?);
        Ok(handshake)
    }

    pub fn parse_handshake_response(&self, response: &mut ResponseMessage) -> Result<HandshakeData, Error> {
        let server_version = response.next_int()?;
        let server_time = response.next_string()?;

        if server_version < self.min_version {
            return Err(Error::ServerVersion(
                self.min_version,
                server_version,
                "TWS is older than the oldest supported protocol version".into(),
            ));
        }

        Ok(HandshakeData {
            server_version,
            server_time,
        })
    }

    pub fn format_start_api(&self, client_id: i32, server_version: i32) -> RequestMessage {
        const VERSION: i32 = 2;

        let mut message = RequestMessage::new();
        message.push_field(&OutgoingMessages::StartApi);
        message.push_field(&VERSION);
        message.push_field(&client_id);

        // optional capabilities
        if server_version > server_versions::OPTIONAL_CAPABILITIES {
            message.push_field(&"");
        }

        message
    }

    pub fn parse_account_info(&self, message: &mut ResponseMessage) -> Result<AccountInfo, Error> {
        let mut info = AccountInfo::default();

        match message.message_type() {
            IncomingMessages::NextValidId => {
                message.skip(); // message type
                message.skip(); // message version
                info.next_order_id = Some(message.next_int()?);
            }
            IncomingMessages::ManagedAccounts => {
                message.skip(); // message type
                message.skip(); // message version
                info.managed_accounts = Some(message.next_string()?);
            }
            IncomingMessages::Error => {
                let notice = Notice::from(message);
                if notice.is_error() {
                    error!("error while starting session: {notice}");
                } else {
                    debug!("notice while starting session: {notice}");
                }
            }
            kind => {
                warn!("dropping {kind:?} received while starting session");
            }
        }

        Ok(info)
    }
}

/// Parses the server clock from the handshake, e.g. `20230405 22:20:39 PST`.
///
/// Some zone names TWS reports contain spaces, so everything after the time is treated as the zone.
pub(crate) fn parse_connection_time(connection_time: &str) -> (Option<OffsetDateTime>, Option<&'static Tz>) {
    let parts: Vec<&str> = connection_time.splitn(3, ' ').collect();

    if parts.len() < 3 {
        error!("invalid connection time format: {connection_time}");
        return (None, None);
    }

    let Some(timezone) = find_time_zone(parts[2]) else {
        error!("time zone not found for {}", parts[2]);
        return (None, None);
    };

    let format = format_description!("[year][month][day] [hour]:[minute]:[second]");
    let date_str = format!("{} {}", parts[0], parts[1]);

    match time::PrimitiveDateTime::parse(&date_str, format) {
        Ok(connected_at) => match connected_at.assume_timezone(timezone) {
            OffsetResult::Some(date) => (Some(date), Some(timezone)),
            _ => {
                warn!("could not apply time zone {} to {date_str}", timezone.name());
                (None, Some(timezone))
            }
        },
        Err(err) => {
            warn!("could not parse connection time from {date_str}: {err}");
            (None, Some(timezone))
        }
    }
}

pub(crate) fn find_time_zone(name: &str) -> Option<&'static Tz> {
    timezones::find_by_name(iana_name(name)).first().copied()
}

// Maps the Windows style and localized names some gateways report to IANA identifiers.
fn iana_name(name: &str) -> &str {
    match name {
        "Greenwich Mean Time" | "GMT Standard Time" | "British Summer Time" => "Europe/London",
        "Eastern Standard Time" | "Eastern Daylight Time" => "America/New_York",
        "Central Standard Time" | "Central Daylight Time" => "America/Chicago",
        "Pacific Standard Time" | "Pacific Daylight Time" => "America/Los_Angeles",
        "Central European Standard Time" | "Central European Summer Time" => "Europe/Berlin",
        "China Standard Time" | "中国标准时间" | "北京时间" => "Asia/Shanghai",
        // GB2312 names decoded lossily
        _ if name.contains('\u{FFFD}') => "Asia/Shanghai",
        _ => name,
    }
}
