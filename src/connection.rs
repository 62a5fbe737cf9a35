use time::OffsetDateTime;
use time_tz::Tz;

pub(crate) mod common;
pub(crate) mod sync;

/// Session details negotiated while connecting to TWS.
#[derive(Default, Clone, Debug)]
pub struct ConnectionMetadata {
    /// Next valid order id announced by TWS. Not used for historical requests but kept for diagnostics.
    pub next_order_id: i32,
    pub client_id: i32,
    /// Protocol version TWS agreed to speak.
    pub server_version: i32,
    /// Comma-separated list of accounts visible to this session.
    pub managed_accounts: String,
    /// Server time reported in the handshake.
    pub connection_time: Option<OffsetDateTime>,
    /// Time zone TWS reports bar timestamps in.
    pub time_zone: Option<&'static Tz>,
}
