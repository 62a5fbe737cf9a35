//! Server version constants for TWS API feature compatibility.
//!
//! Each constant is the minimum server version at which a field or request
//! became part of the protocol. Encoders and decoders consult them to decide
//! which fields to write or expect.

pub const CONTRACT_DATA_CHAIN: i32 = 40;
pub const SEC_ID_TYPE: i32 = 45;
pub const TRADING_CLASS: i32 = 68;
pub const LINKING: i32 = 70;
pub const OPTIONAL_CAPABILITIES: i32 = 72;
pub const MD_SIZE_MULTIPLIER: i32 = 110;
pub const REQ_HEAD_TIMESTAMP: i32 = 118;
pub const AGG_GROUP: i32 = 121;
pub const UNDERLYING_INFO: i32 = 122;
pub const CANCEL_HEADTIMESTAMP: i32 = 123;
pub const SYNT_REALTIME_BARS: i32 = 124;
pub const MARKET_RULES: i32 = 126;
pub const REAL_EXPIRATION_DATE: i32 = 134;
pub const STOCK_TYPE: i32 = 152;
pub const FRACTIONAL_SIZE_SUPPORT: i32 = 163;
pub const SIZE_RULES: i32 = 164;
pub const ADVANCED_ORDER_REJECT: i32 = 166;
pub const WSH_EVENT_DATA_FILTERS_DATE: i32 = 173;
pub const BOND_ISSUERID: i32 = 176;
