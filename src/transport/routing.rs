//! Decides where the dispatcher sends each inbound message.

use crate::messages::{IncomingMessages, ResponseMessage, WARNING_CODE_RANGE};

/// Request ID TWS uses for errors that are not tied to a request.
pub const UNSPECIFIED_REQUEST_ID: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    /// Deliver to the subscription registered for the request id.
    ByRequestId(i32),
    /// Session level message (account list, next order id) with no waiting request.
    Session(IncomingMessages),
    /// Error message. Routed or logged depending on request id and code.
    Error { request_id: i32, error_code: i32 },
    /// Message type this crate has no consumer for.
    Unhandled(IncomingMessages),
    Shutdown,
}

pub fn determine_routing(message: &ResponseMessage) -> RoutingDecision {
    let message_type = message.message_type();

    if message_type == IncomingMessages::Shutdown {
        return RoutingDecision::Shutdown;
    }

    if message_type == IncomingMessages::Error {
        // message_type, version, request_id, error_code
        let request_id = message.peek_int(2).unwrap_or(UNSPECIFIED_REQUEST_ID);
        let error_code = message.peek_int(3).unwrap_or(0);
        return RoutingDecision::Error { request_id, error_code };
    }

    if let Some(request_id) = message.request_id() {
        return RoutingDecision::ByRequestId(request_id);
    }

    match message_type {
        IncomingMessages::ManagedAccounts | IncomingMessages::NextValidId | IncomingMessages::CurrentTime => RoutingDecision::Session(message_type),
        _ => RoutingDecision::Unhandled(message_type),
    }
}

pub fn is_warning_error(error_code: i32) -> bool {
    WARNING_CODE_RANGE.contains(&error_code)
}
