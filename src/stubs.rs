use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use crate::messages::{RequestMessage, ResponseMessage};
use crate::transport::{InternalSubscription, MessageBus, Response};
use crate::Error;

/// Message bus that records requests and answers each one with the canned responses.
#[derive(Default)]
pub(crate) struct MessageBusStub {
    pub request_messages: RwLock<Vec<RequestMessage>>,
    pub response_messages: Vec<String>,
    /// Keep response channels open after the canned responses, so waits time out instead of ending.
    hold_open: bool,
    /// Behave like a bus that lost TWS and gave up reconnecting.
    disconnected: bool,
    held: Mutex<Vec<Sender<Response>>>,
}

impl MessageBusStub {
    pub(crate) fn with_responses(response_messages: &[&str]) -> Self {
        MessageBusStub {
            response_messages: response_messages.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Records requests but never answers them.
    pub(crate) fn holding_open() -> Self {
        MessageBusStub {
            hold_open: true,
            ..Default::default()
        }
    }

    pub(crate) fn disconnected() -> Self {
        MessageBusStub {
            disconnected: true,
            ..Default::default()
        }
    }

    fn record(&self, message: &RequestMessage) {
        self.request_messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
    }
}

impl MessageBus for MessageBusStub {
    fn send_request(&self, request_id: i32, message: &RequestMessage) -> Result<InternalSubscription, Error> {
        if self.disconnected {
            return Err(Error::ConnectionReset);
        }
        self.record(message);

        let (sender, receiver) = channel::unbounded();
        for response in &self.response_messages {
            sender
                .send(Ok(ResponseMessage::from_simple(response)))
                .map_err(|e| Error::Simple(e.to_string()))?;
        }

        if self.hold_open {
            self.held.lock().unwrap_or_else(PoisonError::into_inner).push(sender);
        }

        Ok(InternalSubscription::new(receiver, None, Some(request_id)))
    }

    fn cancel_subscription(&self, _request_id: i32, message: &RequestMessage) -> Result<(), Error> {
        self.record(message);
        Ok(())
    }

    fn send_message(&self, message: &RequestMessage) -> Result<(), Error> {
        self.record(message);
        Ok(())
    }

    fn ensure_shutdown(&self) {}

    fn is_connected(&self) -> bool {
        !self.disconnected
    }

    fn await_connection(&self, _timeout: Duration) -> Result<(), Error> {
        if self.disconnected {
            Err(Error::ConnectionFailed)
        } else {
            Ok(())
        }
    }

    fn request_messages(&self) -> Vec<RequestMessage> {
        self.request_messages.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
