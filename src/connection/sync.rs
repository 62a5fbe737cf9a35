//! Blocking connection to TWS: handshake, session start and reconnection.

use std::sync::Mutex;

use log::{debug, info, warn};

use super::common::{parse_connection_time, AccountInfo, ConnectionHandler};
use super::ConnectionMetadata;
use crate::messages::{encode_length, RequestMessage, ResponseMessage};
use crate::transport::common::{FibonacciBackoff, MAX_BACKOFF_SECONDS, MAX_RETRIES};
use crate::transport::recorder::MessageRecorder;
use crate::transport::sync::Stream;
use crate::transport::Response;
use crate::Error;

// Messages read while waiting for the account list and next order id.
const MAX_SETUP_MESSAGES: i32 = 100;

#[derive(Debug)]
pub(crate) struct Connection<S: Stream> {
    pub(crate) client_id: i32,
    pub(crate) socket: S,
    pub(crate) connection_metadata: Mutex<ConnectionMetadata>,
    pub(crate) max_retries: i32,
    pub(crate) recorder: MessageRecorder,
    pub(crate) connection_handler: ConnectionHandler,
}

impl<S: Stream> Connection<S> {
    /// Wraps the socket and runs the handshake.
    pub fn connect(socket: S, client_id: i32) -> Result<Self, Error> {
        let connection = Self::with_recorder(socket, client_id, MessageRecorder::from_env());
        connection.establish_connection()?;
        Ok(connection)
    }

    fn with_recorder(socket: S, client_id: i32, recorder: MessageRecorder) -> Self {
        Self {
            client_id,
            socket,
            connection_metadata: Mutex::new(ConnectionMetadata {
                client_id,
                ..Default::default()
            }),
            max_retries: MAX_RETRIES,
            recorder,
            connection_handler: ConnectionHandler::default(),
        }
    }

    pub fn connection_metadata(&self) -> ConnectionMetadata {
        match self.connection_metadata.lock() {
            Ok(metadata) => metadata.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn server_version(&self) -> i32 {
        self.connection_metadata().server_version
    }

    /// Reopens the socket and repeats the session setup, backing off between attempts.
    pub fn reconnect(&self) -> Result<(), Error> {
        let mut backoff = FibonacciBackoff::new(MAX_BACKOFF_SECONDS);

        for attempt in 1..=self.max_retries {
            let next_delay = backoff.next_delay();
            info!("next reconnection attempt in {next_delay:#?}");

            self.socket.sleep(next_delay);

            match self.socket.reconnect() {
                Ok(_) => {
                    info!("socket reopened, restarting session");
                    self.establish_connection()?;
                    return Ok(());
                }
                Err(e) => {
                    warn!("reconnection attempt {attempt}/{} failed: {e}", self.max_retries);
                }
            }
        }

        Err(Error::ConnectionFailed)
    }

    pub(crate) fn establish_connection(&self) -> Result<(), Error> {
        self.handshake()?;
        self.start_api()?;
        self.receive_account_info()?;
        Ok(())
    }

    pub(crate) fn write_message(&self, message: &RequestMessage) -> Result<(), Error> {
        self.recorder.record_request(message);

        let encoded = message.encode();
        debug!("-> {encoded:?}");

        let packet = encode_length(&encoded)?;
        self.socket.write_all(&packet)?;
        Ok(())
    }

    pub(crate) fn read_message(&self) -> Response {
        let data = self.socket.read_message()?;
        // Some gateways send zone names in legacy code pages.
        let raw_string = String::from_utf8_lossy(&data).into_owned();
        debug!("<- {raw_string:?}");

        let message = ResponseMessage::from(&raw_string);
        self.recorder.record_response(&message);

        Ok(message)
    }

    // Sends the supported version range and records the negotiated version and server clock.
    pub(crate) fn handshake(&self) -> Result<(), Error> {
        let handshake = self.connection_handler.format_handshake()?;
        debug!("-> handshake: {handshake:?}");

        self.socket.write_all(&handshake)?;

        let mut response = match self.read_message() {
            Ok(response) => response,
            Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Simple(format!("The server may be rejecting connections from this host: {err}")));
            }
            Err(err) => return Err(err),
        };

        let handshake_data = self.connection_handler.parse_handshake_response(&mut response)?;
        let (connection_time, time_zone) = parse_connection_time(&handshake_data.server_time);

        let mut metadata = self.connection_metadata.lock()?;
        metadata.server_version = handshake_data.server_version;
        metadata.connection_time = connection_time;
        metadata.time_zone = time_zone;

        info!("connected, server version {}", handshake_data.server_version);

        Ok(())
    }

    pub(crate) fn start_api(&self) -> Result<(), Error> {
        let message = self.connection_handler.format_start_api(self.client_id, self.server_version());
        self.write_message(&message)
    }

    // Reads until TWS has announced the managed accounts and next order id.
    pub(crate) fn receive_account_info(&self) -> Result<(), Error> {
        let mut account_info = AccountInfo::default();

        for _ in 0..MAX_SETUP_MESSAGES {
            let mut message = self.read_message()?;
            account_info.merge(self.connection_handler.parse_account_info(&mut message)?);

            if account_info.is_complete() {
                break;
            }
        }

        if !account_info.is_complete() {
            warn!("session started without complete account info: {account_info:?}");
        }

        let mut metadata = self.connection_metadata.lock()?;
        if let Some(next_order_id) = account_info.next_order_id {
            metadata.next_order_id = next_order_id;
        }
        if let Some(managed_accounts) = account_info.managed_accounts {
            metadata.managed_accounts = managed_accounts;
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn stubbed(socket: S, client_id: i32) -> Connection<S> {
        Self::with_recorder(socket, client_id, MessageRecorder::disabled())
    }
}
