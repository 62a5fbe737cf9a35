//! Client implementation for connecting to and communicating with TWS and IB Gateway.
//!
//! The Client establishes the session, hands out request ids and turns each request
//! into a message on the bus. Responses come back on a channel owned by the request.

use std::fmt::Debug;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use log::debug;
use time::OffsetDateTime;
use time_tz::Tz;

use super::id_generator::IdGenerator;
use crate::acquisition::{BarSource, WindowRequest};
use crate::connection::{sync::Connection, ConnectionMetadata};
use crate::contracts::{self, Contract, ContractDetails};
use crate::errors::Error;
use crate::market_data::historical::{self, BarSize, Duration, HistoricalBarStream, WhatToShow};
use crate::market_data::TradingHours;
use crate::messages::RequestMessage;
use crate::transport::{InternalSubscription, MessageBus, TcpMessageBus, TcpSocket};

// How often the cleanup thread checks for shutdown.
const CLEANUP_INTERVAL: StdDuration = StdDuration::from_secs(1);

/// TWS API Client. Manages the connection to TWS or Gateway.
/// Tracks the negotiated server version and the server's time zone.
pub struct Client {
    /// IB server version
    pub(crate) server_version: i32,
    pub(crate) connection_time: Option<OffsetDateTime>,
    pub(crate) time_zone: Option<&'static Tz>,
    pub(crate) message_bus: Arc<dyn MessageBus>,

    client_id: i32,
    managed_accounts: String,
    request_ids: IdGenerator,
}

impl Client {
    /// Establishes connection to TWS or Gateway
    ///
    /// # Arguments
    /// * `address`   - address of server. e.g. 127.0.0.1:7497
    /// * `client_id` - id of client. e.g. 123
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ibkr_history::client::Client;
    ///
    /// let client = Client::connect("127.0.0.1:7497", 123).expect("connection failed");
    ///
    /// println!("server_version: {}", client.server_version());
    /// println!("connection_time: {:?}", client.connection_time());
    /// ```
    pub fn connect(address: &str, client_id: i32) -> Result<Client, Error> {
        let stream = TcpStream::connect(address)?;
        let socket = TcpSocket::new(stream, address)?;

        let connection = Connection::connect(socket, client_id)?;
        let connection_metadata = connection.connection_metadata();

        let message_bus = Arc::new(TcpMessageBus::new(connection)?);

        // Starts thread to read messages from TWS
        message_bus.process_messages(connection_metadata.server_version, CLEANUP_INTERVAL)?;

        Ok(Client::new(connection_metadata, message_bus))
    }

    fn new(connection_metadata: ConnectionMetadata, message_bus: Arc<dyn MessageBus>) -> Client {
        Client {
            server_version: connection_metadata.server_version,
            connection_time: connection_metadata.connection_time,
            time_zone: connection_metadata.time_zone,
            message_bus,
            client_id: connection_metadata.client_id,
            managed_accounts: connection_metadata.managed_accounts,
            request_ids: IdGenerator::default(),
        }
    }

    /// Returns the ID assigned to the [Client].
    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// Returns the next request ID.
    pub fn next_request_id(&self) -> i32 {
        self.request_ids.next()
    }

    /// Returns the version of the TWS API server to which the client is connected.
    pub fn server_version(&self) -> i32 {
        self.server_version
    }

    /// The time of the server when the client connected
    pub fn connection_time(&self) -> Option<OffsetDateTime> {
        self.connection_time
    }

    /// Time zone of the TWS session, if it could be identified.
    pub fn time_zone(&self) -> Option<&'static Tz> {
        self.time_zone
    }

    /// Accounts visible to this session, comma separated.
    pub fn managed_accounts(&self) -> &str {
        &self.managed_accounts
    }

    /// Returns true if the client is currently connected to TWS/IB Gateway.
    pub fn is_connected(&self) -> bool {
        self.message_bus.is_connected()
    }

    /// Requests contract information.
    ///
    /// Provides all the contracts matching the contract provided. It can also be used to retrieve complete options and futures chains.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use ibkr_history::client::Client;
    /// use ibkr_history::contracts::Contract;
    ///
    /// let client = Client::connect("127.0.0.1:7497", 123).expect("connection failed");
    ///
    /// let contract = Contract::futures("MNQ");
    /// let results = client.contract_details(&contract).expect("request failed");
    /// for contract_detail in results {
    ///     println!("contract: {contract_detail:?}");
    /// }
    /// ```
    pub fn contract_details(&self, contract: &Contract) -> Result<Vec<ContractDetails>, Error> {
        contracts::sync::contract_details(self, contract)
    }

    /// Returns the timestamp of earliest available historical data for a contract and data type.
    ///
    /// ```no_run
    /// use ibkr_history::client::Client;
    /// use ibkr_history::contracts::Contract;
    /// use ibkr_history::market_data::historical::WhatToShow;
    /// use ibkr_history::market_data::TradingHours;
    ///
    /// let client = Client::connect("127.0.0.1:7497", 123).expect("connection failed");
    ///
    /// let contract = Contract::stock("MSFT");
    /// let timestamp = client
    ///     .head_timestamp(&contract, WhatToShow::Trades, TradingHours::Regular)
    ///     .expect("error fetching head timestamp");
    ///
    /// println!("Earliest data: {timestamp}");
    /// ```
    pub fn head_timestamp(&self, contract: &Contract, what_to_show: WhatToShow, trading_hours: TradingHours) -> Result<OffsetDateTime, Error> {
        historical::sync::head_timestamp(self, contract, what_to_show, trading_hours, None)?.ok_or(Error::UnexpectedEndOfStream)
    }

    /// Like [Client::head_timestamp] but waits at most `timeout`. Returns `None` if nothing arrived in time;
    /// the request is then cancelled.
    pub fn head_timestamp_within(
        &self,
        contract: &Contract,
        what_to_show: WhatToShow,
        trading_hours: TradingHours,
        timeout: StdDuration,
    ) -> Result<Option<OffsetDateTime>, Error> {
        historical::sync::head_timestamp(self, contract, what_to_show, trading_hours, Some(timeout))
    }

    /// Requests historical bars ending at `end_date` (or now) and reaching back `duration`.
    ///
    /// The returned stream yields the bars, then the end marker, or the error TWS reported.
    ///
    /// ```no_run
    /// use std::time::Duration;
    ///
    /// use ibkr_history::acquisition::BarStream;
    /// use ibkr_history::client::Client;
    /// use ibkr_history::contracts::Contract;
    /// use ibkr_history::market_data::historical::{BarSize, ToDuration, WhatToShow};
    /// use ibkr_history::market_data::TradingHours;
    /// use time::macros::datetime;
    ///
    /// let client = Client::connect("127.0.0.1:7497", 123).expect("connection failed");
    ///
    /// let contract = Contract::stock("TSLA");
    /// let mut bars = client
    ///     .historical_bars(
    ///         &contract,
    ///         Some(datetime!(2023-04-11 20:00 UTC)),
    ///         3600.seconds(),
    ///         BarSize::Min,
    ///         WhatToShow::Trades,
    ///         TradingHours::Regular,
    ///     )
    ///     .expect("historical data request failed");
    ///
    /// while let Some(event) = bars.next_event(Duration::from_secs(60)).expect("error reading bars") {
    ///     println!("{event:?}");
    /// }
    /// ```
    pub fn historical_bars(
        &self,
        contract: &Contract,
        end_date: Option<OffsetDateTime>,
        duration: Duration,
        bar_size: BarSize,
        what_to_show: WhatToShow,
        trading_hours: TradingHours,
    ) -> Result<HistoricalBarStream, Error> {
        historical::sync::historical_bars(self, contract, end_date, duration, bar_size, what_to_show, trading_hours)
    }

    /// Shuts the message bus down and waits for its threads. Also done when the client is dropped.
    pub fn disconnect(&self) {
        debug!("disconnecting client {}", self.client_id);
        self.message_bus.ensure_shutdown();
    }

    // == Internal Use ==

    #[cfg(test)]
    pub(crate) fn stubbed(message_bus: Arc<dyn MessageBus>, server_version: i32) -> Client {
        Client {
            server_version,
            connection_time: None,
            time_zone: None,
            message_bus,
            client_id: 100,
            managed_accounts: String::new(),
            request_ids: IdGenerator::default(),
        }
    }

    pub(crate) fn send_request(&self, request_id: i32, message: RequestMessage) -> Result<InternalSubscription, Error> {
        debug!("send_request({request_id:?}, {message:?})");
        self.message_bus.send_request(request_id, &message)
    }

    pub(crate) fn cancel_request(&self, request_id: i32, message: RequestMessage) -> Result<(), Error> {
        debug!("cancel_request({request_id:?}, {message:?})");
        self.message_bus.cancel_subscription(request_id, &message)
    }

    pub(crate) fn check_server_version(&self, version: i32, message: &str) -> Result<(), Error> {
        if version <= self.server_version {
            Ok(())
        } else {
            Err(Error::ServerVersion(version, self.server_version, message.into()))
        }
    }
}

impl BarSource for Client {
    type Stream = HistoricalBarStream;

    fn request_bars(&self, request: &WindowRequest<'_>) -> Result<Self::Stream, Error> {
        self.historical_bars(
            request.contract,
            Some(request.end()),
            request.duration,
            request.bar_size,
            request.what_to_show,
            request.trading_hours,
        )
    }

    fn await_connection(&self, timeout: StdDuration) -> Result<(), Error> {
        self.message_bus.await_connection(timeout)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        debug!("dropping client");
        self.message_bus.ensure_shutdown();
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server_version", &self.server_version)
            .field("server_time", &self.connection_time)
            .field("client_id", &self.client_id)
            .finish()
    }
}
