//! Blocking message bus. A dispatcher thread reads every message TWS sends and
//! forwards it to the channel registered for its request id. A cleanup thread
//! releases channels as subscriptions are dropped.

use std::collections::HashMap;
use std::io::{prelude::*, Cursor};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use super::routing::{determine_routing, is_warning_error, RoutingDecision, UNSPECIFIED_REQUEST_ID};
use super::Response;
use crate::connection::sync::Connection;
use crate::errors::{is_connection_error, is_timeout_error};
use crate::messages::{RequestMessage, ResponseMessage};
use crate::{server_versions, Error};

const TWS_READ_TIMEOUT: Duration = Duration::from_secs(1);
// How often a caller waiting for a reconnect checks the connection state.
const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sends requests to TWS and hands out the channel their responses arrive on.
pub(crate) trait MessageBus: Send + Sync {
    /// Registers `request_id` and sends the request. Responses carrying that id go to the returned subscription.
    fn send_request(&self, request_id: i32, message: &RequestMessage) -> Result<InternalSubscription, Error>;

    /// Sends a cancel message and releases the channel for `request_id`.
    fn cancel_subscription(&self, request_id: i32, message: &RequestMessage) -> Result<(), Error>;

    /// Sends a message that expects no response.
    fn send_message(&self, message: &RequestMessage) -> Result<(), Error>;

    /// Stops the background threads and fails all waiting subscriptions.
    fn ensure_shutdown(&self);

    fn is_connected(&self) -> bool;

    /// Blocks until the bus is connected, for at most `timeout`.
    /// Fails with [Error::ConnectionFailed] when the connection does not come back in time.
    fn await_connection(&self, timeout: Duration) -> Result<(), Error>;

    #[cfg(test)]
    fn request_messages(&self) -> Vec<RequestMessage> {
        vec![]
    }
}

/// Notifications sent from subscriptions to the cleanup thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Signal {
    Request(i32),
}

/// Receiving end of a request's response channel.
///
/// Dropping the subscription releases the request id on the bus.
#[derive(Debug)]
pub(crate) struct InternalSubscription {
    receiver: Receiver<Response>,
    signaler: Option<Sender<Signal>>,
    request_id: Option<i32>,
}

impl InternalSubscription {
    pub(crate) fn new(receiver: Receiver<Response>, signaler: Option<Sender<Signal>>, request_id: Option<i32>) -> Self {
        Self {
            receiver,
            signaler,
            request_id,
        }
    }

    #[cfg(test)]
    pub(crate) fn request_id(&self) -> Option<i32> {
        self.request_id
    }

    /// Blocks until the next response. Returns `None` once the bus has released the channel.
    pub(crate) fn next(&self) -> Option<Response> {
        self.receiver.recv().ok()
    }

    #[cfg(test)]
    pub(crate) fn try_next(&self) -> Option<Response> {
        self.receiver.try_recv().ok()
    }

    /// Waits up to `timeout` for the next response. Returns `None` only when the wait timed out.
    pub(crate) fn next_timeout(&self, timeout: Duration) -> Option<Response> {
        match self.receiver.recv_timeout(timeout) {
            Ok(response) => Some(response),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Error::UnexpectedEndOfStream)),
        }
    }
}

impl Drop for InternalSubscription {
    fn drop(&mut self) {
        if let (Some(signaler), Some(request_id)) = (&self.signaler, self.request_id) {
            if let Err(e) = signaler.send(Signal::Request(request_id)) {
                debug!("could not release request {request_id}: {e}");
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct TcpMessageBus<S: Stream> {
    connection: Connection<S>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    requests: SenderHash<i32, Response>,
    signals_send: Sender<Signal>,
    signals_recv: Receiver<Signal>,
    shutdown_requested: AtomicBool,
    connected: AtomicBool,
    // Held for reading around every write, for writing while the connection state flips.
    write_gate: RwLock<()>,
}

impl<S: Stream> TcpMessageBus<S> {
    pub fn new(connection: Connection<S>) -> Result<TcpMessageBus<S>, Error> {
        let (signals_send, signals_recv) = channel::unbounded();

        Ok(TcpMessageBus {
            connection,
            handles: Mutex::new(Vec::default()),
            requests: SenderHash::new(),
            signals_send,
            signals_recv,
            shutdown_requested: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            write_gate: RwLock::new(()),
        })
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    fn request_shutdown(&self) {
        debug!("shutdown requested");

        self.requests.notify_all(|| Err(Error::Shutdown));
        self.requests.clear();

        self.connected.store(false, Ordering::SeqCst);
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    // Outstanding requests are lost when TWS drops the socket.
    fn reset(&self) {
        debug!("reset message bus");

        self.requests.notify_all(|| Err(Error::ConnectionReset));
        self.requests.clear();
    }

    fn mark_disconnected(&self) {
        let _gate = self.write_gate.write().unwrap_or_else(PoisonError::into_inner);
        self.connected.store(false, Ordering::SeqCst);
    }

    // Writes only while connected, so nothing reaches a socket that is being reopened.
    fn write_connected(&self, message: &RequestMessage) -> Result<(), Error> {
        let _gate = self.write_gate.read().unwrap_or_else(PoisonError::into_inner);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ConnectionReset);
        }
        self.connection.write_message(message)
    }

    fn clean_request(&self, request_id: i32) {
        self.requests.remove(&request_id);
        debug!("released request_id {request_id}, requests.len()={}", self.requests.len());
    }

    /// Reads one message and routes it. Returns an error when the dispatcher should stop.
    pub(crate) fn dispatch(&self, server_version: i32) -> Result<(), Error> {
        match self.connection.read_message() {
            Ok(message) if message.is_shutdown() => {
                info!("TWS requested shutdown");
                self.request_shutdown();
                Err(Error::Shutdown)
            }
            Ok(message) => {
                self.dispatch_message(server_version, message);
                Ok(())
            }
            Err(ref err) if is_timeout_error(err) => {
                if self.is_shutting_down() {
                    debug!("dispatcher thread exiting");
                    return Err(Error::Shutdown);
                }
                Ok(())
            }
            Err(ref err) if is_connection_error(err) => {
                error!("error reading next message (will attempt reconnect): {err:?}");
                self.mark_disconnected();

                if let Err(reconnect_err) = self.connection.reconnect() {
                    error!("failed to reconnect to TWS/Gateway: {reconnect_err:?}");
                    self.request_shutdown();
                    return Err(Error::ConnectionFailed);
                }

                info!("reconnected to TWS/Gateway");
                self.reset();
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                error!("error reading next message (shutting down): {err:?}");
                self.request_shutdown();
                Err(err)
            }
        }
    }

    fn dispatch_message(&self, server_version: i32, message: ResponseMessage) {
        match determine_routing(&message) {
            RoutingDecision::ByRequestId(request_id) => self.process_response(request_id, message),
            RoutingDecision::Error { request_id, error_code } => {
                if request_id == UNSPECIFIED_REQUEST_ID || is_warning_error(error_code) || !self.requests.contains(&request_id) {
                    if let Err(e) = error_event(server_version, message) {
                        warn!("could not decode error message: {e}");
                    }
                } else {
                    self.process_response(request_id, message);
                }
            }
            RoutingDecision::Session(kind) => debug!("ignoring {kind:?} outside session setup: {message:?}"),
            RoutingDecision::Unhandled(kind) => info!("no consumer for {kind:?}: {message:?}"),
            RoutingDecision::Shutdown => self.request_shutdown(),
        }
    }

    fn process_response(&self, request_id: i32, message: ResponseMessage) {
        if !self.requests.send(&request_id, Ok(message)) {
            info!("no recipient found for request_id {request_id}, it may have been cancelled or timed out");
        }
    }

    fn start_dispatcher_thread(self: &Arc<Self>, server_version: i32) -> JoinHandle<()> {
        let message_bus = Arc::clone(self);
        thread::spawn(move || {
            loop {
                match message_bus.dispatch(server_version) {
                    Ok(_) => {}
                    Err(Error::Shutdown | Error::ConnectionFailed) => break,
                    Err(e) => {
                        error!("dispatcher encountered an error: {e:?}");
                        break;
                    }
                }
            }
            debug!("dispatcher thread finished");
        })
    }

    fn start_cleanup_thread(self: &Arc<Self>, timeout: Duration) -> JoinHandle<()> {
        let message_bus = Arc::clone(self);

        thread::spawn(move || {
            let signal_recv = message_bus.signals_recv.clone();

            loop {
                if let Ok(Signal::Request(request_id)) = signal_recv.recv_timeout(timeout) {
                    message_bus.clean_request(request_id);
                }

                if message_bus.is_shutting_down() {
                    debug!("cleanup thread exiting");
                    return;
                }
            }
        })
    }

    /// Starts the dispatcher and cleanup threads.
    pub(crate) fn process_messages(self: &Arc<Self>, server_version: i32, timeout: Duration) -> Result<(), Error> {
        let handle = self.start_dispatcher_thread(server_version);
        self.add_join_handle(handle)?;

        let handle = self.start_cleanup_thread(timeout);
        self.add_join_handle(handle)?;

        Ok(())
    }

    fn add_join_handle(&self, handle: JoinHandle<()>) -> Result<(), Error> {
        let mut handles = self.handles.lock()?;
        handles.push(handle);
        Ok(())
    }

    pub fn join(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);

        for handle in handles.drain(..) {
            if let Err(e) = handle.join() {
                warn!("could not join thread: {e:?}");
            }
        }
    }
}

impl<S: Stream> MessageBus for TcpMessageBus<S> {
    fn send_request(&self, request_id: i32, message: &RequestMessage) -> Result<InternalSubscription, Error> {
        if self.is_shutting_down() {
            return Err(Error::Shutdown);
        }

        let (sender, receiver) = channel::unbounded();
        self.requests.insert(request_id, sender);

        if let Err(e) = self.write_connected(message) {
            self.requests.remove(&request_id);
            return Err(e);
        }

        Ok(InternalSubscription::new(receiver, Some(self.signals_send.clone()), Some(request_id)))
    }

    fn cancel_subscription(&self, request_id: i32, message: &RequestMessage) -> Result<(), Error> {
        match self.write_connected(message) {
            // TWS forgets outstanding requests when the connection drops.
            Err(Error::ConnectionReset) => debug!("not connected, request {request_id} released without cancel"),
            result => result?,
        }

        if !self.requests.send(&request_id, Err(Error::Cancelled)) {
            debug!("request {request_id} already released before cancel");
        }
        self.requests.remove(&request_id);

        Ok(())
    }

    fn send_message(&self, message: &RequestMessage) -> Result<(), Error> {
        self.write_connected(message)
    }

    fn ensure_shutdown(&self) {
        self.request_shutdown();
        self.join();
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.is_shutting_down()
    }

    fn await_connection(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut waiting = false;

        loop {
            if self.is_shutting_down() {
                return Err(Error::Shutdown);
            }
            if self.connected.load(Ordering::SeqCst) {
                if waiting {
                    info!("connection to TWS/Gateway is back");
                }
                return Ok(());
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                error!("no connection to TWS/Gateway after waiting {timeout:?}");
                return Err(Error::ConnectionFailed);
            }
            if !waiting {
                info!("waiting up to {timeout:?} for the connection to TWS/Gateway");
                waiting = true;
            }

            thread::sleep(remaining.min(RECONNECT_POLL_INTERVAL));
        }
    }
}

// Logs errors that are not tied to a waiting request.
fn error_event(server_version: i32, mut packet: ResponseMessage) -> Result<(), Error> {
    packet.skip(); // message_id

    let version = packet.next_int()?;

    if version < 2 {
        let message = packet.next_string()?;
        error!("version {version} error: {message}");
        return Ok(());
    }

    let request_id = packet.next_int()?;
    let error_code = packet.next_int()?;
    let error_message = packet.next_string()?;

    let mut advanced_order_reject_json = String::new();
    if server_version >= server_versions::ADVANCED_ORDER_REJECT {
        advanced_order_reject_json = packet.next_string().unwrap_or_default();
    }

    if is_warning_error(error_code) {
        warn!("request_id: {request_id}, warning_code: {error_code}, warning_message: {error_message}");
    } else if advanced_order_reject_json.is_empty() {
        error!("request_id: {request_id}, error_code: {error_code}, error_message: {error_message}");
    } else {
        error!("request_id: {request_id}, error_code: {error_code}, error_message: {error_message}, advanced_order_reject_json: {advanced_order_reject_json}");
    }

    Ok(())
}

#[derive(Debug)]
struct SenderHash<K, V> {
    senders: RwLock<HashMap<K, Sender<V>>>,
}

impl<K: std::hash::Hash + Eq + std::fmt::Debug, V: std::fmt::Debug> SenderHash<K, V> {
    fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    // Returns false when nothing is registered for the id.
    fn send(&self, id: &K, message: V) -> bool {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        match senders.get(id) {
            Some(sender) => {
                if let Err(err) = sender.send(message) {
                    warn!("error sending: {id:?}, {err}");
                }
                true
            }
            None => false,
        }
    }

    fn insert(&self, id: K, sender: Sender<V>) -> Option<Sender<V>> {
        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        senders.insert(id, sender)
    }

    fn remove(&self, id: &K) -> Option<Sender<V>> {
        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        senders.remove(id)
    }

    fn contains(&self, id: &K) -> bool {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        senders.contains_key(id)
    }

    fn len(&self) -> usize {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        senders.len()
    }

    fn clear(&self) {
        let mut senders = self.senders.write().unwrap_or_else(PoisonError::into_inner);
        senders.clear();
    }

    fn notify_all<F>(&self, message_fn: F)
    where
        F: Fn() -> V,
    {
        let senders = self.senders.read().unwrap_or_else(PoisonError::into_inner);
        for sender in senders.values() {
            if let Err(e) = sender.send(message_fn()) {
                warn!("error sending notification: {e}");
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct TcpSocket {
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    connection_url: String,
}

impl TcpSocket {
    pub fn new(stream: TcpStream, connection_url: &str) -> Result<Self, Error> {
        let writer = stream.try_clone()?;

        stream.set_read_timeout(Some(TWS_READ_TIMEOUT))?;

        Ok(Self {
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            connection_url: connection_url.to_string(),
        })
    }
}

impl Reconnect for TcpSocket {
    fn reconnect(&self) -> Result<(), Error> {
        let stream = TcpStream::connect(&self.connection_url)?;
        stream.set_read_timeout(Some(TWS_READ_TIMEOUT))?;

        let mut reader = self.reader.lock()?;
        *reader = stream.try_clone()?;

        let mut writer = self.writer.lock()?;
        *writer = stream;

        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

impl Io for TcpSocket {
    fn read_message(&self) -> Result<Vec<u8>, Error> {
        let mut reader = self.reader.lock()?;
        read_message(&mut *reader)
    }

    fn write_all(&self, buf: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock()?;
        writer.write_all(buf)?;
        Ok(())
    }
}

impl Stream for TcpSocket {}

pub(crate) trait Reconnect {
    fn reconnect(&self) -> Result<(), Error>;
    fn sleep(&self, duration: Duration);
}

pub(crate) trait Io {
    fn read_message(&self) -> Result<Vec<u8>, Error>;
    fn write_all(&self, buf: &[u8]) -> Result<(), Error>;
}

pub(crate) trait Stream: Io + Reconnect + Sync + Send + 'static + std::fmt::Debug {}

fn read_header(reader: &mut impl Read) -> Result<usize, Error> {
    let buffer = &mut [0_u8; 4];
    reader.read_exact(buffer)?;
    let mut reader = Cursor::new(buffer);
    let count = reader.read_u32::<BigEndian>()?;
    Ok(count as usize)
}

/// Reads one length prefixed message.
pub(crate) fn read_message(reader: &mut impl Read) -> Result<Vec<u8>, Error> {
    let message_size = read_header(reader)?;
    let mut data = vec![0_u8; message_size];
    reader.read_exact(&mut data)?;
    Ok(data)
}
