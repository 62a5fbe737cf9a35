//! Routes requests from the client to TWS and responses from TWS back to the request that asked for them.

use crate::messages::ResponseMessage;
use crate::Error;

pub(crate) mod common;
pub(crate) mod recorder;
pub(crate) mod routing;
pub(crate) mod sync;

pub(crate) type Response = Result<ResponseMessage, Error>;

pub(crate) use sync::{InternalSubscription, MessageBus, TcpMessageBus, TcpSocket};
