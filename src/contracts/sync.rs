use log::debug;

use super::{decoders, encoders, Contract, ContractDetails};
use crate::client::Client;
use crate::messages::IncomingMessages;
use crate::{server_versions, Error};

// Requests the details of every contract matching `contract`. Collects until TWS signals the end of the list.
pub(crate) fn contract_details(client: &Client, contract: &Contract) -> Result<Vec<ContractDetails>, Error> {
    verify_contract(client, contract)?;

    let request_id = client.next_request_id();
    let packet = encoders::encode_request_contract_data(client.server_version, request_id, contract)?;

    let responses = client.send_request(request_id, packet)?;

    let mut contract_details: Vec<ContractDetails> = Vec::default();

    while let Some(response) = responses.next() {
        match response {
            Ok(mut message) if message.message_type() == IncomingMessages::ContractData => {
                let decoded = decoders::decode_contract_details(client.server_version, &mut message)?;
                contract_details.push(decoded);
            }
            Ok(message) if message.message_type() == IncomingMessages::ContractDataEnd => {
                debug!("received {} contract details for request {request_id}", contract_details.len());
                return Ok(contract_details);
            }
            Ok(message) if message.message_type() == IncomingMessages::Error => return Err(Error::from(message)),
            Ok(message) => return Err(Error::UnexpectedResponse(message)),
            Err(e) => return Err(e),
        }
    }

    Err(Error::UnexpectedEndOfStream)
}

// Fails when the contract uses fields the connected server cannot receive.
pub(crate) fn verify_contract(client: &Client, contract: &Contract) -> Result<(), Error> {
    if !contract.security_id_type.is_empty() || !contract.security_id.is_empty() {
        client.check_server_version(server_versions::SEC_ID_TYPE, "It does not support security id type parameters.")?
    }

    if !contract.trading_class.is_empty() {
        client.check_server_version(server_versions::TRADING_CLASS, "It does not support trading class parameters.")?
    }

    if !contract.primary_exchange.is_empty() {
        client.check_server_version(server_versions::LINKING, "It does not support primary exchange parameters.")?
    }

    if !contract.issuer_id.is_empty() {
        client.check_server_version(server_versions::BOND_ISSUERID, "It does not support issuer id parameters.")?
    }

    Ok(())
}
