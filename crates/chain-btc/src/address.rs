use std::str::FromStr;

use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::Script;

use crate::error::BtcError;
use crate::network::BtcNetwork;

/// Parse an address string and require that it belongs to `network`.
///
/// Accepts P2PKH, P2SH, P2WPKH, P2WSH and P2TR encodings. A well-formed
/// address for another network is reported as `InvalidAddress` so callers
/// never build an output that pays to the wrong chain.
pub fn parse_address(address: &str, network: BtcNetwork) -> Result<Address, BtcError> {
    address
        .trim()
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse {address}: {e}")))?
        .require_network(network.to_bitcoin_network())
        .map_err(|e| BtcError::InvalidAddress(format!("{address} is not a {network} address: {e}")))
}

/// Validate a Bitcoin address string for the given network.
///
/// Returns `true` if the address is valid for the specified network,
/// `false` if it is valid but for a different network.
pub fn validate_address(address: &str, network: BtcNetwork) -> Result<bool, BtcError> {
    let parsed = Address::<NetworkUnchecked>::from_str(address.trim())
        .map_err(|e| BtcError::InvalidAddress(format!("failed to parse address: {e}")))?;

    Ok(parsed.is_valid_for_network(network.to_bitcoin_network()))
}

/// Render a scriptPubKey as an address, if it has a standard encoding.
pub fn script_to_address(script: &Script, network: BtcNetwork) -> Option<String> {
    Address::from_script(script, network.to_bitcoin_network())
        .ok()
        .map(|a| a.to_string())
}
