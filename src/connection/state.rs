//! The seven-state `ProxyConnection` machine (spec §4.3). A tagged enum
//! with transitions centralized in `connection::run` makes illegal
//! transitions unrepresentable, replacing the source's scattered `state =
//! X` assignments (spec §9 design note).

use crate::discovery::BrokerTarget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Init,
    Connecting,
    Connected,
    ProxyLookupRequests,
    ProxyConnectingToBroker { target: BrokerTarget },
    ProxyConnectionToEndpoint,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Init => "Init",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::ProxyLookupRequests => "ProxyLookupRequests",
            ConnectionState::ProxyConnectingToBroker { .. } => "ProxyConnectingToBroker",
            ConnectionState::ProxyConnectionToEndpoint => "ProxyConnectionToEndpoint",
            ConnectionState::Closing => "Closing",
            ConnectionState::Closed => "Closed",
        }
    }

    pub fn is_spliced(&self) -> bool {
        matches!(self, ConnectionState::ProxyConnectionToEndpoint)
    }
}
