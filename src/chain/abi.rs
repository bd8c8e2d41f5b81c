//! Public interface of the Lottery contract as used by this client.

use crate::types::ContractEventKind;
use alloy::{
    primitives::B256,
    sol,
    sol_types::SolEvent,
};

sol! {
    #[sol(rpc)]
    contract Lottery {
        event TeamRegistered(address teamAddress, string teamName);
        event LogGuessMade(address teamAddress, uint256 guess);

        function getTeamCount() external view returns (uint256 count);
        function getTeamDetails(uint256 index)
            external
            view
            returns (string memory name, address wallet, uint256 score);
        function registerTeam(address wallet, string memory name, string memory password)
            external
            payable;
        function makeAGuess(address team, uint256 guess) external;
    }
}

impl ContractEventKind {
    pub fn signature_hash(self) -> B256 {
        match self {
            ContractEventKind::TeamRegistered => Lottery::TeamRegistered::SIGNATURE_HASH,
            ContractEventKind::GuessMade => Lottery::LogGuessMade::SIGNATURE_HASH,
        }
    }

    pub fn from_signature_hash(topic: &B256) -> Option<Self> {
        ContractEventKind::WATCHED
            .into_iter()
            .find(|kind| kind.signature_hash() == *topic)
    }
}
