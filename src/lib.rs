/*
    Replicated banking ledger over three nodes. Each node serves one
    client: transfers the client's locally known balance can cover are
    committed to a local log, the rest go through a Paxos round that
    agrees on the next block of the shared blockchain.
*/

pub mod common;
pub mod consensus;
pub mod network;
