pub mod admission;
pub mod ballot;
pub mod ledger;
pub mod message;
pub mod peers;
pub mod processor;
pub mod replica;
pub mod store;

pub use admission::*;
pub use ballot::*;
pub use ledger::*;
pub use message::*;
pub use peers::*;
pub use processor::*;
pub use replica::*;
pub use store::*;
