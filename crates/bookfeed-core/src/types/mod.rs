//! Core data types: exchange/market enums, order-book entities and worker
//! resource types.

pub mod enums;
pub mod orderbook;
pub mod resources;

pub use enums::*;
pub use orderbook::*;
pub use resources::*;
