pub mod allocation;
pub mod events;
pub mod order;
pub mod payment;

pub use allocation::*;
pub use events::*;
pub use order::*;
pub use payment::*;
