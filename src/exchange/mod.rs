mod paper;
mod registry;
mod traits;

pub use paper::{FillBehavior, PaperExchange};
pub use registry::ExchangeRegistry;
pub use traits::{Balance, ExchangeClient};
