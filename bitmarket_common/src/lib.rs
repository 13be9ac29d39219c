mod helpers;
mod op;
mod sats;
mod secret;

pub use helpers::parse_boolean_flag;
pub use sats::{Sats, SatsConversionError, BITCOIN_CURRENCY_CODE, SATS_PER_BTC};
pub use secret::Secret;
