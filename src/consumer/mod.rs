mod decode;
mod dispatcher;

pub use decode::{decode, DecodeError};
pub use dispatcher::{DeliveryOutcome, Dispatcher, DEAD_LETTER_RETRY_DELAY};
