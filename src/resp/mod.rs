pub mod ondemand;
pub mod parser;
pub mod types;
pub mod writer;

pub use ondemand::{try_extract, ExchangeShape, Extract, Reply};
pub use parser::{decode, Decoded, Stop};
pub use types::RespValue;
pub use writer::{encode_command, encode_group, encode_handshake, encode_transaction, Arg, Command};
