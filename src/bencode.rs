//! Bencode encoding and decoding (BEP-3).
//!
//! Every wire dictionary the engine speaks — DHT KRPC, the extended
//! handshake, tracker responses, persisted session state, resume data —
//! is bencoded: integers (`i<dec>e`), byte strings (`<len>:<bytes>`),
//! lists (`l…e`) and dictionaries (`d…e`) whose keys are unique and
//! sorted bytewise.
//!
//! The decoder is strict about the canonical form (no leading zeros,
//! ordered keys, bounded nesting) because most of its input arrives from
//! untrusted UDP packets.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
