//! Framed scalar protocol: length-prefixed binary messages and null-delimited
//! string arrays.

pub mod channel;

pub use channel::{
    decode_array, decode_pairs, encode_array, encode_pairs, encode_scalar, read_array,
    read_scalar, write_array, write_scalar, ProtocolError, DEFAULT_MAX_SCALAR_SIZE,
};
