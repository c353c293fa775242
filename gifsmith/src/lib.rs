#[macro_use]
extern crate log;
extern crate custom_error;

pub mod lzw;
pub mod quantizer;
pub mod writer;

#[cfg(test)]
mod readback;

pub use writer::{GIFWriter, GIFWriterError};
