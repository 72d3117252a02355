//! Content-addressed cell trees and their canonical binary codecs.
//!
//! This crate implements the fundamental storage unit of the TON blockchain:
//! the Cell, an immutable node of up to 1023 bits and up to 4 references to
//! other cells. On top of it sit the canonical Bag of Cells (BoC) container
//! format, the dictionary (prefix tree) codec, and Merkle proof/update
//! generation for partial reveals.

pub mod crc;
pub mod tvm;
pub mod utils;
