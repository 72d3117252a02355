//! Core cell data structures and codecs.
//!
//! - BitString: immutable bit-level view over a byte buffer
//! - Cell: the content-addressed DAG node (up to 1023 bits, 4 refs)
//! - Builder: append-only accumulator that finalizes into a Cell
//! - Slice: fail-fast read cursor over a Cell
//! - BoC: the canonical Bag of Cells container format
//! - Dict: key→value prefix tree with Merkle proof/update generation

pub mod address;
pub mod bitstring;
pub mod boc;
pub mod builder;
pub mod cell;
pub mod dict;
pub mod error;
pub mod proof;
pub mod slice;

pub use address::Address;
pub use bitstring::BitString;
pub use boc::{
    BocOptions, base64_to_boc, boc_to_base64, boc_to_hex, deserialize_boc, deserialize_boc_root,
    hex_to_boc, serialize_boc, serialize_boc_root,
};
pub use builder::Builder;
pub use cell::{
    Cell, CellType, DEPTH_SIZE, HASH_SIZE, LevelMask, MAX_CELL_BITS, MAX_CELL_LEVEL, MAX_CELL_REFS,
};
pub use dict::Dict;
pub use error::{CellError, Result};
pub use proof::{make_merkle_proof, make_merkle_update, make_pruned_branch, merkle_proof_hash};
pub use slice::Slice;
