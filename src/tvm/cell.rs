//! Cell: the immutable, content-addressed tree node.
//!
//! A cell stores up to 1023 bits of data and up to 4 references to other
//! cells. Ordinary cells carry user data; exotic cells (pruned branches,
//! library references, Merkle proofs and Merkle updates) have fixed bit
//! layouts and special hashing rules. Hashes and depths are computed once,
//! per level, when the cell is finalized; a finalized cell never changes,
//! so the cached values stay valid for its whole lifetime.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::tvm::bitstring::BitString;
use crate::tvm::error::{CellError, Result};

/// Maximum number of data bits in a cell.
pub const MAX_CELL_BITS: usize = 1023;

/// Maximum number of references in a cell.
pub const MAX_CELL_REFS: usize = 4;

/// Cell level range (0-3).
pub const MAX_CELL_LEVEL: u8 = 3;

/// Size of a cell hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Size of a serialized depth field in bytes.
pub const DEPTH_SIZE: usize = 2;

/// The closed set of cell kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellType {
    Ordinary,
    PrunedBranch,
    LibraryReference,
    MerkleProof,
    MerkleUpdate,
}

impl CellType {
    /// Parses the first payload byte of an exotic cell.
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(CellType::PrunedBranch),
            2 => Ok(CellType::LibraryReference),
            3 => Ok(CellType::MerkleProof),
            4 => Ok(CellType::MerkleUpdate),
            _ => Err(CellError::RangeCheck(format!(
                "unknown exotic cell tag {}",
                tag
            ))),
        }
    }

    /// The tag byte written as the first payload byte of an exotic cell.
    pub fn tag(&self) -> u8 {
        match self {
            CellType::Ordinary => 0xff,
            CellType::PrunedBranch => 1,
            CellType::LibraryReference => 2,
            CellType::MerkleProof => 3,
            CellType::MerkleUpdate => 4,
        }
    }

    pub fn is_exotic(&self) -> bool {
        *self != CellType::Ordinary
    }

    pub fn is_merkle(&self) -> bool {
        matches!(self, CellType::MerkleProof | CellType::MerkleUpdate)
    }

    pub fn is_pruned(&self) -> bool {
        *self == CellType::PrunedBranch
    }
}

impl fmt::Display for CellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CellType::Ordinary => "ordinary",
            CellType::PrunedBranch => "pruned branch",
            CellType::LibraryReference => "library reference",
            CellType::MerkleProof => "merkle proof",
            CellType::MerkleUpdate => "merkle update",
        };
        f.write_str(name)
    }
}

/// A 3-bit set recording at which levels a cell carries distinct hashes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelMask(u8);

impl LevelMask {
    pub fn with_mask(mask: u8) -> Self {
        LevelMask(mask & 0x07)
    }

    pub fn with_level(level: u8) -> Self {
        match level {
            0 => LevelMask(0),
            1 => LevelMask(1),
            2 => LevelMask(3),
            _ => LevelMask(7),
        }
    }

    /// Mask of a Merkle cell given the union of its children's masks.
    pub fn for_merkle_cell(children: LevelMask) -> Self {
        LevelMask(children.0 >> 1)
    }

    /// The cell level: the number of set mask bits.
    pub fn level(&self) -> u8 {
        self.0.count_ones() as u8
    }

    pub fn mask(&self) -> u8 {
        self.0
    }

    /// Maps a requested hash level to an index into the stored hash list.
    pub fn hash_index(&self, level: usize) -> usize {
        let capped = level.min(MAX_CELL_LEVEL as usize) as u8;
        LevelMask(self.0 & Self::with_level(capped).0).level() as usize
    }
}

impl BitOr for LevelMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        LevelMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for LevelMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// An immutable DAG node with cached per-level hashes and depths.
///
/// Cells are shared through `Arc` and compare by content hash, so two
/// independently built trees with the same logical content are equal.
pub struct Cell {
    cell_type: CellType,
    bits: BitString,
    references: Vec<Arc<Cell>>,
    level_mask: LevelMask,
    hashes: Vec<[u8; HASH_SIZE]>,
    depths: Vec<u16>,
}

impl Cell {
    /// Finalizes an ordinary cell.
    pub fn ordinary(bits: BitString, references: Vec<Arc<Cell>>) -> Result<Arc<Cell>> {
        Self::finalize(CellType::Ordinary, bits, references).map(Arc::new)
    }

    /// Finalizes an exotic cell; the payload layout is validated against
    /// `cell_type`.
    pub fn exotic(
        cell_type: CellType,
        bits: BitString,
        references: Vec<Arc<Cell>>,
    ) -> Result<Arc<Cell>> {
        if cell_type == CellType::Ordinary {
            return Err(CellError::RangeCheck(
                "ordinary is not an exotic cell type".to_string(),
            ));
        }
        Self::finalize(cell_type, bits, references).map(Arc::new)
    }

    fn finalize(
        cell_type: CellType,
        bits: BitString,
        references: Vec<Arc<Cell>>,
    ) -> Result<Cell> {
        if bits.len() > MAX_CELL_BITS {
            return Err(CellError::CellOverflow(format!(
                "{} bits exceed the {} bit limit",
                bits.len(),
                MAX_CELL_BITS
            )));
        }
        if references.len() > MAX_CELL_REFS {
            return Err(CellError::CellOverflow(format!(
                "{} references exceed the limit of {}",
                references.len(),
                MAX_CELL_REFS
            )));
        }

        let data = bits.to_bytes();

        let mut children_mask = LevelMask::default();
        for child in &references {
            children_mask |= child.level_mask();
        }

        let level_mask = match cell_type {
            CellType::Ordinary => children_mask,
            CellType::PrunedBranch => Self::check_pruned_layout(&bits, &data, &references)?,
            CellType::LibraryReference => {
                if bits.len() != 8 * (1 + HASH_SIZE) || !references.is_empty() {
                    return Err(CellError::RangeCheck(
                        "library reference must hold a tag and one hash and no refs".to_string(),
                    ));
                }
                LevelMask::default()
            }
            CellType::MerkleProof => {
                if bits.len() != 8 * (1 + HASH_SIZE + DEPTH_SIZE) || references.len() != 1 {
                    return Err(CellError::RangeCheck(
                        "merkle proof must hold a tag, one hash, one depth and one ref"
                            .to_string(),
                    ));
                }
                LevelMask::for_merkle_cell(children_mask)
            }
            CellType::MerkleUpdate => {
                if bits.len() != 8 * (1 + 2 * (HASH_SIZE + DEPTH_SIZE)) || references.len() != 2 {
                    return Err(CellError::RangeCheck(
                        "merkle update must hold a tag, two hashes, two depths and two refs"
                            .to_string(),
                    ));
                }
                LevelMask::for_merkle_cell(children_mask)
            }
        };

        if cell_type.is_exotic() && !cell_type.is_pruned() && data.first() != Some(&cell_type.tag())
        {
            return Err(CellError::RangeCheck(format!(
                "exotic cell payload tag does not match {}",
                cell_type
            )));
        }

        let mut cell = Cell {
            cell_type,
            bits,
            references,
            level_mask,
            hashes: Vec::new(),
            depths: Vec::new(),
        };
        cell.compute_hashes();
        cell.check_merkle_payload(&data)?;
        Ok(cell)
    }

    fn check_pruned_layout(
        bits: &BitString,
        data: &[u8],
        references: &[Arc<Cell>],
    ) -> Result<LevelMask> {
        if !references.is_empty() {
            return Err(CellError::RangeCheck(
                "pruned branch must not have refs".to_string(),
            ));
        }
        if data.len() < 2 || data[0] != CellType::PrunedBranch.tag() {
            return Err(CellError::RangeCheck(
                "pruned branch payload must start with its tag".to_string(),
            ));
        }
        let mask = LevelMask::with_mask(data[1]);
        if mask.mask() == 0 || mask.mask() != data[1] {
            return Err(CellError::RangeCheck(format!(
                "invalid pruned branch level mask {:#04x}",
                data[1]
            )));
        }
        let level = mask.level() as usize;
        if bits.len() != 8 * (2 + level * (HASH_SIZE + DEPTH_SIZE)) {
            return Err(CellError::RangeCheck(format!(
                "pruned branch payload has wrong size for level {}",
                level
            )));
        }
        Ok(mask)
    }

    /// Per-level hashing: SHA-256 over the descriptor bytes, the padded data
    /// (or the previous level's hash), then each child's depth and hash at
    /// the corresponding level. Merkle cells read their children one level
    /// higher; pruned branches only compute their own representation hash.
    fn compute_hashes(&mut self) {
        let is_merkle = self.cell_type.is_merkle();
        let is_pruned = self.cell_type.is_pruned();
        let padded = self.bits.to_padded_bytes();
        let d2 = (self.bits.len() / 8 + (self.bits.len() + 7) / 8) as u8;

        let hash_count = if is_pruned {
            1
        } else {
            self.level_mask.level() as usize + 1
        };

        let mut hashes: Vec<[u8; HASH_SIZE]> = Vec::with_capacity(hash_count);
        let mut depths: Vec<u16> = Vec::with_capacity(hash_count);

        for i in 0..hash_count {
            let mask_for_level = if is_pruned {
                self.level_mask
            } else {
                LevelMask::with_level(i as u8)
            };
            let d1 = self.references.len() as u8
                + if self.cell_type.is_exotic() { 8 } else { 0 }
                + 32 * mask_for_level.mask();

            let mut hasher = Sha256::new();
            hasher.update([d1, d2]);
            if i == 0 {
                hasher.update(&padded);
            } else {
                hasher.update(hashes[i - 1]);
            }

            let child_level = if is_merkle { i + 1 } else { i };
            let mut depth = 0u16;
            for child in &self.references {
                let child_depth = child.depth(child_level);
                depth = depth.max(child_depth + 1);
                hasher.update(child_depth.to_be_bytes());
            }
            for child in &self.references {
                hasher.update(child.hash(child_level));
            }

            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&hasher.finalize());
            hashes.push(hash);
            depths.push(depth);
        }

        self.hashes = hashes;
        self.depths = depths;
    }

    /// A Merkle cell certifies the hashes and depths it stores: they must
    /// match its children at level 0.
    fn check_merkle_payload(&self, data: &[u8]) -> Result<()> {
        let check = |stored_hash: &[u8], stored_depth: &[u8], child: &Arc<Cell>| {
            if stored_hash != child.hash(0) {
                return Err(CellError::RangeCheck(
                    "merkle cell hash does not match its subtree".to_string(),
                ));
            }
            let depth = u16::from_be_bytes([stored_depth[0], stored_depth[1]]);
            if depth != child.depth(0) {
                return Err(CellError::RangeCheck(
                    "merkle cell depth does not match its subtree".to_string(),
                ));
            }
            Ok(())
        };
        match self.cell_type {
            CellType::MerkleProof => {
                let hash_end = 1 + HASH_SIZE;
                check(
                    &data[1..hash_end],
                    &data[hash_end..hash_end + DEPTH_SIZE],
                    &self.references[0],
                )
            }
            CellType::MerkleUpdate => {
                let old_hash = &data[1..1 + HASH_SIZE];
                let new_hash = &data[1 + HASH_SIZE..1 + 2 * HASH_SIZE];
                let depths_at = 1 + 2 * HASH_SIZE;
                check(
                    old_hash,
                    &data[depths_at..depths_at + DEPTH_SIZE],
                    &self.references[0],
                )?;
                check(
                    new_hash,
                    &data[depths_at + DEPTH_SIZE..depths_at + 2 * DEPTH_SIZE],
                    &self.references[1],
                )
            }
            _ => Ok(()),
        }
    }

    /// Returns the cell's hash at the given level (0..=3).
    ///
    /// A pruned branch answers for the subtree it elides: below its own
    /// level it serves the hashes stored in its payload.
    pub fn hash(&self, level: usize) -> [u8; HASH_SIZE] {
        let index = self.level_mask.hash_index(level);
        if self.cell_type.is_pruned() && index != self.level_mask.level() as usize {
            let data = self.bits.to_bytes();
            let offset = 2 + index * HASH_SIZE;
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(&data[offset..offset + HASH_SIZE]);
            return hash;
        }
        let index = if self.cell_type.is_pruned() { 0 } else { index };
        self.hashes[index]
    }

    /// Returns the cell's depth at the given level (0..=3).
    pub fn depth(&self, level: usize) -> u16 {
        let index = self.level_mask.hash_index(level);
        if self.cell_type.is_pruned() && index != self.level_mask.level() as usize {
            let data = self.bits.to_bytes();
            let level_count = self.level_mask.level() as usize;
            let offset = 2 + level_count * HASH_SIZE + index * DEPTH_SIZE;
            return u16::from_be_bytes([data[offset], data[offset + 1]]);
        }
        let index = if self.cell_type.is_pruned() { 0 } else { index };
        self.depths[index]
    }

    /// The representation hash: the hash at the maximum level. This is the
    /// cell's identity for deduplication.
    pub fn repr_hash(&self) -> [u8; HASH_SIZE] {
        self.hash(MAX_CELL_LEVEL as usize)
    }

    pub fn bits(&self) -> &BitString {
        &self.bits
    }

    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }

    /// The cell data, zero-padded to a byte boundary (no completion tag).
    pub fn data(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    pub fn references(&self) -> &[Arc<Cell>] {
        &self.references
    }

    pub fn reference_count(&self) -> usize {
        self.references.len()
    }

    pub fn reference(&self, index: usize) -> Result<Arc<Cell>> {
        self.references
            .get(index)
            .cloned()
            .ok_or_else(|| CellError::CellUnderflow(format!("no reference at index {}", index)))
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn is_exotic(&self) -> bool {
        self.cell_type.is_exotic()
    }

    pub fn level_mask(&self) -> LevelMask {
        self.level_mask
    }

    pub fn level(&self) -> u8 {
        self.level_mask.level()
    }

    /// The two descriptor bytes written before the cell data in the BoC
    /// format and hashed into the cell's identity.
    pub fn descriptors(&self) -> [u8; 2] {
        let d1 = self.references.len() as u8
            + if self.is_exotic() { 8 } else { 0 }
            + 32 * self.level_mask.mask();
        let d2 = (self.bit_len() / 8 + (self.bit_len() + 7) / 8) as u8;
        [d1, d2]
    }
}

impl PartialEq for Cell {
    /// Content equality: two differently built DAGs that normalize to the
    /// same content compare equal.
    fn eq(&self, other: &Cell) -> bool {
        self.hash(0) == other.hash(0)
    }
}

impl Eq for Cell {}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cell<{}>({} bits, {} refs, {})",
            self.cell_type,
            self.bit_len(),
            self.reference_count(),
            hex::encode(self.repr_hash())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_cell() {
        let cell = Cell::ordinary(BitString::empty(), vec![]).unwrap();
        assert_eq!(cell.bit_len(), 0);
        assert_eq!(cell.reference_count(), 0);
        assert_eq!(cell.level(), 0);
        assert_eq!(cell.depth(0), 0);
        assert!(!cell.is_exotic());
    }

    #[test]
    fn test_known_hash() {
        let bits = BitString::from_bytes(vec![0x00, 0x00, 0x00, 0x0F], 32).unwrap();
        let cell = Cell::ordinary(bits, vec![]).unwrap();
        let expected =
            hex::decode("57b520dbcb9d135863fc33963cde9f6db2ded1430d88056810a2c9434a3860f9")
                .unwrap();
        assert_eq!(&cell.hash(0)[..], &expected[..]);
        assert_eq!(cell.hash(0), cell.repr_hash());
    }

    #[test]
    fn test_depth_follows_references() {
        let leaf = Cell::ordinary(BitString::empty(), vec![]).unwrap();
        let mid = Cell::ordinary(BitString::empty(), vec![leaf.clone()]).unwrap();
        let root = Cell::ordinary(BitString::empty(), vec![mid, leaf]).unwrap();
        assert_eq!(root.depth(0), 2);
    }

    #[test]
    fn test_equality_is_content_equality() {
        let a = Cell::ordinary(BitString::from_uint(0x55, 8).unwrap(), vec![]).unwrap();
        let b = Cell::ordinary(BitString::from_bytes(vec![0x55], 8).unwrap(), vec![]).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_bit_limit() {
        let bits = BitString::from_bytes(vec![0u8; 128], 1024).unwrap();
        assert!(matches!(
            Cell::ordinary(bits, vec![]),
            Err(CellError::CellOverflow(_))
        ));
    }

    #[test]
    fn test_level_mask_table() {
        assert_eq!(LevelMask::with_level(2).mask(), 3);
        assert_eq!(LevelMask::with_mask(0b101).level(), 2);
        assert_eq!(LevelMask::with_mask(1).hash_index(0), 0);
        assert_eq!(LevelMask::with_mask(1).hash_index(3), 1);
        assert_eq!(LevelMask::for_merkle_cell(LevelMask::with_mask(1)).mask(), 0);
    }

    #[test]
    fn test_exotic_rejects_ordinary() {
        assert!(Cell::exotic(CellType::Ordinary, BitString::empty(), vec![]).is_err());
    }

    #[test]
    fn test_malformed_pruned_branch() {
        // Too short for the declared level.
        let bits = BitString::from_bytes(vec![1, 1, 0, 0], 32).unwrap();
        assert!(Cell::exotic(CellType::PrunedBranch, bits, vec![]).is_err());
    }
}
