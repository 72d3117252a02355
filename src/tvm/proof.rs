//! Merkle constructs: pruned branches, proof and update cells.
//!
//! A pruned branch replaces a subtree with its hash and depth; a Merkle
//! proof wraps a partially revealed tree and certifies its original root
//! hash; a Merkle update pairs the before/after states of one change.

use std::collections::HashSet;
use std::sync::Arc;

use crate::tvm::builder::Builder;
use crate::tvm::cell::{Cell, CellType, HASH_SIZE};
use crate::tvm::error::{CellError, Result};
use crate::tvm::slice::Slice;

/// Builds a pruned branch standing in for a level-0 subtree.
pub fn make_pruned_branch(cell: &Arc<Cell>) -> Result<Arc<Cell>> {
    if cell.level_mask().mask() != 0 {
        return Err(CellError::RangeCheck(
            "only level-0 subtrees can be pruned".to_string(),
        ));
    }
    let mut builder = Builder::new();
    builder.store_byte(CellType::PrunedBranch.tag())?;
    builder.store_byte(0x01)?; // level mask
    builder.store_bytes(&cell.hash(0))?;
    builder.store_uint(cell.depth(0) as u64, 16)?;
    builder.end_exotic(CellType::PrunedBranch)
}

/// Wraps a (possibly pruned) tree in a Merkle proof cell certifying the
/// tree's level-0 hash and depth.
pub fn make_merkle_proof(virtual_root: &Arc<Cell>) -> Result<Arc<Cell>> {
    let mut builder = Builder::new();
    builder.store_byte(CellType::MerkleProof.tag())?;
    builder.store_bytes(&virtual_root.hash(0))?;
    builder.store_uint(virtual_root.depth(0) as u64, 16)?;
    builder.store_ref(virtual_root.clone())?;
    builder.end_exotic(CellType::MerkleProof)
}

/// Wraps the before/after trees of a single change in a Merkle update cell.
pub fn make_merkle_update(old_root: &Arc<Cell>, new_root: &Arc<Cell>) -> Result<Arc<Cell>> {
    let mut builder = Builder::new();
    builder.store_byte(CellType::MerkleUpdate.tag())?;
    builder.store_bytes(&old_root.hash(0))?;
    builder.store_bytes(&new_root.hash(0))?;
    builder.store_uint(old_root.depth(0) as u64, 16)?;
    builder.store_uint(new_root.depth(0) as u64, 16)?;
    builder.store_ref(old_root.clone())?;
    builder.store_ref(new_root.clone())?;
    builder.end_exotic(CellType::MerkleUpdate)
}

/// The level-0 hash a Merkle proof cell certifies.
pub fn merkle_proof_hash(proof: &Arc<Cell>) -> Result<[u8; HASH_SIZE]> {
    if proof.cell_type() != CellType::MerkleProof {
        return Err(CellError::RangeCheck(format!(
            "expected a merkle proof cell, got {}",
            proof.cell_type()
        )));
    }
    let mut slice = Slice::new(proof.clone());
    slice.skip_bits(8)?;
    let bytes = slice.load_bytes(HASH_SIZE)?;
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

/// Rebuilds `cell` with every subtree outside `keep` replaced by a pruned
/// branch. Subtrees whose every node is kept are shared as-is, so the
/// level-0 hash of the result equals the original's.
pub(crate) fn prune_subtree(
    cell: &Arc<Cell>,
    keep: &HashSet<[u8; HASH_SIZE]>,
) -> Result<Arc<Cell>> {
    if !keep.contains(&cell.repr_hash()) {
        return make_pruned_branch(cell);
    }
    let mut changed = false;
    let mut references = Vec::with_capacity(cell.reference_count());
    for child in cell.references() {
        let pruned = prune_subtree(child, keep)?;
        if pruned.repr_hash() != child.repr_hash() {
            changed = true;
        }
        references.push(pruned);
    }
    if !changed {
        return Ok(cell.clone());
    }
    if cell.is_exotic() {
        return Err(CellError::RangeCheck(
            "cannot prune below an exotic cell".to_string(),
        ));
    }
    Cell::ordinary(cell.bits().clone(), references)
}

/// Marks a whole subtree as kept.
pub(crate) fn mark_subtree(cell: &Arc<Cell>, keep: &mut HashSet<[u8; HASH_SIZE]>) {
    if !keep.insert(cell.repr_hash()) {
        return;
    }
    for child in cell.references() {
        mark_subtree(child, keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvm::builder::Builder;

    fn sample_tree() -> Arc<Cell> {
        let mut leaf = Builder::new();
        leaf.store_u32(7).unwrap();
        let leaf = leaf.end_cell().unwrap();
        let mut root = Builder::new();
        root.store_byte(0xAB).unwrap();
        root.store_ref(leaf).unwrap();
        root.end_cell().unwrap()
    }

    #[test]
    fn test_pruned_branch_answers_for_subtree() {
        let tree = sample_tree();
        let pruned = make_pruned_branch(&tree).unwrap();
        assert_eq!(pruned.cell_type(), CellType::PrunedBranch);
        assert_eq!(pruned.level(), 1);
        assert_eq!(pruned.hash(0), tree.hash(0));
        assert_eq!(pruned.depth(0), tree.depth(0));
        // The pruned cell's own identity differs from the subtree's.
        assert_ne!(pruned.repr_hash(), tree.repr_hash());
    }

    #[test]
    fn test_merkle_proof_certifies_hash() {
        let tree = sample_tree();
        let proof = make_merkle_proof(&tree).unwrap();
        assert_eq!(proof.cell_type(), CellType::MerkleProof);
        assert_eq!(proof.level(), 0);
        assert_eq!(merkle_proof_hash(&proof).unwrap(), tree.hash(0));
    }

    #[test]
    fn test_merkle_update_layout() {
        let old = sample_tree();
        let mut b = Builder::new();
        b.store_u32(9).unwrap();
        let new = b.end_cell().unwrap();
        let update = make_merkle_update(&old, &new).unwrap();
        assert_eq!(update.cell_type(), CellType::MerkleUpdate);
        assert_eq!(update.reference_count(), 2);
        assert_eq!(update.bit_len(), 8 * 69);
    }

    #[test]
    fn test_prune_preserves_root_hash() {
        let tree = sample_tree();
        let mut keep = HashSet::new();
        keep.insert(tree.repr_hash());
        let pruned = prune_subtree(&tree, &keep).unwrap();
        assert_eq!(pruned.hash(0), tree.hash(0));
        assert_eq!(pruned.level(), 1);
        assert_eq!(
            pruned.reference(0).unwrap().cell_type(),
            CellType::PrunedBranch
        );
    }
}
