//! Dictionary: a fixed-key-width mapping stored as a binary prefix tree.
//!
//! Each tree node carries a label (the common prefix of every key below
//! it); a leaf inlines its value's bits and refs, a fork holds two refs
//! selected by the next key bit. Labels use whichever of the three
//! standard encodings is shortest, which makes the layout canonical: the
//! same mapping always serializes to the same cell tree.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::tvm::bitstring::BitString;
use crate::tvm::builder::Builder;
use crate::tvm::cell::{Cell, HASH_SIZE};
use crate::tvm::error::{CellError, Result};
use crate::tvm::proof::{make_merkle_proof, make_merkle_update, mark_subtree, prune_subtree};
use crate::tvm::slice::Slice;

/// A key→value mapping with fixed-width bit keys. Values are cells whose
/// content is inlined into the leaves on serialization.
#[derive(Debug, Clone)]
pub struct Dict {
    key_width: usize,
    entries: BTreeMap<BitString, Arc<Cell>>,
}

impl Dict {
    pub fn new(key_width: usize) -> Self {
        Self {
            key_width,
            entries: BTreeMap::new(),
        }
    }

    pub fn key_width(&self) -> usize {
        self.key_width
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_key(&self, key: &BitString) -> Result<()> {
        if key.len() != self.key_width {
            return Err(CellError::DictFormat(format!(
                "key of {} bits in a dictionary with {}-bit keys",
                key.len(),
                self.key_width
            )));
        }
        Ok(())
    }

    /// Inserts or replaces a value.
    pub fn set(&mut self, key: BitString, value: Arc<Cell>) -> Result<()> {
        self.check_key(&key)?;
        self.entries.insert(key, value);
        Ok(())
    }

    /// Convenience insert for integer keys.
    pub fn set_uint(&mut self, key: u64, value: Arc<Cell>) -> Result<()> {
        self.set(BitString::from_uint(key, self.key_width)?, value)
    }

    pub fn get(&self, key: &BitString) -> Option<&Arc<Cell>> {
        self.entries.get(key)
    }

    pub fn get_uint(&self, key: u64) -> Result<Option<&Arc<Cell>>> {
        Ok(self.entries.get(&BitString::from_uint(key, self.key_width)?))
    }

    /// Removes a key, returning its value when present.
    pub fn remove(&mut self, key: &BitString) -> Option<Arc<Cell>> {
        self.entries.remove(key)
    }

    /// Iterates the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&BitString, &Arc<Cell>)> {
        self.entries.iter()
    }

    /// Serializes into a cell tree; an empty dictionary has no root.
    pub fn serialize(&self) -> Result<Option<Arc<Cell>>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let entries: Vec<(&BitString, &Arc<Cell>)> = self.entries.iter().collect();
        serialize_edge(&entries, 0, self.key_width).map(Some)
    }

    /// Rebuilds the full mapping from a serialized tree.
    pub fn parse(root: &Arc<Cell>, key_width: usize) -> Result<Dict> {
        let mut dict = Dict::new(key_width);
        parse_edge(root, BitString::empty(), &mut dict)?;
        Ok(dict)
    }

    /// Looks one key up in a serialized tree without materializing it.
    /// Returns the slice positioned at the leaf's value on success.
    pub fn get_from_cell(
        root: &Arc<Cell>,
        key_width: usize,
        key: &BitString,
    ) -> Result<Option<Slice>> {
        if key.len() != key_width {
            return Err(CellError::DictFormat(format!(
                "key of {} bits in a dictionary with {}-bit keys",
                key.len(),
                key_width
            )));
        }
        let mut cell = root.clone();
        let mut at = 0;
        loop {
            let mut slice = Slice::new(cell);
            let label = read_label(&mut slice, key_width - at)?;
            if label != key.substring(at, label.len())? {
                return Ok(None);
            }
            at += label.len();
            if at == key_width {
                return Ok(Some(slice));
            }
            let bit = key.get(at)?;
            at += 1;
            let left = slice.load_ref()?;
            let right = slice.load_ref()?;
            cell = if bit { right } else { left };
        }
    }

    /// Builds a Merkle proof revealing only the access paths of `keys`;
    /// every other subtree is replaced by a pruned branch, so the revealed
    /// tree's level-0 hash equals the full dictionary's root hash.
    pub fn generate_merkle_proof(&self, keys: &[BitString]) -> Result<Arc<Cell>> {
        let root = self.serialize()?.ok_or_else(|| {
            CellError::DictFormat("cannot prove against an empty dictionary".to_string())
        })?;
        let mut keep: HashSet<[u8; HASH_SIZE]> = HashSet::new();
        for key in keys {
            collect_access_path(&root, self.key_width, key, &mut keep)?;
        }
        let revealed = prune_subtree(&root, &keep)?;
        make_merkle_proof(&revealed)
    }

    /// Builds a Merkle update for a single key: both the before (`self`)
    /// and after (`after`) trees pruned to that key's access path, wrapped
    /// in one update cell.
    pub fn generate_merkle_update(&self, after: &Dict, key: &BitString) -> Result<Arc<Cell>> {
        if self.key_width != after.key_width {
            return Err(CellError::DictFormat(format!(
                "key widths differ: {} vs {}",
                self.key_width, after.key_width
            )));
        }
        let prune_to_key = |dict: &Dict| -> Result<Arc<Cell>> {
            let root = dict.serialize()?.ok_or_else(|| {
                CellError::DictFormat("cannot prove against an empty dictionary".to_string())
            })?;
            let mut keep = HashSet::new();
            collect_access_path(&root, dict.key_width, key, &mut keep)?;
            prune_subtree(&root, &keep)
        };
        let old_root = prune_to_key(self)?;
        let new_root = prune_to_key(after)?;
        make_merkle_update(&old_root, &new_root)
    }
}

/// Builder extension mirroring `Slice::load_dict`.
impl Builder {
    /// Serializes and stores a dictionary behind a presence bit.
    pub fn store_dictionary(&mut self, dict: &Dict) -> Result<&mut Self> {
        self.store_dict(dict.serialize()?)
    }
}

/// Slice extension for dictionaries with a known key width.
impl Slice {
    /// Loads a dictionary root and parses the full mapping.
    pub fn load_dictionary(&mut self, key_width: usize) -> Result<Dict> {
        match self.load_dict()? {
            Some(root) => Dict::parse(&root, key_width),
            None => Ok(Dict::new(key_width)),
        }
    }
}

fn serialize_edge(
    entries: &[(&BitString, &Arc<Cell>)],
    at: usize,
    key_width: usize,
) -> Result<Arc<Cell>> {
    let capacity = key_width - at;
    let first = entries[0].0.substring(at, capacity)?;
    let mut label_len = capacity;
    for (key, _) in &entries[1..] {
        let suffix = key.substring(at, capacity)?;
        label_len = label_len.min(first.common_prefix_len(&suffix));
    }
    let label = first.substring(0, label_len)?;

    let mut builder = Builder::new();
    write_label(&mut builder, &label, capacity)?;

    if entries.len() == 1 {
        let value = entries[0].1;
        builder.store_bitstring(value.bits())?;
        for reference in value.references() {
            builder.store_ref(reference.clone())?;
        }
        return builder.end_cell();
    }

    // Keys are sorted, so entries split cleanly on the divergence bit.
    let mut split = entries.len();
    for (i, (key, _)) in entries.iter().enumerate() {
        if key.get(at + label_len)? {
            split = i;
            break;
        }
    }
    if split == 0 || split == entries.len() {
        return Err(CellError::DictFormat(
            "fork without divergence, keys are not distinct".to_string(),
        ));
    }
    let next = at + label_len + 1;
    builder.store_ref(serialize_edge(&entries[..split], next, key_width)?)?;
    builder.store_ref(serialize_edge(&entries[split..], next, key_width)?)?;
    builder.end_cell()
}

fn parse_edge(cell: &Arc<Cell>, prefix: BitString, dict: &mut Dict) -> Result<()> {
    let mut slice = Slice::new(cell.clone());
    let label = read_label(&mut slice, dict.key_width - prefix.len())?;
    let prefix = prefix.concat(&label);

    if prefix.len() == dict.key_width {
        let bits = slice.load_remaining_bits()?;
        let refs = slice.load_remaining_refs()?;
        let mut builder = Builder::new();
        builder.store_bitstring(&bits)?;
        for reference in refs {
            builder.store_ref(reference)?;
        }
        let value = builder.end_cell()?;
        if dict.entries.insert(prefix, value).is_some() {
            return Err(CellError::DictFormat("duplicate key in tree".to_string()));
        }
        return Ok(());
    }

    let left = slice.load_ref()?;
    let right = slice.load_ref()?;
    slice.end_parse()?;
    parse_edge(&left, prefix.concat(&BitString::from_uint(0, 1)?), dict)?;
    parse_edge(&right, prefix.concat(&BitString::from_uint(1, 1)?), dict)
}

/// Walks the access path of `key`, marking every node on it; when the key
/// is present, the whole leaf subtree (the value) is revealed too. A
/// mismatching node is still marked, which proves the key's absence.
fn collect_access_path(
    root: &Arc<Cell>,
    key_width: usize,
    key: &BitString,
    keep: &mut HashSet<[u8; HASH_SIZE]>,
) -> Result<()> {
    if key.len() != key_width {
        return Err(CellError::DictFormat(format!(
            "key of {} bits in a dictionary with {}-bit keys",
            key.len(),
            key_width
        )));
    }
    let mut cell = root.clone();
    let mut at = 0;
    loop {
        let mut slice = Slice::new(cell.clone());
        let label = read_label(&mut slice, key_width - at)?;
        if label != key.substring(at, label.len())? {
            keep.insert(cell.repr_hash());
            return Ok(());
        }
        at += label.len();
        if at == key_width {
            mark_subtree(&cell, keep);
            return Ok(());
        }
        keep.insert(cell.repr_hash());
        let bit = key.get(at)?;
        at += 1;
        let left = slice.load_ref()?;
        let right = slice.load_ref()?;
        cell = if bit { right } else { left };
    }
}

/// Number of bits needed to express values up to `max`.
fn len_bits(max: usize) -> usize {
    (usize::BITS - max.leading_zeros()) as usize
}

/// Writes a node label, choosing the shortest of the three encodings.
/// On a same/short or same/long tie the explicit forms win; on a
/// short/long tie the short form wins.
fn write_label(builder: &mut Builder, label: &BitString, capacity: usize) -> Result<()> {
    let n = label.len();
    let clog = len_bits(capacity);
    let short_len = 2 * n + 2;
    let long_len = 2 + clog + n;
    let same_len = 3 + clog;

    let mut all_same = n > 0;
    for i in 1..n {
        if label.get(i)? != label.get(0)? {
            all_same = false;
            break;
        }
    }

    if all_same && same_len < short_len && same_len < long_len {
        // hml_same$11 v:Bit n:(#<= m)
        builder.store_uint(0b11, 2)?;
        builder.store_bit(label.get(0)?)?;
        builder.store_uint(n as u64, clog)?;
    } else if short_len <= long_len {
        // hml_short$0 {n:#} len:(Unary ~n) s:(n * Bit)
        builder.store_bit(false)?;
        for _ in 0..n {
            builder.store_bit(true)?;
        }
        builder.store_bit(false)?;
        builder.store_bitstring(label)?;
    } else {
        // hml_long$10 n:(#<= m) s:(n * Bit)
        builder.store_uint(0b10, 2)?;
        builder.store_uint(n as u64, clog)?;
        builder.store_bitstring(label)?;
    }
    Ok(())
}

/// Reads a node label in any of the three encodings.
fn read_label(slice: &mut Slice, capacity: usize) -> Result<BitString> {
    let clog = len_bits(capacity);
    if !slice.load_bit()? {
        // hml_short: unary length, then the bits.
        let mut n = 0;
        while slice.load_bit()? {
            n += 1;
            if n > capacity {
                return Err(CellError::DictFormat(format!(
                    "label of {} bits exceeds the {} remaining key bits",
                    n, capacity
                )));
            }
        }
        return slice.load_bitstring(n);
    }
    if !slice.load_bit()? {
        // hml_long: explicit length, then the bits.
        let n = slice.load_uint(clog)? as usize;
        if n > capacity {
            return Err(CellError::DictFormat(format!(
                "label of {} bits exceeds the {} remaining key bits",
                n, capacity
            )));
        }
        return slice.load_bitstring(n);
    }
    // hml_same: one repeated bit.
    let bit = slice.load_bit()?;
    let n = slice.load_uint(clog)? as usize;
    if n > capacity {
        return Err(CellError::DictFormat(format!(
            "label of {} bits exceeds the {} remaining key bits",
            n, capacity
        )));
    }
    let fill = if bit { 0xFFu8 } else { 0x00 };
    BitString::from_bytes(vec![fill; (n + 7) / 8], n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(data: u32) -> Arc<Cell> {
        let mut builder = Builder::new();
        builder.store_u32(data).unwrap();
        builder.end_cell().unwrap()
    }

    fn slice_value(slice: &mut Slice) -> u32 {
        slice.load_uint(32).unwrap() as u32
    }

    #[test]
    fn test_round_trip_small() {
        let mut dict = Dict::new(16);
        dict.set_uint(5, value(500)).unwrap();
        dict.set_uint(9, value(900)).unwrap();
        dict.set_uint(0xFFFF, value(1)).unwrap();

        let root = dict.serialize().unwrap().unwrap();
        let parsed = Dict::parse(&root, 16).unwrap();
        assert_eq!(parsed.len(), 3);
        for (key, val) in dict.iter() {
            assert_eq!(parsed.get(key).unwrap().repr_hash(), val.repr_hash());
        }
    }

    #[test]
    fn test_empty_dict_has_no_root() {
        let dict = Dict::new(8);
        assert!(dict.serialize().unwrap().is_none());
    }

    #[test]
    fn test_single_entry_leaf() {
        let mut dict = Dict::new(8);
        dict.set_uint(0xAB, value(1)).unwrap();
        let root = dict.serialize().unwrap().unwrap();
        // One leaf, no forks.
        assert_eq!(root.reference_count(), 0);
        let parsed = Dict::parse(&root, 8).unwrap();
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn test_lookup_without_materializing() {
        let mut dict = Dict::new(32);
        for i in 0..20u64 {
            dict.set_uint(i * 7, value(i as u32)).unwrap();
        }
        let root = dict.serialize().unwrap().unwrap();

        let key = BitString::from_uint(7 * 3, 32).unwrap();
        let mut found = Dict::get_from_cell(&root, 32, &key).unwrap().unwrap();
        assert_eq!(slice_value(&mut found), 3);

        let missing = BitString::from_uint(8, 32).unwrap();
        assert!(Dict::get_from_cell(&root, 32, &missing).unwrap().is_none());
    }

    #[test]
    fn test_key_width_enforced() {
        let mut dict = Dict::new(8);
        let wide_key = BitString::from_uint(1, 16).unwrap();
        assert!(dict.set(wide_key, value(0)).is_err());
    }

    #[test]
    fn test_serialization_is_canonical() {
        let mut a = Dict::new(16);
        let mut b = Dict::new(16);
        for i in [9u64, 5, 1000, 3] {
            a.set_uint(i, value(i as u32)).unwrap();
        }
        for i in [3u64, 1000, 5, 9] {
            b.set_uint(i, value(i as u32)).unwrap();
        }
        let root_a = a.serialize().unwrap().unwrap();
        let root_b = b.serialize().unwrap().unwrap();
        assert_eq!(root_a.repr_hash(), root_b.repr_hash());
    }

    #[test]
    fn test_label_same_form_round_trip() {
        // Keys 0x0000 and 0x8000 diverge at bit 0; the all-zero leaf label
        // of 15 bits takes the hml_same form.
        let mut dict = Dict::new(16);
        dict.set_uint(0x0000, value(1)).unwrap();
        dict.set_uint(0x8000, value(2)).unwrap();
        let root = dict.serialize().unwrap().unwrap();
        let parsed = Dict::parse(&root, 16).unwrap();
        assert_eq!(parsed.len(), 2);
        let mut found = Dict::get_from_cell(&root, 16, &BitString::from_uint(0x8000, 16).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(slice_value(&mut found), 2);
    }

    #[test]
    fn test_read_label_rejects_overlong() {
        // hml_long with a length larger than the remaining key bits.
        let mut builder = Builder::new();
        builder.store_uint(0b10, 2).unwrap();
        builder.store_uint(9, 4).unwrap(); // capacity 8 -> clog 4
        builder.store_uint(0, 9).unwrap();
        let mut slice = builder.into_slice().unwrap();
        assert!(matches!(
            read_label(&mut slice, 8),
            Err(CellError::DictFormat(_))
        ));
    }

    #[test]
    fn test_values_with_refs_survive() {
        let mut inner = Builder::new();
        inner.store_byte(0x77).unwrap();
        let inner = inner.end_cell().unwrap();
        let mut outer = Builder::new();
        outer.store_byte(0x01).unwrap();
        outer.store_ref(inner).unwrap();
        let val = outer.end_cell().unwrap();

        let mut dict = Dict::new(8);
        dict.set_uint(3, val.clone()).unwrap();
        dict.set_uint(4, value(9)).unwrap();
        let root = dict.serialize().unwrap().unwrap();
        let parsed = Dict::parse(&root, 8).unwrap();
        let restored = parsed
            .get(&BitString::from_uint(3, 8).unwrap())
            .unwrap();
        assert_eq!(restored.repr_hash(), val.repr_hash());
    }

    #[test]
    fn test_merkle_proof_preserves_root_hash() {
        let mut dict = Dict::new(16);
        for i in 0..32u64 {
            dict.set_uint(i * 3, value(i as u32)).unwrap();
        }
        let root = dict.serialize().unwrap().unwrap();
        let key = BitString::from_uint(15, 16).unwrap();

        let proof = dict.generate_merkle_proof(std::slice::from_ref(&key)).unwrap();
        let revealed = proof.reference(0).unwrap();
        assert_eq!(revealed.hash(0), root.hash(0));

        // The proof still answers the lookup it was built for.
        let mut found = Dict::get_from_cell(&revealed, 16, &key).unwrap().unwrap();
        assert_eq!(slice_value(&mut found), 5);
    }

    #[test]
    fn test_merkle_update_pairs_states() {
        let mut before = Dict::new(8);
        before.set_uint(1, value(100)).unwrap();
        before.set_uint(2, value(200)).unwrap();
        let mut after = before.clone();
        after.set_uint(2, value(201)).unwrap();

        let key = BitString::from_uint(2, 8).unwrap();
        let update = before.generate_merkle_update(&after, &key).unwrap();
        assert_eq!(update.reference_count(), 2);
        assert_eq!(
            update.reference(0).unwrap().hash(0),
            before.serialize().unwrap().unwrap().hash(0)
        );
        assert_eq!(
            update.reference(1).unwrap().hash(0),
            after.serialize().unwrap().unwrap().hash(0)
        );
    }
}
