//! Bag of Cells (BoC): the canonical binary container for a cell DAG.
//!
//! Cells are emitted in a canonical order where every reference points to a
//! cell with a strictly smaller index, so deserialization is a single
//! forward pass. Shared subtrees are deduplicated by representation hash.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::crc::CRC32C;
use crate::tvm::bitstring::BitString;
use crate::tvm::cell::{Cell, CellType, LevelMask, MAX_CELL_REFS};
use crate::tvm::error::{CellError, Result};

/// Magic tag of the generic BoC container.
const BOC_GENERIC_MAGIC: u32 = 0xb5ee9c72;

/// Magic tags of the legacy indexed containers (not supported).
const BOC_INDEXED_MAGIC: u32 = 0x68ff65f3;
const BOC_INDEXED_CRC32C_MAGIC: u32 = 0xacc3a728;

/// Defensive bound on the DAG traversal; a well-formed input never gets
/// near it, a malformed one fails instead of hanging.
const MAX_TRAVERSAL_STEPS: usize = 100_000;

/// Serialization options for the optional container sections.
#[derive(Debug, Clone, Copy, Default)]
pub struct BocOptions {
    /// Emit the cumulative offset index after the root list.
    pub has_index: bool,
    /// Append a CRC32C checksum over the whole container.
    pub has_crc32: bool,
}

/// Serializes a set of root cells (and everything they reference) into a
/// BoC container.
pub fn serialize_boc(roots: &[Arc<Cell>], options: BocOptions) -> Result<Vec<u8>> {
    if roots.is_empty() {
        return Err(CellError::BocFormat("no roots to serialize".to_string()));
    }

    let cells = collect_cells(roots)?;
    let mut index_of: HashMap<[u8; 32], usize> = HashMap::with_capacity(cells.len());
    for (idx, cell) in cells.iter().enumerate() {
        index_of.insert(cell.repr_hash(), idx);
    }

    let ref_size = bytes_needed(cells.len() as u64);
    let mut cell_data = Vec::new();
    let mut offsets = Vec::with_capacity(cells.len());
    for cell in &cells {
        serialize_cell(cell, &index_of, ref_size, &mut cell_data)?;
        offsets.push(cell_data.len() as u64);
    }
    let offset_size = bytes_needed(cell_data.len() as u64);

    let mut out = Vec::new();
    let mut magic = [0u8; 4];
    BigEndian::write_u32(&mut magic, BOC_GENERIC_MAGIC);
    out.extend_from_slice(&magic);

    let flags = (options.has_index as u8) << 7 | (options.has_crc32 as u8) << 6;
    out.push(flags | ref_size as u8);
    out.push(offset_size as u8);

    write_uint(&mut out, cells.len() as u64, ref_size);
    write_uint(&mut out, roots.len() as u64, ref_size);
    write_uint(&mut out, 0, ref_size); // absent cells
    write_uint(&mut out, cell_data.len() as u64, offset_size);

    for root in roots {
        let idx = index_of.get(&root.repr_hash()).ok_or_else(|| {
            CellError::BocFormat("root missing from collected cells".to_string())
        })?;
        write_uint(&mut out, *idx as u64, ref_size);
    }

    if options.has_index {
        for offset in &offsets {
            write_uint(&mut out, *offset, offset_size);
        }
    }

    out.extend_from_slice(&cell_data);

    if options.has_crc32 {
        let crc = CRC32C.checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
    }

    debug!(
        target: "boc",
        "serialized {} cells ({} roots) into {} bytes",
        cells.len(),
        roots.len(),
        out.len()
    );
    Ok(out)
}

/// Single-root convenience wrapper.
pub fn serialize_boc_root(root: &Arc<Cell>, has_crc32: bool) -> Result<Vec<u8>> {
    serialize_boc(
        std::slice::from_ref(root),
        BocOptions {
            has_index: false,
            has_crc32,
        },
    )
}

/// Deserializes a BoC container, returning its root cells.
pub fn deserialize_boc(data: &[u8]) -> Result<Vec<Arc<Cell>>> {
    if data.len() < 6 {
        return Err(CellError::BocFormat("container too short".to_string()));
    }

    let magic = BigEndian::read_u32(&data[0..4]);
    match magic {
        BOC_GENERIC_MAGIC => {}
        BOC_INDEXED_MAGIC | BOC_INDEXED_CRC32C_MAGIC => {
            return Err(CellError::BocFormat(
                "legacy indexed containers are not supported".to_string(),
            ));
        }
        _ => {
            return Err(CellError::BocFormat(format!(
                "invalid magic {:#010x}",
                magic
            )));
        }
    }

    let flags = data[4];
    let has_index = flags & 0x80 != 0;
    let has_crc32 = flags & 0x40 != 0;
    let has_cache_bits = flags & 0x20 != 0;
    if flags & 0x18 != 0 {
        return Err(CellError::BocFormat("reserved flag bits set".to_string()));
    }
    if has_cache_bits {
        return Err(CellError::BocFormat(
            "cached-hash containers are not supported".to_string(),
        ));
    }
    let ref_size = (flags & 0x07) as usize;
    if ref_size == 0 || ref_size > 4 {
        return Err(CellError::BocFormat(format!(
            "invalid ref index size {}",
            ref_size
        )));
    }
    let offset_size = data[5] as usize;
    if offset_size == 0 || offset_size > 8 {
        return Err(CellError::BocFormat(format!(
            "invalid offset size {}",
            offset_size
        )));
    }

    let mut pos = 6;
    let cell_count = read_uint(data, &mut pos, ref_size)? as usize;
    let root_count = read_uint(data, &mut pos, ref_size)? as usize;
    let absent_count = read_uint(data, &mut pos, ref_size)?;
    if root_count == 0 {
        return Err(CellError::BocFormat("container has no roots".to_string()));
    }
    if absent_count != 0 {
        return Err(CellError::BocFormat(
            "absent cells are not supported".to_string(),
        ));
    }
    let total_size = read_uint(data, &mut pos, offset_size)? as usize;

    let mut root_indices = Vec::with_capacity(root_count);
    for _ in 0..root_count {
        let idx = read_uint(data, &mut pos, ref_size)? as usize;
        if idx >= cell_count {
            return Err(CellError::BocFormat(format!(
                "root index {} out of range",
                idx
            )));
        }
        root_indices.push(idx);
    }

    if has_index {
        // The index only speeds up random access; a forward pass does not
        // need it, but its size must still be consistent.
        let index_len = cell_count * offset_size;
        if pos + index_len > data.len() {
            return Err(CellError::BocFormat("truncated offset index".to_string()));
        }
        pos += index_len;
    }

    let cells_start = pos;
    let cells_end = cells_start
        .checked_add(total_size)
        .ok_or_else(|| CellError::BocFormat("cell section size overflow".to_string()))?;
    let tail = if has_crc32 { 4 } else { 0 };
    if cells_end + tail != data.len() {
        return Err(CellError::BocFormat(format!(
            "container length mismatch: expected {}, got {}",
            cells_end + tail,
            data.len()
        )));
    }

    if has_crc32 {
        let expected = u32::from_le_bytes([
            data[cells_end],
            data[cells_end + 1],
            data[cells_end + 2],
            data[cells_end + 3],
        ]);
        let actual = CRC32C.checksum(&data[..cells_end]);
        if expected != actual {
            return Err(CellError::ChecksumMismatch { expected, actual });
        }
    }

    let cells = parse_cells(&data[cells_start..cells_end], cell_count, ref_size)?;

    debug!(
        target: "boc",
        "deserialized {} cells ({} roots) from {} bytes",
        cells.len(),
        root_count,
        data.len()
    );
    Ok(root_indices.into_iter().map(|i| cells[i].clone()).collect())
}

/// Deserializes a container that must hold exactly one root.
pub fn deserialize_boc_root(data: &[u8]) -> Result<Arc<Cell>> {
    let mut roots = deserialize_boc(data)?;
    if roots.len() != 1 {
        return Err(CellError::BocFormat(format!(
            "expected a single root, got {}",
            roots.len()
        )));
    }
    Ok(roots.remove(0))
}

/// Forward pass over the cell data section. Every reference must point to
/// an already-built cell, which also rules out reference cycles on the wire.
fn parse_cells(data: &[u8], count: usize, ref_size: usize) -> Result<Vec<Arc<Cell>>> {
    let mut cells: Vec<Arc<Cell>> = Vec::with_capacity(count);
    let mut pos = 0;

    for i in 0..count {
        if pos + 2 > data.len() {
            return Err(CellError::BocFormat("truncated cell descriptor".to_string()));
        }
        let d1 = data[pos];
        let d2 = data[pos + 1];
        pos += 2;

        let ref_count = (d1 & 0x07) as usize;
        if ref_count > MAX_CELL_REFS {
            return Err(CellError::BocFormat(format!(
                "cell {} claims {} references",
                i, ref_count
            )));
        }
        let is_exotic = d1 & 0x08 != 0;
        if d1 & 0x10 != 0 {
            return Err(CellError::BocFormat(
                "cells with stored hashes are not supported".to_string(),
            ));
        }
        let mask = LevelMask::with_mask(d1 >> 5);

        let data_size = (d2 as usize + 1) / 2;
        if pos + data_size > data.len() {
            return Err(CellError::BocFormat("truncated cell data".to_string()));
        }
        let raw = data[pos..pos + data_size].to_vec();
        pos += data_size;

        let bit_len = if d2 % 2 == 0 {
            data_size * 8
        } else {
            // Unaligned content carries a completion tag in its last byte.
            let last = raw[data_size - 1];
            if last == 0 {
                return Err(CellError::BocFormat(format!(
                    "cell {} is missing its completion tag",
                    i
                )));
            }
            data_size * 8 - last.trailing_zeros() as usize - 1
        };

        let mut references = Vec::with_capacity(ref_count);
        for _ in 0..ref_count {
            let idx = read_uint(data, &mut pos, ref_size)? as usize;
            if idx >= i {
                return Err(CellError::BocFormat(format!(
                    "cell {} references cell {} which is not built yet",
                    i, idx
                )));
            }
            references.push(cells[idx].clone());
        }

        let bits = BitString::from_bytes(raw, bit_len)?;
        let cell = if is_exotic {
            let tag = bits
                .substring(0, 8)
                .and_then(|b| b.to_uint())
                .map_err(|_| {
                    CellError::BocFormat(format!("cell {} has no exotic type tag", i))
                })?;
            Cell::exotic(CellType::from_tag(tag as u8)?, bits, references)?
        } else {
            Cell::ordinary(bits, references)?
        };
        if cell.level_mask() != mask {
            return Err(CellError::BocFormat(format!(
                "cell {} declares level mask {:#05b}, computed {:#05b}",
                i,
                mask.mask(),
                cell.level_mask().mask()
            )));
        }
        cells.push(cell);
    }

    if pos != data.len() {
        return Err(CellError::BocFormat(format!(
            "{} trailing bytes after the last cell",
            data.len() - pos
        )));
    }
    Ok(cells)
}

fn serialize_cell(
    cell: &Arc<Cell>,
    index_of: &HashMap<[u8; 32], usize>,
    ref_size: usize,
    out: &mut Vec<u8>,
) -> Result<()> {
    out.extend_from_slice(&cell.descriptors());
    out.extend_from_slice(&cell.bits().to_padded_bytes());
    for reference in cell.references() {
        let idx = index_of.get(&reference.repr_hash()).ok_or_else(|| {
            CellError::BocFormat("reference missing from collected cells".to_string())
        })?;
        write_uint(out, *idx as u64, ref_size);
    }
    Ok(())
}

enum Frame {
    Enter(Arc<Cell>),
    Exit(Arc<Cell>),
}

/// Canonical ordering: an iterative depth-first walk that emits every cell
/// after all of its children, visiting children in reference order and
/// deduplicating by representation hash. A revisit of an in-progress cell
/// means the graph has a cycle.
fn collect_cells(roots: &[Arc<Cell>]) -> Result<Vec<Arc<Cell>>> {
    let mut order: Vec<Arc<Cell>> = Vec::new();
    let mut done: HashSet<[u8; 32]> = HashSet::new();
    let mut in_progress: HashSet<[u8; 32]> = HashSet::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut steps = 0usize;

    for root in roots {
        stack.push(Frame::Enter(root.clone()));
        while let Some(frame) = stack.pop() {
            steps += 1;
            if steps > MAX_TRAVERSAL_STEPS {
                return Err(CellError::BocFormat(format!(
                    "traversal exceeded {} steps",
                    MAX_TRAVERSAL_STEPS
                )));
            }
            match frame {
                Frame::Enter(cell) => {
                    let hash = cell.repr_hash();
                    if done.contains(&hash) {
                        continue;
                    }
                    if !in_progress.insert(hash) {
                        return Err(CellError::NotADag);
                    }
                    stack.push(Frame::Exit(cell.clone()));
                    for child in cell.references().iter().rev() {
                        stack.push(Frame::Enter(child.clone()));
                    }
                }
                Frame::Exit(cell) => {
                    let hash = cell.repr_hash();
                    in_progress.remove(&hash);
                    if done.insert(hash) {
                        order.push(cell);
                    }
                }
            }
        }
    }
    Ok(order)
}

fn bytes_needed(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    ((64 - value.leading_zeros()) as usize + 7) / 8
}

fn write_uint(out: &mut Vec<u8>, value: u64, size: usize) {
    let mut buf = [0u8; 8];
    BigEndian::write_uint(&mut buf[..size], value, size);
    out.extend_from_slice(&buf[..size]);
}

fn read_uint(data: &[u8], pos: &mut usize, size: usize) -> Result<u64> {
    if *pos + size > data.len() {
        return Err(CellError::BocFormat(
            "unexpected end of container".to_string(),
        ));
    }
    let value = BigEndian::read_uint(&data[*pos..*pos + size], size);
    *pos += size;
    Ok(value)
}

/// Parses a hex-encoded container with a single root.
pub fn hex_to_boc(text: &str) -> Result<Arc<Cell>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact)
        .map_err(|e| CellError::BocFormat(format!("bad hex: {}", e)))?;
    deserialize_boc_root(&bytes)
}

/// Hex-encodes a single-root container.
pub fn boc_to_hex(root: &Arc<Cell>, has_crc32: bool) -> Result<String> {
    Ok(hex::encode(serialize_boc_root(root, has_crc32)?))
}

/// Base64-encodes a single-root container.
pub fn boc_to_base64(root: &Arc<Cell>, has_crc32: bool) -> Result<String> {
    let bytes = serialize_boc_root(root, has_crc32)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Parses a base64-encoded container with a single root.
pub fn base64_to_boc(text: &str) -> Result<Arc<Cell>> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| CellError::BocFormat(format!("bad base64: {}", e)))?;
    deserialize_boc_root(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvm::builder::Builder;

    fn leaf(value: u32) -> Arc<Cell> {
        let mut builder = Builder::new();
        builder.store_u32(value).unwrap();
        builder.end_cell().unwrap()
    }

    #[test]
    fn test_round_trip_simple() {
        let cell = leaf(0x12345678);
        let bytes = serialize_boc_root(&cell, false).unwrap();
        let restored = deserialize_boc_root(&bytes).unwrap();
        assert_eq!(cell.repr_hash(), restored.repr_hash());
    }

    #[test]
    fn test_round_trip_with_crc() {
        let cell = leaf(42);
        let bytes = serialize_boc_root(&cell, true).unwrap();
        let restored = deserialize_boc_root(&bytes).unwrap();
        assert_eq!(cell.repr_hash(), restored.repr_hash());
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let cell = leaf(42);
        let mut bytes = serialize_boc_root(&cell, true).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            deserialize_boc(&bytes),
            Err(CellError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_children_precede_parents() {
        let a = leaf(1);
        let b = leaf(2);
        let mut builder = Builder::new();
        builder.store_uint(13, 16).unwrap();
        builder.store_ref(a.clone()).unwrap();
        builder.store_ref(b.clone()).unwrap();
        let root = builder.end_cell().unwrap();

        let order = collect_cells(&[root.clone()]).unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].repr_hash(), a.repr_hash());
        assert_eq!(order[1].repr_hash(), b.repr_hash());
        assert_eq!(order[2].repr_hash(), root.repr_hash());
    }

    #[test]
    fn test_shared_subtree_deduplicated() {
        let shared = leaf(7);
        let mut left = Builder::new();
        left.store_ref(shared.clone()).unwrap();
        let left = left.end_cell().unwrap();
        let mut right = Builder::new();
        right.store_bit(true).unwrap();
        right.store_ref(shared.clone()).unwrap();
        let right = right.end_cell().unwrap();
        let mut root = Builder::new();
        root.store_ref(left).unwrap();
        root.store_ref(right).unwrap();
        let root = root.end_cell().unwrap();

        let order = collect_cells(&[root]).unwrap();
        // shared appears once: shared, left, right, root.
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_multi_root_round_trip() {
        let a = leaf(1);
        let mut b = Builder::new();
        b.store_ref(a.clone()).unwrap();
        let b = b.end_cell().unwrap();

        let bytes = serialize_boc(&[a.clone(), b.clone()], BocOptions::default()).unwrap();
        let roots = deserialize_boc(&bytes).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].repr_hash(), a.repr_hash());
        assert_eq!(roots[1].repr_hash(), b.repr_hash());
    }

    #[test]
    fn test_index_section_round_trip() {
        let cell = leaf(99);
        let options = BocOptions {
            has_index: true,
            has_crc32: true,
        };
        let bytes = serialize_boc(std::slice::from_ref(&cell), options).unwrap();
        let roots = deserialize_boc(&bytes).unwrap();
        assert_eq!(roots[0].repr_hash(), cell.repr_hash());
    }

    #[test]
    fn test_self_reference_rejected_on_wire() {
        // A hand-built container whose only cell references itself.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&BOC_GENERIC_MAGIC.to_be_bytes());
        bytes.push(0x01); // no index, no crc, ref size 1
        bytes.push(0x01); // offset size 1
        bytes.push(1); // cell count
        bytes.push(1); // root count
        bytes.push(0); // absent
        bytes.push(3); // total size
        bytes.push(0); // root index
        bytes.extend_from_slice(&[0x01, 0x00, 0x00]); // d1: 1 ref, d2: empty, ref -> 0
        let err = deserialize_boc(&bytes);
        assert!(matches!(err, Err(CellError::BocFormat(_))));
    }

    #[test]
    fn test_truncated_container_rejected() {
        let cell = leaf(5);
        let bytes = serialize_boc_root(&cell, false).unwrap();
        let err = deserialize_boc(&bytes[..bytes.len() - 1]);
        assert!(matches!(err, Err(CellError::BocFormat(_))));
    }

    #[test]
    fn test_hex_and_base64_helpers() {
        let cell = leaf(0xFEEDFACE);
        let text = boc_to_hex(&cell, false).unwrap();
        assert_eq!(hex_to_boc(&text).unwrap().repr_hash(), cell.repr_hash());
        let text = boc_to_base64(&cell, true).unwrap();
        assert_eq!(base64_to_boc(&text).unwrap().repr_hash(), cell.repr_hash());
    }

    #[test]
    fn test_unaligned_payload_round_trip() {
        let mut builder = Builder::new();
        builder.store_uint(0b10110, 5).unwrap();
        let cell = builder.end_cell().unwrap();
        let bytes = serialize_boc_root(&cell, false).unwrap();
        let restored = deserialize_boc_root(&bytes).unwrap();
        assert_eq!(restored.bit_len(), 5);
        assert_eq!(restored.repr_hash(), cell.repr_hash());
    }
}
