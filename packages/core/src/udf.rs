//! Minimal read-only UDF reader.
//!
//! Supports what is needed to look up directories on DVD and Blu-ray images:
//! the anchor volume descriptor pointer, the volume descriptor sequence,
//! type 1 (physical) and metadata partition maps, the file set descriptor,
//! file entries, extended file entries and file identifier descriptors.
//!
//! Structure offsets follow ECMA-167 3rd edition and OSTA UDF 2.60.

use tracing::{debug, trace};

use crate::block::{BlockInput, UDF_BLOCK_SIZE};
use crate::error::{Error, Result};

const TAG_PRIMARY_VOLUME: u16 = 1;
const TAG_ANCHOR: u16 = 2;
const TAG_PARTITION: u16 = 5;
const TAG_LOGICAL_VOLUME: u16 = 6;
const TAG_TERMINATING: u16 = 8;
const TAG_FILE_SET: u16 = 256;
const TAG_FILE_IDENTIFIER: u16 = 257;
const TAG_FILE_ENTRY: u16 = 261;
const TAG_EXTENDED_FILE_ENTRY: u16 = 266;

const ANCHOR_LBA: u32 = 256;
const FILE_TYPE_DIRECTORY: u8 = 4;
const FILE_TYPE_METADATA: u8 = 250;

const FID_DIRECTORY: u8 = 0x02;
const FID_DELETED: u8 = 0x04;
const FID_PARENT: u8 = 0x08;

/// Volume descriptor sequences longer than this are treated as corrupt.
const MAX_VDS_BLOCKS: u32 = 64;
/// Directories larger than this are treated as corrupt.
const MAX_DIRECTORY_BYTES: u64 = 16 * 1024 * 1024;

const METADATA_PARTITION_ID: &[u8] = b"*UDF Metadata Partition";

fn le_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn le_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn le_u64(buf: &[u8], off: usize) -> u64 {
    u64::from(le_u32(buf, off)) | (u64::from(le_u32(buf, off + 4)) << 32)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Udf {
        message: message.into(),
    }
}

/// Verifies the descriptor tag at the start of `buf`.
fn check_tag(buf: &[u8], expected: u16) -> Result<()> {
    if buf.len() < 16 {
        return Err(invalid("descriptor shorter than its tag"));
    }
    let id = le_u16(buf, 0);
    if id != expected {
        return Err(invalid(format!("expected tag {expected}, found {id}")));
    }
    let checksum = buf[..16]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 4)
        .fold(0u8, |acc, (_, b)| acc.wrapping_add(*b));
    if checksum != buf[4] {
        return Err(invalid(format!("bad checksum on tag {id}")));
    }
    Ok(())
}

/// Extent length field: the top two bits carry the extent type.
fn split_extent_length(raw: u32) -> (u8, u32) {
    ((raw >> 30) as u8, raw & 0x3fff_ffff)
}

fn blocks_for(bytes: u32) -> u32 {
    bytes.div_ceil(UDF_BLOCK_SIZE as u32)
}

/// Adds block addresses read from the image.
fn block_add(base: u32, offset: u32) -> Result<u32> {
    base.checked_add(offset).ok_or_else(|| invalid("block address overflow"))
}

/// `long_ad`: an extent anywhere in the logical volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LongAd {
    length: u32,
    block: u32,
    partition: u16,
}

impl LongAd {
    fn parse(buf: &[u8], off: usize) -> Self {
        Self {
            length: le_u32(buf, off),
            block: le_u32(buf, off + 4),
            partition: le_u16(buf, off + 8),
        }
    }
}

/// A recorded extent inside one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    kind: u8,
    length: u32,
    block: u32,
    partition: u16,
}

#[derive(Debug, Clone)]
enum Partition {
    /// Logical block n lives at physical block `start + n`.
    Physical { start: u32, length: u32 },
    /// Logical blocks are laid out by the extents of the metadata file,
    /// which are relative to the physical partition at `start`.
    Metadata { start: u32, extents: Vec<Extent> },
}

#[derive(Debug)]
struct PartitionDescriptor {
    number: u16,
    start: u32,
    length: u32,
}

#[derive(Debug)]
enum MapKind {
    Physical,
    Metadata { file_block: u32 },
}

#[derive(Debug)]
struct PartitionMapEntry {
    partition_number: u16,
    kind: MapKind,
}

#[derive(Debug)]
struct VolumeDescriptors {
    partitions: Vec<PartitionDescriptor>,
    maps: Vec<PartitionMapEntry>,
    file_set: LongAd,
}

#[derive(Debug)]
enum Allocation {
    Inline(Vec<u8>),
    Extents(Vec<Extent>),
}

#[derive(Debug)]
struct FileEntry {
    file_type: u8,
    info_length: u64,
    allocation: Allocation,
}

/// One named entry of a UDF directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    icb: LongAd,
}

/// An opened UDF directory and its listing.
#[derive(Debug, Clone)]
pub struct UdfDir {
    path: String,
    entries: Vec<DirEntry>,
}

impl UdfDir {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Entries other than the parent link, in on-disc order.
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }
}

/// An opened UDF volume.
///
/// Dropping the volume closes its block input.
pub struct Udf {
    input: Box<dyn BlockInput + Send>,
    partitions: Vec<Partition>,
    root: LongAd,
    volume_id: String,
}

impl std::fmt::Debug for Udf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Udf")
            .field("partitions", &self.partitions)
            .field("root", &self.root)
            .field("volume_id", &self.volume_id)
            .finish_non_exhaustive()
    }
}

impl Udf {
    /// Opens the volume on `input`.
    ///
    /// On failure the input is closed before the error is returned.
    pub fn open(mut input: Box<dyn BlockInput + Send>) -> Result<Self> {
        match Self::load(input.as_mut()) {
            Ok((partitions, root, volume_id)) => Ok(Self {
                input,
                partitions,
                root,
                volume_id,
            }),
            Err(e) => {
                input.close();
                Err(e)
            }
        }
    }

    /// Volume identifier from the primary volume descriptor, if recorded.
    pub fn volume_id(&self) -> &str {
        &self.volume_id
    }

    fn load(input: &mut dyn BlockInput) -> Result<(Vec<Partition>, LongAd, String)> {
        let anchor = read_anchor(input)?;
        let (main, reserve) = (
            (le_u32(&anchor, 20), le_u32(&anchor, 16)),
            (le_u32(&anchor, 28), le_u32(&anchor, 24)),
        );

        let (descriptors, volume_id) = match read_volume_descriptors(input, main.0, main.1) {
            Ok(found) => found,
            Err(e) => {
                debug!(error = %e, "main volume descriptor sequence unusable, trying reserve");
                read_volume_descriptors(input, reserve.0, reserve.1)?
            }
        };

        let partitions = build_partitions(input, &descriptors)?;

        let fsd = read_logical_block(
            input,
            &partitions,
            descriptors.file_set.partition,
            descriptors.file_set.block,
        )?;
        check_tag(&fsd, TAG_FILE_SET)?;
        let root = LongAd::parse(&fsd, 400);
        trace!(?root, "root directory ICB");

        Ok((partitions, root, volume_id))
    }

    /// Opens the directory at an absolute path such as `/BDMV`.
    ///
    /// Names are compared exactly; UDF preserves case.
    pub fn open_dir(&mut self, path: &str) -> Result<UdfDir> {
        let mut entry = self.read_file_entry(self.root)?;
        if entry.file_type != FILE_TYPE_DIRECTORY {
            return Err(invalid("root ICB is not a directory"));
        }

        for component in path.split('/').filter(|c| !c.is_empty()) {
            let listing = self.list(&entry)?;
            let child = listing
                .into_iter()
                .find(|e| e.is_dir && e.name == component)
                .ok_or_else(|| Error::UdfNotFound {
                    path: path.to_string(),
                })?;

            entry = self.read_file_entry(child.icb)?;
            if entry.file_type != FILE_TYPE_DIRECTORY {
                return Err(Error::UdfNotFound {
                    path: path.to_string(),
                });
            }
        }

        Ok(UdfDir {
            path: path.to_string(),
            entries: self.list(&entry)?,
        })
    }

    fn list(&mut self, dir: &FileEntry) -> Result<Vec<DirEntry>> {
        let data = self.read_file_data(dir)?;
        parse_directory(&data)
    }

    fn read_file_entry(&mut self, icb: LongAd) -> Result<FileEntry> {
        let block = read_logical_block(
            self.input.as_mut(),
            &self.partitions,
            icb.partition,
            icb.block,
        )?;
        parse_file_entry(&block, icb.partition)
    }

    fn read_file_data(&mut self, entry: &FileEntry) -> Result<Vec<u8>> {
        if entry.info_length > MAX_DIRECTORY_BYTES {
            return Err(invalid(format!(
                "directory of {} bytes is too large",
                entry.info_length
            )));
        }
        let wanted = entry.info_length as usize;

        let mut data = match &entry.allocation {
            Allocation::Inline(bytes) => bytes.clone(),
            Allocation::Extents(extents) => {
                let mut data = Vec::with_capacity(wanted);
                for extent in extents {
                    let remaining = wanted.saturating_sub(data.len());
                    if remaining == 0 {
                        break;
                    }
                    let length = (extent.length as usize).min(remaining);
                    if extent.kind != 0 {
                        // Allocated but unrecorded, reads as zeros.
                        data.resize(data.len() + length, 0);
                        continue;
                    }
                    for i in 0..blocks_for(length as u32) {
                        let block = read_logical_block(
                            self.input.as_mut(),
                            &self.partitions,
                            extent.partition,
                            block_add(extent.block, i)?,
                        )?;
                        data.extend_from_slice(&block);
                    }
                }
                data
            }
        };

        data.truncate(wanted);
        Ok(data)
    }
}

impl Drop for Udf {
    fn drop(&mut self) {
        self.input.close();
    }
}

fn read_block(input: &mut dyn BlockInput, lba: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; UDF_BLOCK_SIZE];
    if input.read(lba, &mut buf, 1)? != 1 {
        return Err(invalid(format!("block {lba} is past the end of the image")));
    }
    Ok(buf)
}

fn read_anchor(input: &mut dyn BlockInput) -> Result<Vec<u8>> {
    let size = input.size();
    let mut candidates = vec![ANCHOR_LBA];
    if size > ANCHOR_LBA {
        candidates.push(size - 1);
        candidates.push(size - 1 - ANCHOR_LBA);
    }

    for lba in candidates {
        if lba >= size {
            continue;
        }
        let block = read_block(input, lba)?;
        if check_tag(&block, TAG_ANCHOR).is_ok() {
            trace!(lba, "anchor volume descriptor pointer");
            return Ok(block);
        }
    }
    Err(invalid("no anchor volume descriptor pointer"))
}

fn read_volume_descriptors(
    input: &mut dyn BlockInput,
    location: u32,
    length: u32,
) -> Result<(VolumeDescriptors, String)> {
    let count = blocks_for(length).min(MAX_VDS_BLOCKS);
    let mut partitions = Vec::new();
    let mut logical = None;
    let mut volume_id = String::new();

    for lba in location..location.saturating_add(count) {
        let block = read_block(input, lba)?;
        match le_u16(&block, 0) {
            TAG_PRIMARY_VOLUME if check_tag(&block, TAG_PRIMARY_VOLUME).is_ok() => {
                volume_id = decode_dstring(&block[24..56]);
            }
            TAG_PARTITION if check_tag(&block, TAG_PARTITION).is_ok() => {
                partitions.push(PartitionDescriptor {
                    number: le_u16(&block, 22),
                    start: le_u32(&block, 188),
                    length: le_u32(&block, 192),
                });
            }
            TAG_LOGICAL_VOLUME if check_tag(&block, TAG_LOGICAL_VOLUME).is_ok() => {
                logical = Some(parse_logical_volume(&block)?);
            }
            TAG_TERMINATING => break,
            0 => break,
            _ => {}
        }
    }

    let (file_set, maps) = logical.ok_or_else(|| invalid("no logical volume descriptor"))?;
    if partitions.is_empty() {
        return Err(invalid("no partition descriptor"));
    }

    Ok((
        VolumeDescriptors {
            partitions,
            maps,
            file_set,
        },
        volume_id,
    ))
}

fn parse_logical_volume(block: &[u8]) -> Result<(LongAd, Vec<PartitionMapEntry>)> {
    let block_size = le_u32(block, 212);
    if block_size as usize != UDF_BLOCK_SIZE {
        return Err(invalid(format!("unsupported logical block size {block_size}")));
    }

    let file_set = LongAd::parse(block, 248);
    let table_length = le_u32(block, 264) as usize;
    let map_count = le_u32(block, 268);
    if 440 + table_length > block.len() {
        return Err(invalid("partition map table overruns descriptor"));
    }

    let table = &block[440..440 + table_length];
    let mut maps = Vec::new();
    let mut off = 0;
    for _ in 0..map_count {
        if off + 2 > table.len() {
            return Err(invalid("truncated partition map"));
        }
        let (kind, len) = (table[off], table[off + 1] as usize);
        if len < 2 || off + len > table.len() {
            return Err(invalid("bad partition map length"));
        }
        let map = &table[off..off + len];

        match kind {
            1 if len >= 6 => maps.push(PartitionMapEntry {
                partition_number: le_u16(map, 4),
                kind: MapKind::Physical,
            }),
            2 if len >= 64 => {
                let ident = &map[5..28];
                let partition_number = le_u16(map, 38);
                if ident.starts_with(METADATA_PARTITION_ID) {
                    maps.push(PartitionMapEntry {
                        partition_number,
                        kind: MapKind::Metadata {
                            file_block: le_u32(map, 40),
                        },
                    });
                } else {
                    // Sparable partitions read like physical ones when undamaged.
                    maps.push(PartitionMapEntry {
                        partition_number,
                        kind: MapKind::Physical,
                    });
                }
            }
            _ => return Err(invalid(format!("unsupported partition map type {kind}"))),
        }
        off += len;
    }

    Ok((file_set, maps))
}

fn build_partitions(input: &mut dyn BlockInput, vds: &VolumeDescriptors) -> Result<Vec<Partition>> {
    let mut partitions = Vec::with_capacity(vds.maps.len());

    for map in &vds.maps {
        let descriptor = vds
            .partitions
            .iter()
            .find(|p| p.number == map.partition_number)
            .ok_or_else(|| {
                invalid(format!("no descriptor for partition {}", map.partition_number))
            })?;

        let partition = match map.kind {
            MapKind::Physical => Partition::Physical {
                start: descriptor.start,
                length: descriptor.length,
            },
            MapKind::Metadata { file_block } => {
                let block = read_block(input, block_add(descriptor.start, file_block)?)?;
                let entry = parse_file_entry(&block, 0)?;
                if entry.file_type != FILE_TYPE_METADATA {
                    return Err(invalid("metadata partition file has the wrong type"));
                }
                let Allocation::Extents(extents) = entry.allocation else {
                    return Err(invalid("metadata partition file is inline"));
                };
                Partition::Metadata {
                    start: descriptor.start,
                    extents,
                }
            }
        };
        partitions.push(partition);
    }

    Ok(partitions)
}

fn read_logical_block(
    input: &mut dyn BlockInput,
    partitions: &[Partition],
    partition: u16,
    block: u32,
) -> Result<Vec<u8>> {
    let physical = match partitions.get(partition as usize) {
        Some(Partition::Physical { start, length }) => {
            if block >= *length {
                return Err(invalid(format!(
                    "block {block} outside partition {partition}"
                )));
            }
            block_add(*start, block)?
        }
        Some(Partition::Metadata { start, extents }) => {
            let mut first = 0u32;
            let mut found = None;
            for extent in extents {
                let end = block_add(first, blocks_for(extent.length))?;
                if block < end {
                    found = Some(block_add(block_add(*start, extent.block)?, block - first)?);
                    break;
                }
                first = end;
            }
            found.ok_or_else(|| invalid(format!("block {block} outside metadata partition")))?
        }
        None => return Err(invalid(format!("no partition map {partition}"))),
    };
    read_block(input, physical)
}

/// Parses a file entry or extended file entry. Short allocation
/// descriptors inherit `partition` from the ICB that pointed here.
fn parse_file_entry(block: &[u8], partition: u16) -> Result<FileEntry> {
    let (info_off, ea_off, ad_off, data_off) = match le_u16(block, 0) {
        TAG_FILE_ENTRY => {
            check_tag(block, TAG_FILE_ENTRY)?;
            (56, 168, 172, 176)
        }
        TAG_EXTENDED_FILE_ENTRY => {
            check_tag(block, TAG_EXTENDED_FILE_ENTRY)?;
            (56, 208, 212, 216)
        }
        other => return Err(invalid(format!("expected file entry, found tag {other}"))),
    };

    let file_type = block[27];
    let ad_type = le_u16(block, 34) & 0x7;
    let info_length = le_u64(block, info_off);
    let ea_len = le_u32(block, ea_off) as usize;
    let ad_len = le_u32(block, ad_off) as usize;

    let start = data_off + ea_len;
    if start + ad_len > block.len() {
        return Err(invalid("allocation descriptors overrun file entry"));
    }
    let descriptors = &block[start..start + ad_len];

    let allocation = match ad_type {
        0 => Allocation::Extents(
            descriptors
                .chunks_exact(8)
                .map(|ad| {
                    let (kind, length) = split_extent_length(le_u32(ad, 0));
                    Extent {
                        kind,
                        length,
                        block: le_u32(ad, 4),
                        partition,
                    }
                })
                .take_while(|e| e.length != 0)
                .collect(),
        ),
        1 => Allocation::Extents(
            descriptors
                .chunks_exact(16)
                .map(|ad| {
                    let long = LongAd::parse(ad, 0);
                    let (kind, length) = split_extent_length(long.length);
                    Extent {
                        kind,
                        length,
                        block: long.block,
                        partition: long.partition,
                    }
                })
                .take_while(|e| e.length != 0)
                .collect(),
        ),
        3 => Allocation::Inline(descriptors.to_vec()),
        other => {
            return Err(invalid(format!(
                "unsupported allocation descriptor type {other}"
            )));
        }
    };

    if let Allocation::Extents(extents) = &allocation
        && extents.iter().any(|e| e.kind == 3)
    {
        return Err(invalid("chained allocation extents are not supported"));
    }

    Ok(FileEntry {
        file_type,
        info_length,
        allocation,
    })
}

fn parse_directory(data: &[u8]) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut off = 0;

    while off + 38 <= data.len() {
        let fid = &data[off..];
        if le_u16(fid, 0) == 0 {
            break;
        }
        check_tag(fid, TAG_FILE_IDENTIFIER)?;

        let characteristics = fid[18];
        let name_len = fid[19] as usize;
        let iu_len = le_u16(fid, 36) as usize;
        let name_start = 38 + iu_len;
        let total = (name_start + name_len + 3) & !3;
        if name_start + name_len > fid.len() {
            return Err(invalid("file identifier overruns directory"));
        }

        if characteristics & (FID_DELETED | FID_PARENT) == 0 {
            entries.push(DirEntry {
                name: decode_name(&fid[name_start..name_start + name_len]),
                is_dir: characteristics & FID_DIRECTORY != 0,
                icb: LongAd::parse(fid, 20),
            });
        }
        off += total;
    }

    Ok(entries)
}

/// Decodes an OSTA compressed unicode name.
fn decode_name(raw: &[u8]) -> String {
    match raw.split_first() {
        Some((8 | 254, bytes)) => bytes.iter().map(|&b| b as char).collect(),
        Some((16 | 255, bytes)) => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
        _ => String::new(),
    }
}

/// Decodes a fixed-size dstring: the last byte holds the used length.
fn decode_dstring(field: &[u8]) -> String {
    let Some((&used, body)) = field.split_last() else {
        return String::new();
    };
    let used = (used as usize).min(body.len());
    decode_name(&body[..used])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block::StreamBlockInput;
    use std::io::Cursor;

    const PARTITION_START: u32 = 270;
    const PARTITION_LENGTH: u32 = 100;
    /// Physical-partition block holding the metadata file entry.
    const METADATA_FILE_BLOCK: u32 = 10;
    /// Physical-partition block where the metadata partition content begins.
    const METADATA_CONTENT_BLOCK: u32 = 20;

    /// Builds a small UDF image whose root holds `entries` as `(name, is_dir)`.
    ///
    /// With `metadata` set, the file set and directories live in a metadata
    /// partition as on Blu-ray discs.
    pub(crate) fn build_image(entries: &[(&str, bool)], metadata: bool) -> Vec<u8> {
        let total_blocks = (PARTITION_START + PARTITION_LENGTH) as usize;
        let mut image = vec![0u8; total_blocks * UDF_BLOCK_SIZE];

        // Logical block n of the volume's directory partition.
        let (dir_partition, logical_base) = if metadata {
            (1u16, PARTITION_START + METADATA_CONTENT_BLOCK)
        } else {
            (0u16, PARTITION_START)
        };

        let r = block(ANCHOR_LBA);
        let avdp = &mut image[r];
        put_u32(avdp, 16, 4 * UDF_BLOCK_SIZE as u32);
        put_u32(avdp, 20, 257);
        put_tag(avdp, TAG_ANCHOR, ANCHOR_LBA);

        let r = block(257);
        let pd = &mut image[r];
        put_u16(pd, 22, 0);
        put_u32(pd, 188, PARTITION_START);
        put_u32(pd, 192, PARTITION_LENGTH);
        put_tag(pd, TAG_PARTITION, 257);

        let r = block(258);
        let lvd = &mut image[r];
        put_u32(lvd, 212, UDF_BLOCK_SIZE as u32);
        put_long_ad(lvd, 248, UDF_BLOCK_SIZE as u32, 0, dir_partition);
        lvd[440] = 1;
        lvd[441] = 6;
        put_u16(lvd, 442, 1);
        put_u16(lvd, 444, 0);
        if metadata {
            let map = &mut lvd[446..446 + 64];
            map[0] = 2;
            map[1] = 64;
            map[5..5 + METADATA_PARTITION_ID.len()].copy_from_slice(METADATA_PARTITION_ID);
            put_u16(map, 36, 1);
            put_u16(map, 38, 0);
            put_u32(map, 40, METADATA_FILE_BLOCK);
            put_u32(lvd, 264, 6 + 64);
            put_u32(lvd, 268, 2);
        } else {
            put_u32(lvd, 264, 6);
            put_u32(lvd, 268, 1);
        }
        put_tag(lvd, TAG_LOGICAL_VOLUME, 258);

        let r = block(259);
        put_tag(&mut image[r], TAG_TERMINATING, 259);

        if metadata {
            let r = block(PARTITION_START + METADATA_FILE_BLOCK);
            let fe = &mut image[r];
            fe[27] = FILE_TYPE_METADATA;
            put_u64(fe, 56, 20 * UDF_BLOCK_SIZE as u64);
            put_u32(fe, 172, 8);
            put_u32(fe, 176, 20 * UDF_BLOCK_SIZE as u32);
            put_u32(fe, 180, METADATA_CONTENT_BLOCK);
            put_tag(fe, TAG_FILE_ENTRY, METADATA_FILE_BLOCK);
        }

        // Logical block 0: file set descriptor.
        let r = block(logical_base);
        let fsd = &mut image[r];
        put_long_ad(fsd, 400, UDF_BLOCK_SIZE as u32, 1, dir_partition);
        put_tag(fsd, TAG_FILE_SET, 0);

        // Logical block 2: root directory content.
        let mut dir = Vec::new();
        push_fid(&mut dir, "", FID_DIRECTORY | FID_PARENT, 1, dir_partition);
        for (i, (name, is_dir)) in entries.iter().enumerate() {
            let flags = if *is_dir { FID_DIRECTORY } else { 0 };
            push_fid(&mut dir, name, flags, 3 + i as u32, dir_partition);
        }
        assert!(dir.len() <= UDF_BLOCK_SIZE);
        let r = block(logical_base + 2);
        image[r.start..r.start + dir.len()].copy_from_slice(&dir);

        // Logical block 1: root file entry.
        let r = block(logical_base + 1);
        let fe = &mut image[r];
        fe[27] = FILE_TYPE_DIRECTORY;
        put_u64(fe, 56, dir.len() as u64);
        put_u32(fe, 172, 8);
        put_u32(fe, 176, dir.len() as u32);
        put_u32(fe, 180, 2);
        put_tag(fe, TAG_FILE_ENTRY, 1);

        // Logical blocks 3..: empty children with inline data.
        for (i, (_, is_dir)) in entries.iter().enumerate() {
            let lb = 3 + i as u32;
            let r = block(logical_base + lb);
            let fe = &mut image[r];
            fe[27] = if *is_dir { FILE_TYPE_DIRECTORY } else { 5 };
            put_u16(fe, 34, 3);
            put_tag(fe, TAG_FILE_ENTRY, lb);
        }

        image
    }

    fn block(lba: u32) -> std::ops::Range<usize> {
        let start = lba as usize * UDF_BLOCK_SIZE;
        start..start + UDF_BLOCK_SIZE
    }

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn put_long_ad(buf: &mut [u8], off: usize, length: u32, block: u32, partition: u16) {
        put_u32(buf, off, length);
        put_u32(buf, off + 4, block);
        put_u16(buf, off + 8, partition);
    }

    fn put_tag(buf: &mut [u8], id: u16, location: u32) {
        put_u16(buf, 0, id);
        put_u16(buf, 2, 2);
        put_u32(buf, 12, location);
        buf[4] = 0;
        let sum = buf[..16]
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 4)
            .fold(0u8, |acc, (_, b)| acc.wrapping_add(*b));
        buf[4] = sum;
    }

    fn push_fid(dir: &mut Vec<u8>, name: &str, flags: u8, block: u32, partition: u16) {
        let name_bytes: Vec<u8> = if name.is_empty() {
            Vec::new()
        } else {
            std::iter::once(8u8).chain(name.bytes()).collect()
        };
        let total = (38 + name_bytes.len() + 3) & !3;
        let mut fid = vec![0u8; total];
        put_u16(&mut fid, 16, 1);
        fid[18] = flags;
        fid[19] = name_bytes.len() as u8;
        put_long_ad(&mut fid, 20, UDF_BLOCK_SIZE as u32, block, partition);
        fid[38..38 + name_bytes.len()].copy_from_slice(&name_bytes);
        put_tag(&mut fid, TAG_FILE_IDENTIFIER, 0);
        dir.extend_from_slice(&fid);
    }

    fn open(image: Vec<u8>) -> Result<Udf> {
        let input = StreamBlockInput::new(Cursor::new(image))?;
        Udf::open(Box::new(input))
    }

    #[test]
    fn test_open_root_lists_entries() {
        let image = build_image(&[("VIDEO_TS", true), ("README.TXT", false)], false);
        let mut udf = open(image).unwrap();
        let root = udf.open_dir("/").unwrap();

        let names: Vec<_> = root.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["VIDEO_TS", "README.TXT"]);
        assert!(root.entries()[0].is_dir);
        assert!(!root.entries()[1].is_dir);
    }

    #[test]
    fn test_open_dir_by_path() {
        let mut udf = open(build_image(&[("BDMV", true), ("CERTIFICATE", true)], false)).unwrap();

        let dir = udf.open_dir("/BDMV").unwrap();
        assert_eq!(dir.path(), "/BDMV");
        assert!(dir.entries().is_empty());

        assert!(matches!(
            udf.open_dir("/VIDEO_TS"),
            Err(Error::UdfNotFound { .. })
        ));
        // Case is significant.
        assert!(udf.open_dir("/bdmv").is_err());
    }

    #[test]
    fn test_open_dir_rejects_files() {
        let mut udf = open(build_image(&[("BDMV", false)], false)).unwrap();
        assert!(matches!(udf.open_dir("/BDMV"), Err(Error::UdfNotFound { .. })));
    }

    #[test]
    fn test_metadata_partition() {
        let mut udf = open(build_image(&[("BDMV", true)], true)).unwrap();
        assert!(udf.open_dir("/BDMV").is_ok());
    }

    #[test]
    fn test_not_udf() {
        let image = vec![0u8; 400 * UDF_BLOCK_SIZE];
        assert!(matches!(open(image), Err(Error::Udf { .. })));

        // Too small to even hold an anchor.
        assert!(open(vec![0u8; 10 * UDF_BLOCK_SIZE]).is_err());
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut image = build_image(&[("BDMV", true)], false);
        image[ANCHOR_LBA as usize * UDF_BLOCK_SIZE + 4] ^= 0xff;
        assert!(open(image).is_err());
    }

    /// Byte offset of field `off` in physical block `lba`.
    fn at(lba: u32, off: usize) -> usize {
        lba as usize * UDF_BLOCK_SIZE + off
    }

    #[test]
    fn test_block_address_overflow_is_an_error() {
        // Metadata file location in the type 2 partition map.
        let mut image = build_image(&[("BDMV", true)], true);
        put_u32(&mut image, at(258, 446 + 40), u32::MAX);
        assert!(matches!(open(image), Err(Error::Udf { .. })));

        // Metadata content extent at the very end of the address space.
        let mut image = build_image(&[("BDMV", true)], true);
        put_u32(&mut image, at(PARTITION_START + METADATA_FILE_BLOCK, 180), u32::MAX);
        assert!(matches!(open(image), Err(Error::Udf { .. })));
    }

    #[test]
    fn test_oversized_extents_are_clamped() {
        // Unrecorded extent claiming almost 1 GiB.
        let mut image = build_image(&[("BDMV", true)], false);
        put_u32(&mut image, at(PARTITION_START + 1, 176), (1 << 30) | 0x3fff_ffff);
        let mut udf = open(image).unwrap();
        assert!(udf.open_dir("/").unwrap().entries().is_empty());

        // Recorded extent running far past the partition end.
        let mut image = build_image(&[("BDMV", true)], false);
        put_u32(&mut image, at(PARTITION_START + 1, 176), 0x3fff_ffff);
        let mut udf = open(image).unwrap();
        let root = udf.open_dir("/").unwrap();
        assert_eq!(root.entries().len(), 1);
        assert_eq!(root.entries()[0].name, "BDMV");
    }

    #[test]
    fn test_decode_names() {
        assert_eq!(decode_name(b"\x08VIDEO_TS"), "VIDEO_TS");
        assert_eq!(decode_name(b"\x10\x00B\x00D"), "BD");
        assert_eq!(decode_name(b""), "");

        let mut field = [0u8; 32];
        field[..5].copy_from_slice(b"\x08DISC");
        field[31] = 5;
        assert_eq!(decode_dstring(&field), "DISC");
    }
}
