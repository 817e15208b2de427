//! Archive framing — writer and reader over volume files.
//!
//! # Item framing
//! An item on disk is `MAGIC(8) || LENGTH || BODY`:
//!
//! ```text
//! header item:  MAGIC(8) | fsid:u16 | dicolen:u32 | dico[dicolen]
//! block item:   FsApBlkH | realsize:u64 | compsize:u64 | arsize:u64 |
//!               offset:u64 | compalgo:u16 | cryptalgo:u16 | checksum:u32 |
//!               payload[arsize]
//! ```
//!
//! All numeric fields are little-endian.  Readers validate the magic against
//! the closed set, the algorithm IDs against their enums and the sizes
//! against the format bounds *before* allocating a payload buffer.
//!
//! # Volumes
//! Every volume file starts with a `FsApVolH` record and ends with a
//! `FsApVolF` record, both carrying the archive id and volume number; the
//! foot also says whether it is the final volume.  The writer rolls over
//! before an item that would overflow the configured volume size (items are
//! never split); the reader stitches volumes transparently and fails with
//! a continuity error when ids or numbers do not line up.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::debug;

use crate::dico::Dico;
use crate::format::{
    self, volume, CompressAlgo, CryptAlgo, FormatError, Magic, FSID_NONE, MAGIC_BLOCK,
    MAGIC_LEN, MAGIC_VOLFOOT, MAGIC_VOLHEAD,
};
use crate::queue::{BlockInfo, HeadInfo};
use crate::util::volume_path;

/// Fixed part of a block item: magic + 4×u64 + 2×u16 + u32.
const BLOCK_ITEM_OVERHEAD: u64 = MAGIC_LEN as u64 + 8 * 4 + 2 * 2 + 4;
/// Headroom reserved per volume for the foot record.
const VOLFOOT_RESERVE: u64 = 64;
/// Sanity cap on a header dictionary, shared with the dico layer.
const MAX_DICO_LEN: u32 = 16 * 1024 * 1024;

/// One parsed archive item.
#[derive(Debug)]
pub enum ArchiveItem {
    Header(HeadInfo),
    /// A data block.  When produced by [`ArchiveReader::skim_item`] the
    /// payload is skipped and `data` is empty.
    Block(BlockInfo),
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Sequential archive writer with automatic volume rollover.
pub struct ArchiveWriter {
    basepath: PathBuf,
    out: BufWriter<File>,
    archive_id: u32,
    /// Split threshold in bytes; 0 disables splitting.
    volsize: u64,
    curvol: u32,
    vol_bytes: u64,
    vol_items: u64,
}

impl ArchiveWriter {
    /// Create volume 0 at `basepath` and write its volume head.
    pub fn create(basepath: &Path, archive_id: u32, volsize: u64) -> Result<Self, FormatError> {
        let file = File::create(basepath)?;
        let mut writer = ArchiveWriter {
            basepath: basepath.to_path_buf(),
            out: BufWriter::new(file),
            archive_id,
            volsize,
            curvol: 0,
            vol_bytes: 0,
            vol_items: 0,
        };
        writer.write_volume_head()?;
        Ok(writer)
    }

    pub fn current_volume(&self) -> u32 {
        self.curvol
    }

    fn volume_dico(&self) -> Dico {
        let mut d = Dico::new();
        d.set_u32(volume::KEY_ARCHIVE_ID, self.archive_id);
        d.set_u32(volume::KEY_VOLNUM, self.curvol);
        d
    }

    fn write_volume_head(&mut self) -> Result<(), FormatError> {
        let head = HeadInfo::new(MAGIC_VOLHEAD, FSID_NONE, self.volume_dico());
        self.write_header_raw(&head)?;
        Ok(())
    }

    fn write_volume_foot(&mut self, last: bool) -> Result<(), FormatError> {
        let mut dico = self.volume_dico();
        dico.set_u8(volume::KEY_LASTVOL, last as u8);
        let foot = HeadInfo::new(MAGIC_VOLFOOT, FSID_NONE, dico);
        self.write_header_raw(&foot)?;
        Ok(())
    }

    /// Close the current volume (non-final foot) and open the next one.
    fn rollover(&mut self) -> Result<(), FormatError> {
        self.write_volume_foot(false)?;
        self.out.flush()?;
        self.curvol += 1;
        let path = volume_path(&self.basepath, self.curvol)?;
        debug!(volume = self.curvol, path = %path.display(), "starting next volume");
        self.out = BufWriter::new(File::create(&path)?);
        self.vol_bytes = 0;
        self.vol_items = 0;
        self.write_volume_head()?;
        Ok(())
    }

    /// Roll over first if `item_len` more bytes would overflow the volume.
    /// A volume always takes at least one item, however large.
    fn make_room(&mut self, item_len: u64) -> Result<(), FormatError> {
        if self.volsize > 0
            && self.vol_items > 0
            && self.vol_bytes + item_len + VOLFOOT_RESERVE > self.volsize
        {
            self.rollover()?;
        }
        Ok(())
    }

    fn write_header_raw(&mut self, head: &HeadInfo) -> Result<(), FormatError> {
        let dicolen = head.dico.encoded_len() as u32;
        self.out.write_all(&head.magic)?;
        self.out.write_u16::<LittleEndian>(head.fsid)?;
        self.out.write_u32::<LittleEndian>(dicolen)?;
        head.dico.write(&mut self.out)?;
        self.vol_bytes += MAGIC_LEN as u64 + 2 + 4 + dicolen as u64;
        Ok(())
    }

    /// Append a header item, rolling the volume over if needed.
    pub fn write_header(&mut self, head: &HeadInfo) -> Result<(), FormatError> {
        let item_len = MAGIC_LEN as u64 + 2 + 4 + head.dico.encoded_len() as u64;
        self.make_room(item_len)?;
        self.write_header_raw(head)?;
        self.vol_items += 1;
        Ok(())
    }

    /// Append a block item, rolling the volume over if needed.
    pub fn write_block(&mut self, block: &BlockInfo) -> Result<(), FormatError> {
        debug_assert_eq!(block.data.len() as u64, block.archive_size);
        let item_len = BLOCK_ITEM_OVERHEAD + block.archive_size;
        self.make_room(item_len)?;

        self.out.write_all(MAGIC_BLOCK)?;
        self.out.write_u64::<LittleEndian>(block.real_size)?;
        self.out.write_u64::<LittleEndian>(block.comp_size)?;
        self.out.write_u64::<LittleEndian>(block.archive_size)?;
        self.out.write_u64::<LittleEndian>(block.offset)?;
        self.out.write_u16::<LittleEndian>(block.comp_algo as u16)?;
        self.out.write_u16::<LittleEndian>(block.crypt_algo as u16)?;
        self.out.write_u32::<LittleEndian>(block.checksum)?;
        self.out.write_all(&block.data)?;
        self.vol_bytes += item_len;
        self.vol_items += 1;
        Ok(())
    }

    /// Write the final volume foot and flush.  Must be called exactly once.
    pub fn finish(&mut self) -> Result<(), FormatError> {
        self.write_volume_foot(true)?;
        self.out.flush()?;
        Ok(())
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Sequential archive reader with transparent volume stitching.
pub struct ArchiveReader {
    basepath: PathBuf,
    input: BufReader<File>,
    archive_id: u32,
    curvol: u32,
}

impl ArchiveReader {
    /// Open volume 0 and consume its volume head.
    pub fn open(basepath: &Path) -> Result<Self, FormatError> {
        let file = File::open(basepath)?;
        let mut reader = ArchiveReader {
            basepath: basepath.to_path_buf(),
            input: BufReader::new(file),
            archive_id: 0,
            curvol: 0,
        };
        let dico = reader.expect_volume_record(MAGIC_VOLHEAD)?;
        reader.archive_id = Self::volume_field(&dico, volume::KEY_ARCHIVE_ID)?;
        let volnum = Self::volume_field(&dico, volume::KEY_VOLNUM)?;
        if volnum != 0 {
            return Err(FormatError::VolumeMismatch(format!(
                "base path holds volume {volnum}, expected volume 0"
            )));
        }
        Ok(reader)
    }

    /// Archive id recorded in the volume head.
    pub fn archive_id(&self) -> u32 {
        self.archive_id
    }

    fn volume_field(dico: &Dico, key: u16) -> Result<u32, FormatError> {
        dico.get_u32(key)?.ok_or(FormatError::MissingKey {
            magic: "volume record".into(),
            key,
        })
    }

    fn read_magic(&mut self) -> Result<Magic, FormatError> {
        let mut magic = [0u8; MAGIC_LEN];
        self.input.read_exact(&mut magic)?;
        if !format::is_magic_valid(&magic) {
            return Err(FormatError::BadMagic(magic));
        }
        Ok(magic)
    }

    fn read_header_body(&mut self, magic: &Magic) -> Result<HeadInfo, FormatError> {
        let fsid = self.input.read_u16::<LittleEndian>()?;
        let dicolen = self.input.read_u32::<LittleEndian>()?;
        if dicolen > MAX_DICO_LEN {
            return Err(FormatError::Corrupt(format!(
                "header dictionary of {dicolen} bytes exceeds the format limit"
            )));
        }
        let mut body = vec![0u8; dicolen as usize];
        self.input.read_exact(&mut body)?;
        let dico = Dico::from_bytes(&body)?;
        Ok(HeadInfo::new(magic, fsid, dico))
    }

    /// Read (and validate) a volume head/foot record after its magic.
    fn read_volume_body(&mut self, magic: &Magic) -> Result<Dico, FormatError> {
        let head = self.read_header_body(magic)?;
        Ok(head.dico)
    }

    fn expect_volume_record(&mut self, expected: &Magic) -> Result<Dico, FormatError> {
        let magic = self.read_magic()?;
        if &magic != expected {
            return Err(FormatError::VolumeMismatch(format!(
                "expected {} record, found {}",
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(&magic)
            )));
        }
        self.read_volume_body(&magic)
    }

    /// Open volume `curvol + 1` and validate its head against the archive.
    fn stitch_next_volume(&mut self) -> Result<(), FormatError> {
        self.curvol += 1;
        let path = volume_path(&self.basepath, self.curvol)?;
        debug!(volume = self.curvol, path = %path.display(), "continuing in next volume");
        self.input = BufReader::new(File::open(&path)?);
        let dico = self.expect_volume_record(MAGIC_VOLHEAD)?;
        let id = Self::volume_field(&dico, volume::KEY_ARCHIVE_ID)?;
        let volnum = Self::volume_field(&dico, volume::KEY_VOLNUM)?;
        if id != self.archive_id || volnum != self.curvol {
            return Err(FormatError::VolumeMismatch(format!(
                "volume {} carries id {id:#010x} num {volnum}, expected id {:#010x} num {}",
                path.display(),
                self.archive_id,
                self.curvol
            )));
        }
        Ok(())
    }

    fn read_block(&mut self, skip_payload: bool) -> Result<BlockInfo, FormatError> {
        let real_size = self.input.read_u64::<LittleEndian>()?;
        let comp_size = self.input.read_u64::<LittleEndian>()?;
        let archive_size = self.input.read_u64::<LittleEndian>()?;
        let offset = self.input.read_u64::<LittleEndian>()?;
        let comp_raw = self.input.read_u16::<LittleEndian>()?;
        let crypt_raw = self.input.read_u16::<LittleEndian>()?;
        let checksum = self.input.read_u32::<LittleEndian>()?;

        // Validate everything before the payload allocation.
        if real_size < 1
            || real_size > format::MAX_BLOCK_SIZE
            || archive_size < 1
            || archive_size > format::max_archived_size(real_size)
        {
            return Err(FormatError::BadBlockSizes {
                realsize: real_size,
                arsize: archive_size,
            });
        }
        let comp_algo = CompressAlgo::from_u16(comp_raw)
            .ok_or(FormatError::BadCompressAlgo(comp_raw))?;
        let crypt_algo = CryptAlgo::from_u16(crypt_raw)
            .ok_or(FormatError::BadCryptAlgo(crypt_raw))?;

        let data = if skip_payload {
            self.input.seek_relative(archive_size as i64)?;
            Vec::new()
        } else {
            let mut data = vec![0u8; archive_size as usize];
            self.input.read_exact(&mut data)?;
            data
        };

        Ok(BlockInfo {
            data,
            real_size,
            comp_size,
            archive_size,
            offset,
            comp_algo,
            crypt_algo,
            checksum,
        })
    }

    fn next_inner(&mut self, skip_payload: bool) -> Result<Option<ArchiveItem>, FormatError> {
        loop {
            let magic = self.read_magic()?;
            match &magic {
                m if m == MAGIC_VOLFOOT => {
                    let dico = self.read_volume_body(&magic)?;
                    let id = Self::volume_field(&dico, volume::KEY_ARCHIVE_ID)?;
                    let volnum = Self::volume_field(&dico, volume::KEY_VOLNUM)?;
                    if id != self.archive_id || volnum != self.curvol {
                        return Err(FormatError::VolumeMismatch(format!(
                            "volume foot carries id {id:#010x} num {volnum}, expected id {:#010x} num {}",
                            self.archive_id, self.curvol
                        )));
                    }
                    if dico.get_u8(volume::KEY_LASTVOL)?.unwrap_or(0) != 0 {
                        return Ok(None);
                    }
                    self.stitch_next_volume()?;
                }
                m if m == MAGIC_VOLHEAD => {
                    return Err(FormatError::Corrupt(
                        "volume head in the middle of a volume".into(),
                    ));
                }
                m if m == MAGIC_BLOCK => {
                    return Ok(Some(ArchiveItem::Block(self.read_block(skip_payload)?)));
                }
                _ => return Ok(Some(ArchiveItem::Header(self.read_header_body(&magic)?))),
            }
        }
    }

    /// Read the next item, payload included.  `Ok(None)` marks the final
    /// volume foot.
    pub fn next_item(&mut self) -> Result<Option<ArchiveItem>, FormatError> {
        self.next_inner(false)
    }

    /// Read the next item but skip block payloads (their `data` comes back
    /// empty).  Used by listing scans.
    pub fn skim_item(&mut self) -> Result<Option<ArchiveItem>, FormatError> {
        self.next_inner(true)
    }
}
