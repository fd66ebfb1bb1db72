use crate::handler::{ByteHandle, ByteHandler, OpenMode};
use crate::vhd::bat::{VhdBat, BLOCK_UNUSED};
use crate::vhd::footer::{VhdFooter, FOOTER_SIZE};
use crate::vhd::header::{
    ParentInfo, VhdHeader, DD_BLOCKSIZE_DEFAULT, HEADER_SIZE, PARENT_LOCATOR_ENTRIES,
    PLAT_CODE_NONE, PLAT_CODE_W2KU,
};
use crate::vhd::{Block, BlockGeometry, VhdInstance, VhdType, DEFAULT_TABLE_OFFSET};
use crate::{bitmap, math, sizes, Result, VhdError};
use std::path::{Path, PathBuf};

/// A VHD backed by a single file, reachable through a [`ByteHandle`] opened
/// via some [`ByteHandler`] (real filesystem, or an in-memory one in tests).
/// This is the one concrete implementation of [`VhdInstance`] this crate
/// ships (component C5); other backends (e.g. a directory of loose blocks)
/// would implement the same trait without touching this type.
pub struct VhdFile<H: ByteHandle> {
    handle: H,
    path: PathBuf,
    footer: VhdFooter,
    header: VhdHeader,
    geometry: BlockGeometry,
    bat: VhdBat,
    file_size: u64,
}

impl<H: ByteHandle> VhdFile<H> {
    fn read_footer_and_header(handle: &H, check_second_footer: bool) -> Result<(VhdFooter, VhdHeader, u64)> {
        let file_size = handle.size()?;
        let footer = VhdFooter::read(handle, 0)?;

        if footer.disk_type() == VhdType::Fixed {
            return Err(VhdError::UnsupportedDiskType(2));
        }

        if check_second_footer {
            if file_size < FOOTER_SIZE as u64 {
                return Err(VhdError::FileTooSmall);
            }
            let end_footer = VhdFooter::read(handle, file_size - FOOTER_SIZE as u64)?;
            if footer.to_bytes() != end_footer.to_bytes() {
                return Err(VhdError::FooterMismatch);
            }
        }

        let header = VhdHeader::read(handle, FOOTER_SIZE as u64)?;
        Ok((footer, header, file_size))
    }

    /// Opens an existing dynamic or differencing VHD for read+write.
    pub fn open<HR: ByteHandler<Handle = H>>(
        handler: &HR,
        path: &Path,
        check_second_footer: bool,
    ) -> Result<Self> {
        let handle = handler.open(path, OpenMode::ReadWrite)?;
        let (footer, header, file_size) = Self::read_footer_and_header(&handle, check_second_footer)?;
        let geometry = BlockGeometry::from_block_size(header.block_size());
        let bat = VhdBat::read(&handle, header.table_offset(), header.max_bat_size())?;

        Ok(VhdFile {
            handle,
            path: path.to_path_buf(),
            footer,
            header,
            geometry,
            bat,
            file_size,
        })
    }

    fn create<HR: ByteHandler<Handle = H>>(
        handler: &HR,
        path: &Path,
        capacity: u64,
        block_size: u32,
        disk_type: VhdType,
        parent: Option<ParentInfo>,
    ) -> Result<Self> {
        let handle = handler.open(path, OpenMode::CreateNew)?;

        let footer = VhdFooter::new(capacity, disk_type);
        let header = VhdHeader::new(capacity, DEFAULT_TABLE_OFFSET, block_size, parent.as_ref());
        let geometry = BlockGeometry::from_block_size(block_size);
        let bat = VhdBat::new(header.max_bat_size());

        let mut vf = VhdFile {
            handle,
            path: path.to_path_buf(),
            footer,
            header,
            geometry,
            bat,
            file_size: 0,
        };

        if let Some(info) = parent.as_ref() {
            let bat_bytes = crate::vhd::bat::bat_byte_size(vf.header.max_bat_size()) as u64;
            let loc_offset = DEFAULT_TABLE_OFFSET + bat_bytes;
            let encoded: Vec<u8> = info.path.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
            let mut padded = vec![0_u8; sizes::SECTOR as usize];
            let n = encoded.len().min(padded.len());
            padded[..n].copy_from_slice(&encoded[..n]);
            vf.handle.write_all_at(loc_offset, &padded)?;
        }

        vf.write_header()?;
        vf.write_block_allocation_table()?;
        vf.write_footer(false)?;

        Ok(vf)
    }

    /// Creates a new, empty dynamic (non-differencing) VHD using the
    /// default 2 MiB block size.
    pub fn create_dynamic<HR: ByteHandler<Handle = H>>(
        handler: &HR,
        path: &Path,
        capacity: u64,
    ) -> Result<Self> {
        Self::create_dynamic_with_block_size(handler, path, capacity, DD_BLOCKSIZE_DEFAULT)
    }

    /// Creates a new, empty dynamic VHD with an explicit block size (must be
    /// a power of two; `512` is the smallest the format allows, one sector
    /// per block).
    pub fn create_dynamic_with_block_size<HR: ByteHandler<Handle = H>>(
        handler: &HR,
        path: &Path,
        capacity: u64,
        block_size: u32,
    ) -> Result<Self> {
        Self::create(handler, path, capacity, block_size, VhdType::Dynamic, None)
    }

    /// Creates a new, empty differencing VHD naming `parent_path` as its
    /// parent. `parent`'s footer supplies the parent UUID/timestamp embedded
    /// in the child's header, and its block size is inherited so that
    /// `coalesceBlock` can assume matching block geometry on both sides.
    pub fn create_diff<HR: ByteHandler<Handle = H>>(
        handler: &HR,
        path: &Path,
        parent: &dyn VhdInstance,
        parent_path: &str,
    ) -> Result<Self> {
        let info = ParentInfo {
            uuid: *parent.footer().uuid(),
            timestamp: parent.footer().timestamps(),
            path: parent_path,
        };
        let capacity = parent.footer().current_size();
        let block_size = parent.geometry().block_size;
        Self::create(handler, path, capacity, block_size, VhdType::Diff, Some(info))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Byte offset one past the last header/BAT/parent-locator structure.
    fn end_of_headers(&self) -> u64 {
        let mut end = std::cmp::max(
            (FOOTER_SIZE + HEADER_SIZE) as u64,
            self.header.table_offset() + self.bat_size() as u64,
        );

        for loc in self.header.prt_loc() {
            if loc.is_present() {
                end = end.max(loc.data_offset() + loc.data_space() as u64);
            }
        }

        end
    }

    /// Byte offset one past the last allocated block's data.
    fn end_of_data(&self) -> u64 {
        let mut end = math::ceil(self.end_of_headers(), sizes::SECTOR_U64) * sizes::SECTOR_U64;

        for i in 0..self.bat.entries() {
            if let Ok(sector) = self.bat.block_id(i as usize) {
                if sector != BLOCK_UNUSED {
                    let block_end = sector as u64 * sizes::SECTOR_U64 + self.geometry.full_block_size as u64;
                    end = end.max(block_end);
                }
            }
        }

        end
    }

    /// Relocates the block with the smallest sector address to the tail of
    /// the file until at least `space_needed` bytes are free immediately
    /// after the BAT. A no-op if the file has no allocated blocks yet.
    fn free_first_block_space(&mut self, space_needed: u64) -> Result<()> {
        if space_needed == 0 {
            return Ok(());
        }

        let (first, last) = match self.bat.first_and_last_blocks() {
            Some(v) => v,
            None => return Ok(()),
        };
        let (first_index, first_sector) = first;
        let (_, last_sector) = last;

        let bat_end = self.header.table_offset() + self.bat_size() as u64;
        if bat_end + space_needed <= first_sector as u64 * sizes::SECTOR_U64 {
            return Ok(());
        }

        let full_block_sectors = self.geometry.full_block_size as u64 / sizes::SECTOR_U64;
        let target_sector = std::cmp::max(
            last_sector as u64 + full_block_sectors,
            math::ceil(bat_end + space_needed, sizes::SECTOR_U64),
        );

        let src_pos = first_sector as u64 * sizes::SECTOR_U64;
        let mut buf = vec![0_u8; self.geometry.full_block_size as usize];
        self.handle.read_exact_at(src_pos, &mut buf)?;

        let dst_pos = target_sector * sizes::SECTOR_U64;
        self.handle.write_all_at(dst_pos, &buf)?;
        self.bat.set_block_id(first_index, target_sector as u32)?;

        let new_end = dst_pos + self.geometry.full_block_size as u64;
        if new_end > self.file_size {
            self.file_size = new_end;
        }

        // Durability checkpoint: the end footer must reflect the new layout
        // before we consider this relocation complete, independent of
        // whether more relocations are still needed below.
        self.write_footer(true)?;

        let remaining = space_needed.saturating_sub(self.geometry.full_block_size as u64);
        if remaining > 0 {
            self.free_first_block_space(remaining)?;
        }

        Ok(())
    }

    /// Returns `(byte offset of block, was newly allocated)`, allocating a
    /// fresh block at the end of data if `id` was unused.
    fn allocate_or_get(&mut self, id: u32) -> Result<(u64, bool)> {
        let sector = self.bat.block_id(id as usize)?;
        if sector != BLOCK_UNUSED {
            return Ok((sector as u64 * sizes::SECTOR_U64, false));
        }

        let new_sector = math::ceil(self.end_of_data(), sizes::SECTOR_U64) as u32;
        self.bat.set_block_id(id as usize, new_sector)?;

        let pos = new_sector as u64 * sizes::SECTOR_U64;
        let new_end = pos + self.geometry.full_block_size as u64;
        if new_end > self.file_size {
            self.handle.set_len(new_end)?;
            self.file_size = new_end;
        }

        self.write_block_allocation_table()?;

        Ok((pos, true))
    }

    fn write_block_range(&mut self, id: u32, start_sector: u32, end_sector: u32, data: &[u8]) -> Result<()> {
        let (pos, is_new) = self.allocate_or_get(id)?;

        let mut bmp = vec![0_u8; self.geometry.bitmap_size as usize];
        if !is_new {
            self.handle.read_exact_at(pos, &mut bmp)?;
        }
        bitmap::set_range(&mut bmp, start_sector as usize, end_sector as usize);
        self.handle.write_all_at(pos, &bmp)?;

        let data_pos = pos + self.geometry.bitmap_size as u64 + start_sector as u64 * sizes::SECTOR_U64;
        self.handle.write_all_at(data_pos, data)?;

        Ok(())
    }

    /// Writes `buf` (a whole number of sectors) starting at sector
    /// `offset_sectors` of the virtual disk, allocating and growing the BAT
    /// as needed. This is the entry point callers use to populate a disk;
    /// [`VhdInstance::coalesce_block`] is the narrower primitive the chain
    /// merger drives directly.
    pub fn write_data(&mut self, offset_sectors: u64, buf: &[u8]) -> Result<()> {
        let sectors_per_block = self.geometry.sectors_per_block as u64;
        let mut remaining = buf;
        let mut sector = offset_sectors;

        while !remaining.is_empty() {
            let block_id = (sector / sectors_per_block) as u32;
            if block_id as u64 >= self.bat.entries() as u64 {
                self.ensure_bat_size(block_id + 1)?;
            }

            let offset_in_block = (sector % sectors_per_block) as u32;
            let sectors_left_in_block = sectors_per_block as u32 - offset_in_block;
            let sectors_wanted = math::ceil(remaining.len() as u64, sizes::SECTOR_U64) as u32;
            let sectors_in_this_write = std::cmp::min(sectors_left_in_block, sectors_wanted);
            let bytes_in_this_write = std::cmp::min(
                remaining.len(),
                sectors_in_this_write as usize * sizes::SECTOR as usize,
            );
            let chunk = &remaining[..bytes_in_this_write];
            let end_in_block = offset_in_block + sectors_in_this_write;

            if offset_in_block == 0
                && end_in_block == self.geometry.sectors_per_block
                && bytes_in_this_write == self.geometry.block_size as usize
            {
                let mut bitmap_buf = vec![0_u8; self.geometry.bitmap_size as usize];
                bitmap::set_range(&mut bitmap_buf, 0, self.geometry.sectors_per_block as usize);
                let block = Block {
                    id: block_id,
                    bitmap: bitmap_buf,
                    data: Some(chunk.to_vec()),
                };
                self.write_entire_block(&block)?;
            } else {
                self.write_block_range(block_id, offset_in_block, end_in_block, chunk)?;
            }

            remaining = &remaining[bytes_in_this_write..];
            sector += sectors_in_this_write as u64;
        }

        self.write_footer(false)
    }

    fn ensure_space_for_parent_locators(&mut self, needed_sectors: u32) -> Result<u64> {
        let base = (FOOTER_SIZE + HEADER_SIZE) as u64;
        let needed_bytes = needed_sectors as u64 * sizes::SECTOR_U64;
        let available = self.header.table_offset().saturating_sub(base);
        if available >= needed_bytes {
            return Ok(base);
        }

        let deficit = math::round_up((needed_bytes - available) as usize, sizes::SECTOR as usize) as u64;
        // Push every currently-allocated block out of the way first, so the
        // table (and the locator region ahead of it) has room to grow.
        self.free_first_block_space(deficit + self.bat_size() as u64)?;

        let new_table_offset = self.header.table_offset() + deficit;
        self.header.set_table_offset(new_table_offset);
        self.write_block_allocation_table()?;
        self.write_header()?;

        Ok(base)
    }

    /// After every block of `child` has been coalesced into `self`, absorbs
    /// the identity fields that track the disk's *current* state (size) from
    /// `child`. Deliberately leaves `self`'s own ancestor-chain fields
    /// (diskType, parent UUID/name/locators) untouched: `self` keeps
    /// delegating to whatever it already delegated to (or nothing, if it was
    /// a root), which is what makes repeated pairwise merges up a chain
    /// compose correctly -- see the merge module for the full reasoning.
    pub(crate) fn inherit_identity_from(&mut self, child: &Self) {
        self.footer.set_current_size(child.footer.current_size());
        self.footer.set_original_size(child.footer.original_size());
    }
}

impl<H: ByteHandle> VhdInstance for VhdFile<H> {
    fn footer(&self) -> &VhdFooter {
        &self.footer
    }

    fn header(&self) -> &VhdHeader {
        &self.header
    }

    fn disk_type(&self) -> VhdType {
        self.footer.disk_type()
    }

    fn geometry(&self) -> BlockGeometry {
        self.geometry
    }

    fn bat_size(&self) -> u32 {
        crate::vhd::bat::bat_byte_size(self.header.max_bat_size())
    }

    fn read_header_and_footer(&mut self, check_second_footer: bool) -> Result<()> {
        let (footer, header, file_size) = Self::read_footer_and_header(&self.handle, check_second_footer)?;
        self.geometry = BlockGeometry::from_block_size(header.block_size());
        self.footer = footer;
        self.header = header;
        self.file_size = file_size;
        Ok(())
    }

    fn read_block_allocation_table(&mut self) -> Result<()> {
        self.bat = VhdBat::read(&self.handle, self.header.table_offset(), self.header.max_bat_size())?;
        Ok(())
    }

    fn contains_block(&self, id: u32) -> bool {
        matches!(self.bat.block_id(id as usize), Ok(sector) if sector != BLOCK_UNUSED)
    }

    fn read_block(&mut self, id: u32, only_bitmap: bool) -> Result<Block> {
        let sector = self.bat.block_id(id as usize)?;
        if sector == BLOCK_UNUSED {
            return Err(VhdError::BlockAbsent(id));
        }

        let pos = sector as u64 * sizes::SECTOR_U64;
        let mut bitmap_buf = vec![0_u8; self.geometry.bitmap_size as usize];
        self.handle.read_exact_at(pos, &mut bitmap_buf)?;

        let data = if only_bitmap {
            None
        } else {
            let mut data_buf = vec![0_u8; self.geometry.block_size as usize];
            self.handle
                .read_exact_at(pos + self.geometry.bitmap_size as u64, &mut data_buf)?;
            Some(data_buf)
        };

        Ok(Block {
            id,
            bitmap: bitmap_buf,
            data,
        })
    }

    fn ensure_bat_size(&mut self, entries: u32) -> Result<()> {
        if entries <= self.header.max_bat_size() {
            return Ok(());
        }

        let old_bat_size = self.bat_size() as u64;
        self.header.set_max_bat_size(entries);
        let new_bat_size = self.bat_size() as u64;
        let delta = new_bat_size - old_bat_size;

        self.free_first_block_space(delta)?;
        self.bat.grow(entries);
        self.write_block_allocation_table()?;
        self.write_header()?;

        Ok(())
    }

    fn write_entire_block(&mut self, block: &Block) -> Result<()> {
        let data = block
            .data
            .as_ref()
            .ok_or(VhdError::AssertionFailure("write_entire_block requires block data"))?;

        let (pos, _) = self.allocate_or_get(block.id)?;
        self.handle.write_all_at(pos, &block.bitmap)?;
        self.handle.write_all_at(pos + self.geometry.bitmap_size as u64, data)?;

        Ok(())
    }

    fn coalesce_block(&mut self, child: &mut dyn VhdInstance, block_id: u32) -> Result<u64> {
        let child_block = child.read_block(block_id, false)?;
        let data = child_block
            .data
            .as_ref()
            .ok_or(VhdError::AssertionFailure("coalesce_block requires child data"))?;

        let sectors_per_block = self.geometry.sectors_per_block as usize;

        if bitmap::is_run(&child_block.bitmap, 0, sectors_per_block) {
            self.write_entire_block(&child_block)?;
            return Ok(self.geometry.block_size as u64);
        }

        let mut written = 0_u64;
        let mut i = 0;
        while i < sectors_per_block {
            let (end, present) = bitmap::run_from(&child_block.bitmap, i, sectors_per_block);
            if present {
                let start_byte = i * sizes::SECTOR as usize;
                let end_byte = end * sizes::SECTOR as usize;
                self.write_block_range(block_id, i as u32, end as u32, &data[start_byte..end_byte])?;
                written += (end_byte - start_byte) as u64;
            }
            i = end;
        }

        Ok(written)
    }

    fn write_footer(&mut self, only_end: bool) -> Result<()> {
        let end = self.end_of_data();
        let footer_bytes = self.footer.to_bytes();
        let end_pos = std::cmp::max(end, self.file_size.saturating_sub(FOOTER_SIZE as u64));
        let needed = end_pos + FOOTER_SIZE as u64;

        if needed > self.file_size {
            self.handle.set_len(needed)?;
            self.file_size = needed;
        }

        self.handle.write_all_at(end_pos, &footer_bytes)?;
        if !only_end {
            self.handle.write_all_at(0, &footer_bytes)?;
        }

        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        self.header.recompute_checksum();
        self.header.write(&self.handle, FOOTER_SIZE as u64)
    }

    fn write_block_allocation_table(&mut self) -> Result<()> {
        self.bat.write(&self.handle, self.header.table_offset()).map(|_| ())
    }

    fn set_unique_parent_locator(&mut self, path: &str) -> Result<()> {
        let encoded: Vec<u8> = path.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let needed_sectors = math::ceil(encoded.len() as u64, sizes::SECTOR_U64).max(1) as u32;
        let pos = self.ensure_space_for_parent_locators(needed_sectors)?;

        let mut padded = vec![0_u8; needed_sectors as usize * sizes::SECTOR as usize];
        padded[..encoded.len()].copy_from_slice(&encoded);
        self.handle.write_all_at(pos, &padded)?;

        {
            let locs = self.header.prt_loc_mut();
            locs[0].set(
                PLAT_CODE_W2KU,
                needed_sectors * sizes::SECTOR,
                encoded.len() as u32,
                pos,
            );
            for loc in &mut locs[1..PARENT_LOCATOR_ENTRIES] {
                loc.set(PLAT_CODE_NONE, 0, 0, 0);
            }
        }

        self.write_header()
    }

    fn read_parent_locator_data(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        let loc = self.header.prt_loc()[index];
        if !loc.has_data() {
            return Ok(None);
        }

        let mut buf = vec![0_u8; loc.data_len() as usize];
        self.handle.read_exact_at(loc.data_offset(), &mut buf)?;
        Ok(Some(buf))
    }

    fn write_parent_locator(&mut self, index: usize, byte_offset: u64, data: &[u8]) -> Result<()> {
        self.handle.write_all_at(byte_offset, data)?;

        let sectors = math::ceil(data.len() as u64, sizes::SECTOR_U64) as u32;
        let existing_code = self.header.prt_loc()[index].code();
        let code = if existing_code == PLAT_CODE_NONE {
            PLAT_CODE_W2KU
        } else {
            existing_code
        };

        self.header.prt_loc_mut()[index].set(code, sectors * sizes::SECTOR, data.len() as u32, byte_offset);
        self.write_header()
    }
}

impl<H: ByteHandle> Drop for VhdFile<H> {
    fn drop(&mut self) {
        let _ = self.handle.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MemHandler;
    use crate::WriteAt;

    const MIB: u64 = sizes::MIB;

    #[test]
    fn single_sector_write_into_sparse_block_is_readable_back() {
        let handler = MemHandler::new();
        let path = Path::new("/disk.vhd");
        let mut vhd = VhdFile::create_dynamic(&handler, path, 64 * MIB).unwrap();

        let sector = vec![0xAB_u8; sizes::SECTOR as usize];
        vhd.write_data(0, &sector).unwrap();

        let block = vhd.read_block(0, false).unwrap();
        assert!(bitmap::test(&block.bitmap, 0));
        assert!(!bitmap::test(&block.bitmap, 1));
        let data = block.data.unwrap();
        assert_eq!(&data[..sizes::SECTOR as usize], sector.as_slice());
    }

    #[test]
    fn footer_is_byte_identical_at_head_and_tail() {
        let handler = MemHandler::new();
        let path = Path::new("/disk.vhd");
        let mut vhd = VhdFile::create_dynamic(&handler, path, 16 * MIB).unwrap();
        vhd.write_data(0, &vec![1_u8; sizes::SECTOR as usize]).unwrap();

        let size = vhd.file_size();
        let head = VhdFooter::read(&vhd.handle, 0).unwrap();
        let tail = VhdFooter::read(&vhd.handle, size - FOOTER_SIZE as u64).unwrap();
        assert_eq!(head.to_bytes(), tail.to_bytes());
    }

    #[test]
    fn bat_growth_relocates_existing_blocks_without_corruption() {
        let handler = MemHandler::new();
        let path = Path::new("/disk.vhd");
        // A tiny 512-byte block size and a 1-entry starting capacity, so that
        // writing 130 single-sector blocks grows the BAT past its first
        // sector (entries 1..128 fit in one sector; entry 129 doesn't),
        // forcing ensure_bat_size to actually relocate the first-allocated
        // block out of the BAT's way rather than just widening in place.
        let block_size = sizes::SECTOR;
        let mut vhd =
            VhdFile::create_dynamic_with_block_size(&handler, path, sizes::SECTOR_U64, block_size).unwrap();

        let writes = 130_u64;
        for i in 0..writes {
            let pattern = vec![(i % 251 + 1) as u8; sizes::SECTOR as usize];
            vhd.write_data(i, &pattern).unwrap();
        }

        assert!(vhd.header.max_bat_size() as u64 >= writes);

        for i in 0..writes {
            let block = vhd.read_block(i as u32, false).unwrap();
            let data = block.data.unwrap();
            let expected = vec![(i % 251 + 1) as u8; sizes::SECTOR as usize];
            assert_eq!(data, expected, "block {i} corrupted after BAT growth");
        }

        // Every entry beyond what was actually written stays unused.
        for i in writes as u32..vhd.header.max_bat_size() {
            assert!(!vhd.contains_block(i));
        }
    }

    #[test]
    fn create_diff_inherits_parent_identity_and_block_size() {
        let handler = MemHandler::new();
        let parent_path = Path::new("/parent.vhd");
        let parent = VhdFile::create_dynamic_with_block_size(&handler, parent_path, 32 * MIB, 512 * 1024).unwrap();

        let child_path = Path::new("/child.vhd");
        let child = VhdFile::create_diff(&handler, child_path, &parent, "parent.vhd").unwrap();

        assert_eq!(child.disk_type(), VhdType::Diff);
        assert_eq!(child.header.prt_uuid(), parent.footer().uuid());
        assert_eq!(child.geometry().block_size, parent.geometry().block_size);
        assert_eq!(child.footer().current_size(), parent.footer().current_size());
    }

    #[test]
    fn parent_locator_round_trips_through_create_diff() {
        let handler = MemHandler::new();
        let parent_path = Path::new("/parent.vhd");
        let parent = VhdFile::create_dynamic(&handler, parent_path, 16 * MIB).unwrap();

        let child_path = Path::new("/child.vhd");
        let mut child = VhdFile::create_diff(&handler, child_path, &parent, "parent.vhd").unwrap();

        let data = child.read_parent_locator_data(0).unwrap().unwrap();
        let decoded: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&decoded).unwrap(), "parent.vhd");
    }

    #[test]
    fn set_unique_parent_locator_grows_table_when_needed() {
        let handler = MemHandler::new();
        let path = Path::new("/disk.vhd");
        let mut vhd = VhdFile::create_dynamic(&handler, path, 16 * MIB).unwrap();

        let long_path = "C:\\".to_string() + &"x".repeat(2000) + "\\base.vhd";
        vhd.set_unique_parent_locator(&long_path).unwrap();

        let data = vhd.read_parent_locator_data(0).unwrap().unwrap();
        let decoded: Vec<u16> = data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&decoded).unwrap(), long_path);
    }

    #[test]
    fn reopen_after_write_preserves_block_data() {
        let handler = MemHandler::new();
        let path = Path::new("/disk.vhd");
        {
            let mut vhd = VhdFile::create_dynamic(&handler, path, 16 * MIB).unwrap();
            vhd.write_data(0, &vec![7_u8; sizes::SECTOR as usize]).unwrap();
        }

        let mut reopened = VhdFile::open(&handler, path, true).unwrap();
        let block = reopened.read_block(0, false).unwrap();
        let data = block.data.unwrap();
        assert_eq!(&data[..sizes::SECTOR as usize], vec![7_u8; sizes::SECTOR as usize].as_slice());
    }

    #[test]
    fn open_rejects_fixed_disks() {
        let handler = MemHandler::new();
        let path = Path::new("/disk.vhd");
        let handle = handler.open(path, OpenMode::CreateNew).unwrap();
        let footer = VhdFooter::new(16 * MIB, VhdType::Fixed);
        handle.write_all_at(0, &footer.to_bytes()).unwrap();
        handle.set_len(16 * MIB + FOOTER_SIZE as u64).unwrap();
        handle
            .write_all_at(16 * MIB, &footer.to_bytes())
            .unwrap();

        let err = VhdFile::open(&handler, path, true).unwrap_err();
        assert!(matches!(err, VhdError::UnsupportedDiskType(2)));
    }
}
