use crate::{
    math, sizes, AsByteSliceMut, ReadAt, Result, StructBuffer, Uuid, UuidEx, VhdError, WriteAt,
};

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct VhdParentLocator {
    // Platform code -- see PLAT_CODE_* below
    code: u32,
    // Number of 512-byte sectors reserved to store the locator
    data_space: u32,
    // Actual length of parent locator data in bytes
    data_len: u32,
    // Must be zero
    res: u32,
    // Absolute offset of locator data (bytes)
    data_offset: u64,
}

/// No parent locator stored in this entry.
pub const PLAT_CODE_NONE: u32 = 0x0000_0000;
/// Windows relative path (UTF-16) -- "W2ru"
pub const PLAT_CODE_W2RU: u32 = 0x5732_7275;
/// Windows absolute path (UTF-16) -- "W2ku"
pub const PLAT_CODE_W2KU: u32 = 0x5732_6B75;
/// Mac OS alias -- "Mac "
pub const PLAT_CODE_MAC: u32 = 0x4D61_6320;
/// Mac OS X URL -- "MacX"
pub const PLAT_CODE_MACX: u32 = 0x4D61_6358;

#[repr(C, packed)]
#[derive(Debug, Copy, Clone)]
pub struct VhdHeader {
    // Should contain "cxsparse"
    cookie: u64,
    // Byte offset of next record (unused, all-1s)
    data_offset: u64,
    // Absolute offset to the BAT
    table_offset: u64,
    // Version of the dd_hdr (major,minor)
    hdr_ver: u32,
    // Maximum number of entries in the BAT
    max_bat_size: u32,
    // Block size in bytes. Must be power of 2
    block_size: u32,
    // Header checksum. 1's comp of all fields
    checksum: u32,
    // ID of the parent disk
    prt_uuid: uuid::Uuid,
    // Modification time of the parent disk
    prt_ts: u32,
    // Reserved
    res1: u32,
    // Parent unicode name (UTF-16BE)
    prt_name: [u16; 256],
    // Parent locator entries
    prt_loc: [VhdParentLocator; 8],
    // Reserved
    res2: [u8; 256],
}

pub const HEADER_SIZE: usize = std::mem::size_of::<VhdHeader>();
pub const PARENT_LOCATOR_ENTRIES: usize = 8;

/// (Unused) 0xffs
const DD_OFFSET: u64 = 0xFFFF_FFFF_FFFF_FFFF;
/// VHD cookie string
const DD_COOKIE: u64 = 0x6573_7261_7073_7863; /* cxsparse big endian */
/// Version field in VhdHeader
const DD_VERSION: u32 = 0x0001_0000;
/// Default blocksize is 2 meg
pub const DD_BLOCKSIZE_DEFAULT: u32 = 0x0020_0000;

/// What's known about a parent disk at header-construction time, decoupled
/// from any concrete VHD backend so `VhdHeader::new` does not need to depend
/// on `vhd::file`.
pub struct ParentInfo<'a> {
    pub uuid: Uuid,
    pub timestamp: u32,
    /// Absolute path the parent locator should encode.
    pub path: &'a str,
}

impl VhdHeader {
    fn swap_bytes(&mut self) {
        self.data_offset = self.data_offset.swap_bytes();
        self.table_offset = self.table_offset.swap_bytes();
        self.hdr_ver = self.hdr_ver.swap_bytes();
        self.max_bat_size = self.max_bat_size.swap_bytes();
        self.block_size = self.block_size.swap_bytes();
        self.checksum = self.checksum.swap_bytes();
        self.prt_uuid = self.prt_uuid.swap_bytes();
        self.prt_ts = self.prt_ts.swap_bytes();

        for locator in &mut self.prt_loc {
            locator.code = locator.code.swap_bytes();
            locator.data_len = locator.data_len.swap_bytes();
            locator.data_space = locator.data_space.swap_bytes();
            locator.data_offset = locator.data_offset.swap_bytes();
        }
    }

    pub fn new(capacity: u64, table_offset: u64, block_size: u32, parent: Option<&ParentInfo>) -> Self {
        let mut header = StructBuffer::<VhdHeader>::zeroed();
        header.cookie = DD_COOKIE;
        header.data_offset = DD_OFFSET;
        header.table_offset = table_offset;
        header.hdr_ver = DD_VERSION;
        header.max_bat_size = math::ceil(capacity, block_size as u64) as u32;
        header.block_size = block_size;

        match parent {
            None => {
                header.prt_uuid = Uuid::nil();
                header.prt_ts = 0;
                header.prt_name = [0_u16; 256];
                header.prt_loc = [VhdParentLocator {
                    code: 0,
                    data_space: 0,
                    data_len: 0,
                    res: 0,
                    data_offset: 0,
                }; 8];
            }
            Some(parent) => {
                header.prt_uuid = parent.uuid;
                header.prt_ts = parent.timestamp;

                let parent_name = std::path::Path::new(parent.path)
                    .file_name()
                    .map(|name| name.to_string_lossy())
                    .unwrap_or_default();
                let parent_utf16_name: Vec<u16> = parent_name.encode_utf16().collect();
                let mut prt_name = [0_u16; 256];
                let n = parent_utf16_name.len().min(256);
                prt_name[..n].copy_from_slice(&parent_utf16_name[..n]);
                header.prt_name = prt_name;

                let bat_size = super::bat::bat_byte_size(header.max_bat_size) as usize;
                let mut prt_loc = [VhdParentLocator {
                    code: 0,
                    data_space: 0,
                    data_len: 0,
                    res: 0,
                    data_offset: 0,
                }; 8];
                prt_loc[0].code = PLAT_CODE_W2KU;
                // One sector is reserved for the absolute path, matching how Microsoft's
                // own tools size this locator (actual byte length goes in data_len).
                prt_loc[0].data_space = sizes::SECTOR;
                prt_loc[0].data_len = (parent.path.encode_utf16().count() * 2) as u32;
                prt_loc[0].data_offset = table_offset + bat_size as u64;
                header.prt_loc = prt_loc;
            }
        }

        let checksum = crate::vhd::calc_header_bytes_checksum(&header);
        header.checksum = checksum;

        header.copy()
    }

    pub fn read(stream: &impl ReadAt, pos: u64) -> Result<Self> {
        let mut header = unsafe { StructBuffer::<VhdHeader>::new() };
        stream.read_exact_at(pos, unsafe { header.as_byte_slice_mut() })?;

        if DD_COOKIE != header.cookie {
            return Err(VhdError::InvalidRecord("VHD header"));
        }

        header.swap_bytes();

        let checksum = crate::vhd::calc_header_checksum!(header);
        if header.checksum != checksum {
            return Err(VhdError::BadChecksum("VHD header"));
        }

        Ok(header.copy())
    }

    pub fn write(&self, stream: &impl WriteAt, pos: u64) -> Result<()> {
        let mut header = unsafe { StructBuffer::<VhdHeader>::with_value(self) };
        header.swap_bytes();

        stream.write_all_at(pos, header.buffer())
    }

    pub fn table_offset(&self) -> u64 {
        self.table_offset
    }

    pub fn set_table_offset(&mut self, offset: u64) {
        self.table_offset = offset;
    }

    pub fn max_bat_size(&self) -> u32 {
        self.max_bat_size
    }

    pub fn set_max_bat_size(&mut self, entries: u32) {
        self.max_bat_size = entries;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn cookie(&self) -> &str {
        let cookie = unsafe { std::slice::from_raw_parts(&self.cookie as *const _ as *const u8, 8) };
        std::str::from_utf8(cookie).unwrap()
    }

    pub fn prt_name(&self) -> String {
        String::from_utf16_lossy(&self.prt_name)
            .trim_end_matches('\0')
            .to_string()
    }

    pub fn prt_uuid(&self) -> &Uuid {
        &self.prt_uuid
    }

    pub fn prt_loc(&self) -> &[VhdParentLocator; PARENT_LOCATOR_ENTRIES] {
        &self.prt_loc
    }

    pub fn prt_loc_mut(&mut self) -> &mut [VhdParentLocator; PARENT_LOCATOR_ENTRIES] {
        &mut self.prt_loc
    }

    pub fn recompute_checksum(&mut self) {
        self.checksum = 0;
        let buf = unsafe { StructBuffer::<VhdHeader>::with_value(self) };
        self.checksum = crate::vhd::calc_header_bytes_checksum(&buf);
    }
}

impl VhdParentLocator {
    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn is_present(&self) -> bool {
        self.code != PLAT_CODE_NONE
    }

    /// Corrected per the abstract contract: a locator holds data iff its
    /// reserved space is non-empty, not iff it is empty.
    pub fn has_data(&self) -> bool {
        self.data_space > 0
    }

    pub fn data_space(&self) -> u32 {
        self.data_space
    }

    pub fn data_len(&self) -> u32 {
        self.data_len
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn set(&mut self, code: u32, data_space: u32, data_len: u32, data_offset: u64) {
        self.code = code;
        self.data_space = data_space;
        self.data_len = data_len;
        self.res = 0;
        self.data_offset = data_offset;
    }
}

impl std::fmt::Display for VhdHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("VHD Header Summary:\n-------------------\n")?;

        let header = format!(
            "{:<20}: {}
{:<20}: {:#018X}
{:<20}: {:#018X}
{:<20}: Major: {}, Minor: {}
{:<20}: {}
{:<20}: {} Mb, ({} bytes)
{:<20}: {}
{:<20}: {}
{:<20}: {:#010X}\n",
            "Cookie",
            self.cookie(),
            "Data offset (unused)",
            self.data_offset,
            "Table offset",
            self.table_offset,
            "Header version",
            self.hdr_ver >> 16,
            self.hdr_ver >> 24,
            "Max BAT size",
            self.max_bat_size,
            "Block size",
            self.block_size >> 20,
            self.block_size,
            "Parent name",
            self.prt_name(),
            "Parent UUID",
            self.prt_uuid.to_string(),
            "Checksum",
            self.checksum,
        );

        f.write_str(&header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ByteHandler, MemHandler, OpenMode};
    use std::path::Path;

    fn sample_header(parent: Option<&ParentInfo>) -> VhdHeader {
        VhdHeader::new(64 * sizes::MIB, crate::vhd::DEFAULT_TABLE_OFFSET, DD_BLOCKSIZE_DEFAULT, parent)
    }

    #[test]
    fn round_trips_through_bytes() {
        let header = sample_header(None);
        let handler = MemHandler::new();
        let path = Path::new("/header.bin");
        let handle = handler.open(path, OpenMode::CreateNew).unwrap();
        header.write(&handle, 0).unwrap();

        let read_back = VhdHeader::read(&handle, 0).unwrap();
        assert_eq!(read_back.cookie(), "cxsparse");
        assert_eq!(read_back.table_offset(), crate::vhd::DEFAULT_TABLE_OFFSET);
        assert_eq!(read_back.block_size(), DD_BLOCKSIZE_DEFAULT);
        assert_eq!(read_back.max_bat_size(), math::ceil(64 * sizes::MIB, DD_BLOCKSIZE_DEFAULT as u64) as u32);
    }

    #[test]
    fn rejects_wrong_cookie() {
        let header = sample_header(None);
        let handler = MemHandler::new();
        let path = Path::new("/header.bin");
        let handle = handler.open(path, OpenMode::CreateNew).unwrap();
        header.write(&handle, 0).unwrap();
        handle.write_all_at(0, &[0_u8; 8]).unwrap();

        let err = VhdHeader::read(&handle, 0).unwrap_err();
        assert!(matches!(err, VhdError::InvalidRecord("VHD header")));
    }

    #[test]
    fn rejects_bad_checksum() {
        let header = sample_header(None);
        let handler = MemHandler::new();
        let path = Path::new("/header.bin");
        let handle = handler.open(path, OpenMode::CreateNew).unwrap();
        header.write(&handle, 0).unwrap();
        // Flip a byte in the reserved tail: cookie stays valid, checksum doesn't.
        handle.write_all_at(HEADER_SIZE as u64 - 1, &[0xAB]).unwrap();

        let err = VhdHeader::read(&handle, 0).unwrap_err();
        assert!(matches!(err, VhdError::BadChecksum("VHD header")));
    }

    #[test]
    fn recompute_checksum_matches_read_back() {
        let mut header = sample_header(None);
        header.set_max_bat_size(header.max_bat_size() + 1);
        header.recompute_checksum();

        let handler = MemHandler::new();
        let path = Path::new("/header.bin");
        let handle = handler.open(path, OpenMode::CreateNew).unwrap();
        header.write(&handle, 0).unwrap();

        let read_back = VhdHeader::read(&handle, 0).unwrap();
        assert_eq!(read_back.max_bat_size(), header.max_bat_size());
    }

    #[test]
    fn parent_info_encodes_name_and_locator() {
        let parent = ParentInfo {
            uuid: Uuid::new_v4(),
            timestamp: 123_456,
            path: "C:\\disks\\base.vhd",
        };
        let header = sample_header(Some(&parent));

        assert_eq!(header.prt_name(), "base.vhd");
        assert_eq!(header.prt_uuid(), &parent.uuid);

        let locators = header.prt_loc();
        assert!(locators[0].is_present());
        assert!(locators[0].has_data());
        assert_eq!(locators[0].code(), PLAT_CODE_W2KU);
        assert_eq!(locators[0].data_len(), (parent.path.encode_utf16().count() * 2) as u32);

        for loc in &locators[1..] {
            assert!(!loc.is_present());
            assert!(!loc.has_data());
        }
    }

    #[test]
    fn no_parent_means_absent_locators() {
        let header = sample_header(None);
        for loc in header.prt_loc() {
            assert!(!loc.is_present());
            assert!(!loc.has_data());
        }
        assert_eq!(header.prt_uuid(), &Uuid::nil());
    }

    #[test]
    fn locator_set_round_trips_fields() {
        let mut loc = VhdParentLocator {
            code: 0,
            data_space: 0,
            data_len: 0,
            res: 0,
            data_offset: 0,
        };
        loc.set(PLAT_CODE_MACX, 512, 200, 4096);
        assert_eq!(loc.code(), PLAT_CODE_MACX);
        assert!(loc.is_present());
        assert!(loc.has_data());
        assert_eq!(loc.data_space(), 512);
        assert_eq!(loc.data_len(), 200);
        assert_eq!(loc.data_offset(), 4096);
    }
}
