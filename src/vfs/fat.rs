//! On-disk structures of the emulated FAT12 volume.

use bitflags::bitflags;

/// Bytes per sector.
pub const SECTOR_SIZE: usize = 512;
/// Bytes per root directory entry.
pub const DIR_ENTRY_SIZE: usize = 32;
/// First name byte of a deleted entry.
pub const ERASED_MARKER: u8 = 0xe5;

/// Most clusters a FAT12 volume may have; hosts read anything larger as FAT16.
pub const MAX_CLUSTERS: u32 = 4084;
/// Largest advertised disc size that still lays out as FAT12.
pub const MAX_DISK_SIZE: u32 = 16 * 1024 * 1024 - 256 * 1024;

const MEDIA_DESCRIPTOR: u8 = 0xf8;
const VOLUME_ID: u32 = 0x2702_1974;
const BOOT_SIGNATURE_EXT: u8 = 0x29;

/// 8.3 name, space padded, without the dot.
pub type Filename = [u8; 11];

bitflags! {
    /// Directory entry attribute bits.
    pub struct Attributes: u8 {
        /// Read only.
        const READ_ONLY = 0x01;
        /// Hidden.
        const HIDDEN = 0x02;
        /// System file.
        const SYSTEM = 0x04;
        /// Volume label.
        const VOLUME_ID = 0x08;
        /// Subdirectory.
        const DIRECTORY = 0x10;
        /// Modified since last backup.
        const ARCHIVE = 0x20;
        /// Long file name fragment.
        const LFN = Self::READ_ONLY.bits | Self::HIDDEN.bits | Self::SYSTEM.bits | Self::VOLUME_ID.bits;
    }
}

/// Volume layout derived from the disc size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Sectors on the volume.
    pub total_sectors: u32,
    /// Sectors in each FAT copy.
    pub sectors_per_fat: u32,
}

impl Geometry {
    /// Sectors per allocation cluster.
    pub const SECTORS_PER_CLUSTER: u32 = 8;
    /// Sectors before the first FAT.
    pub const RESERVED_SECTORS: u32 = 1;
    /// FAT copies.
    pub const NUM_FATS: u32 = 2;
    /// Root directory entries.
    pub const ROOT_ENTRIES: u32 = 32;
    /// Sectors taken by the root directory.
    pub const ROOT_SECTORS: u32 = Self::ROOT_ENTRIES * DIR_ENTRY_SIZE as u32 / SECTOR_SIZE as u32;

    /// Layout for a drive that advertises `disk_size` bytes of payload,
    /// capped at [`MAX_DISK_SIZE`].
    pub fn for_disk_size(disk_size: u32) -> Self {
        let disk_size = disk_size.min(MAX_DISK_SIZE);
        // 64 KiB on top of the payload for metadata and slack
        let total_sectors = (disk_size + 64 * 1024) / SECTOR_SIZE as u32;
        let clusters = total_sectors / Self::SECTORS_PER_CLUSTER;
        Self {
            total_sectors,
            sectors_per_fat: 3 * ((clusters + 1023) / 1024),
        }
    }

    /// First sector of FAT copy `copy`.
    pub fn fat_start(&self, copy: u32) -> u32 {
        Self::RESERVED_SECTORS + copy * self.sectors_per_fat
    }

    /// First root directory sector.
    pub fn root_start(&self) -> u32 {
        self.fat_start(Self::NUM_FATS)
    }

    /// First data sector, holding cluster 2.
    pub fn data_start(&self) -> u32 {
        self.root_start() + Self::ROOT_SECTORS
    }

    /// Clusters available for file data.
    pub fn cluster_count(&self) -> u32 {
        (self.total_sectors - self.data_start()) / Self::SECTORS_PER_CLUSTER
    }

    /// Bytes per cluster.
    pub fn cluster_bytes(&self) -> u32 {
        Self::SECTORS_PER_CLUSTER * SECTOR_SIZE as u32
    }

    /// First sector of `cluster`, which must be 2 or more.
    pub fn cluster_sector(&self, cluster: u32) -> u32 {
        self.data_start() + (cluster - 2) * Self::SECTORS_PER_CLUSTER
    }

    /// Write the boot sector into `out` (one sector).
    pub fn write_boot_sector(&self, label: &Filename, out: &mut [u8]) {
        out[..SECTOR_SIZE].fill(0);
        out[0..3].copy_from_slice(&[0xeb, 0x3c, 0x90]);
        out[3..11].copy_from_slice(b"MSWIN4.1");
        out[11..13].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        out[13] = Self::SECTORS_PER_CLUSTER as u8;
        out[14..16].copy_from_slice(&(Self::RESERVED_SECTORS as u16).to_le_bytes());
        out[16] = Self::NUM_FATS as u8;
        out[17..19].copy_from_slice(&(Self::ROOT_ENTRIES as u16).to_le_bytes());
        if self.total_sectors <= u16::MAX as u32 {
            out[19..21].copy_from_slice(&(self.total_sectors as u16).to_le_bytes());
        } else {
            out[32..36].copy_from_slice(&self.total_sectors.to_le_bytes());
        }
        out[21] = MEDIA_DESCRIPTOR;
        out[22..24].copy_from_slice(&(self.sectors_per_fat as u16).to_le_bytes());
        out[24..26].copy_from_slice(&1u16.to_le_bytes());
        out[26..28].copy_from_slice(&1u16.to_le_bytes());
        out[38] = BOOT_SIGNATURE_EXT;
        out[39..43].copy_from_slice(&VOLUME_ID.to_le_bytes());
        out[43..54].copy_from_slice(label);
        out[54..62].copy_from_slice(b"FAT12   ");
        out[510] = 0x55;
        out[511] = 0xaa;
    }
}

/// FAT entry of the two reserved clusters.
pub fn reserved_fat_entry(cluster: u32) -> u16 {
    match cluster {
        0 => 0xf00 | MEDIA_DESCRIPTOR as u16,
        _ => 0xfff,
    }
}

/// Byte `offset` of a packed FAT12 table whose entries come from `entry`.
pub fn fat12_byte(offset: u32, entry: impl Fn(u32) -> u16) -> u8 {
    let pair = offset / 3;
    let first = entry(2 * pair);
    let second = entry(2 * pair + 1);
    match offset % 3 {
        0 => first as u8,
        1 => ((first >> 8) & 0x0f) as u8 | ((second & 0x0f) << 4) as u8,
        _ => (second >> 4) as u8,
    }
}

/// A root directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntry {
    /// 8.3 name.
    pub name: Filename,
    /// Raw attribute bits.
    pub attributes: u8,
    /// Creation time, tenths of a second.
    pub created_time_ms: u8,
    /// Creation time.
    pub created_time: u16,
    /// Creation date.
    pub created_date: u16,
    /// Last access date.
    pub accessed_date: u16,
    /// Upper half of the first cluster (zero on FAT12).
    pub first_cluster_high: u16,
    /// Modification time.
    pub modified_time: u16,
    /// Modification date.
    pub modified_date: u16,
    /// Lower half of the first cluster.
    pub first_cluster_low: u16,
    /// Size in bytes.
    pub filesize: u32,
}

impl DirEntry {
    /// Entry for a file starting at `first_cluster`.
    pub fn file(name: &Filename, attributes: Attributes, first_cluster: u32, filesize: u32) -> Self {
        Self {
            name: *name,
            attributes: attributes.bits(),
            first_cluster_high: (first_cluster >> 16) as u16,
            first_cluster_low: first_cluster as u16,
            filesize,
            ..Self::default()
        }
    }

    /// Decode from 32 bytes.
    pub fn parse(raw: &[u8]) -> Self {
        let u16_at = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let mut name = [0; 11];
        name.copy_from_slice(&raw[..11]);
        Self {
            name,
            attributes: raw[11],
            created_time_ms: raw[13],
            created_time: u16_at(14),
            created_date: u16_at(16),
            accessed_date: u16_at(18),
            first_cluster_high: u16_at(20),
            modified_time: u16_at(22),
            modified_date: u16_at(24),
            first_cluster_low: u16_at(26),
            filesize: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    /// Encode into 32 bytes.
    pub fn write(&self, out: &mut [u8]) {
        out[..11].copy_from_slice(&self.name);
        out[11] = self.attributes;
        out[12] = 0;
        out[13] = self.created_time_ms;
        out[14..16].copy_from_slice(&self.created_time.to_le_bytes());
        out[16..18].copy_from_slice(&self.created_date.to_le_bytes());
        out[18..20].copy_from_slice(&self.accessed_date.to_le_bytes());
        out[20..22].copy_from_slice(&self.first_cluster_high.to_le_bytes());
        out[22..24].copy_from_slice(&self.modified_time.to_le_bytes());
        out[24..26].copy_from_slice(&self.modified_date.to_le_bytes());
        out[26..28].copy_from_slice(&self.first_cluster_low.to_le_bytes());
        out[28..32].copy_from_slice(&self.filesize.to_le_bytes());
    }

    /// Attribute bits, unknown bits dropped.
    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.attributes)
    }

    /// First data cluster.
    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high as u32) << 16 | self.first_cluster_low as u32
    }

    /// Extension part of the name.
    pub fn extension(&self) -> &[u8] {
        &self.name[8..]
    }

    /// Slot has never been used.
    pub fn is_free(&self) -> bool {
        self.name[0] == 0
    }

    /// Slot holds a deleted entry.
    pub fn is_erased(&self) -> bool {
        self.name[0] == ERASED_MARKER
    }

    /// Slot holds a long file name fragment.
    pub fn is_lfn(&self) -> bool {
        self.attributes & Attributes::LFN.bits() == Attributes::LFN.bits()
    }

    /// Slot holds the volume label.
    pub fn is_volume_label(&self) -> bool {
        !self.is_lfn() && self.attributes().contains(Attributes::VOLUME_ID)
    }

    /// Slot names a live file or directory.
    pub fn is_live(&self) -> bool {
        !self.is_free() && !self.is_erased() && !self.is_lfn() && !self.is_volume_label()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_for_8mb() {
        let geometry = Geometry::for_disk_size(8 * 1024 * 1024);
        assert_eq!(geometry.total_sectors, 16512);
        assert_eq!(geometry.sectors_per_fat, 9);
        assert_eq!(geometry.root_start(), 19);
        assert_eq!(geometry.data_start(), 21);
        assert_eq!(geometry.cluster_sector(2), 21);
        assert_eq!(geometry.cluster_sector(3), 29);
        // every cluster has a FAT12 slot
        assert!(geometry.cluster_count() + 2 <= geometry.sectors_per_fat * 512 * 2 / 3);
    }

    #[test]
    fn large_disks_are_capped_to_fat12() {
        let largest = Geometry::for_disk_size(MAX_DISK_SIZE);
        assert_eq!(largest.cluster_count(), 4044);
        assert!(largest.cluster_count() + 2 <= largest.sectors_per_fat * 512 * 2 / 3);
        for size in [16 * 1024 * 1024, 64 * 1024 * 1024, u32::MAX] {
            let geometry = Geometry::for_disk_size(size);
            assert_eq!(geometry, largest);
            assert!(geometry.cluster_count() <= MAX_CLUSTERS);
        }
    }

    #[test]
    fn boot_sector_fields() {
        let geometry = Geometry::for_disk_size(8 * 1024 * 1024);
        let mut sector = [0xaau8; 512];
        geometry.write_boot_sector(b"DAPLINK    ", &mut sector);
        assert_eq!(&sector[11..13], &[0x00, 0x02]);
        assert_eq!(sector[13], 8);
        assert_eq!(u16::from_le_bytes([sector[19], sector[20]]), 16512);
        assert_eq!(sector[21], 0xf8);
        assert_eq!(&sector[39..43], &[0x74, 0x19, 0x02, 0x27]);
        assert_eq!(&sector[43..54], b"DAPLINK    ");
        assert_eq!(&sector[54..62], b"FAT12   ");
        assert_eq!(&sector[510..], &[0x55, 0xaa]);
    }

    #[test]
    fn fat12_packing() {
        // entries 0xff8, 0xfff, 0x003, 0xfff
        let entries = [0xff8u16, 0xfff, 0x003, 0xfff];
        let bytes: [u8; 6] = core::array::from_fn(|i| fat12_byte(i as u32, |c| entries[c as usize]));
        assert_eq!(bytes, [0xf8, 0xff, 0xff, 0x03, 0xf0, 0xff]);
    }

    #[test]
    fn dir_entry_layout() {
        let entry = DirEntry::file(b"FAIL    TXT", Attributes::READ_ONLY, 0x0102, 0x0304_0506);
        let mut raw = [0u8; 32];
        entry.write(&mut raw);
        assert_eq!(&raw[..11], b"FAIL    TXT");
        assert_eq!(raw[11], 0x01);
        assert_eq!(&raw[26..28], &[0x02, 0x01]);
        assert_eq!(&raw[28..32], &[0x06, 0x05, 0x04, 0x03]);
        assert_eq!(DirEntry::parse(&raw), entry);
        assert_eq!(entry.extension(), b"TXT");
        assert!(entry.is_live());
    }

    #[test]
    fn special_entries() {
        let mut raw = [0u8; 32];
        raw[..11].copy_from_slice(b"Ab\0c\0d\0e\0f\0");
        raw[11] = 0x0f;
        assert!(DirEntry::parse(&raw).is_lfn());
        assert!(!DirEntry::parse(&raw).is_live());
        raw[11] = 0x08;
        assert!(DirEntry::parse(&raw).is_volume_label());
        raw[11] = 0x20;
        raw[0] = ERASED_MARKER;
        assert!(DirEntry::parse(&raw).is_erased());
        assert!(DirEntry::parse(&[0u8; 32]).is_free());
    }
}
