//! Virtual FAT12 volume served to the host over mass storage.
//!
//! Nothing is stored as a disc image. The boot sector and FATs are generated
//! on every read from the [`Geometry`] and the file table, file contents come
//! from [`FileSource`]s and the root directory is a RAM copy the host can
//! write to. Writes to the root directory are diffed slot by slot and reported
//! as [`FileChange`]s; all other writes are left to the caller.

use heapless::Vec;
use log::{trace, warn};

pub mod fat;

pub use fat::{Attributes, DirEntry, Filename, Geometry, DIR_ENTRY_SIZE, SECTOR_SIZE};

/// Files the volume can carry besides the label.
pub const MAX_FILES: usize = 16;

const ROOT_BYTES: usize = Geometry::ROOT_ENTRIES as usize * DIR_ENTRY_SIZE;
const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;
// boot, two FATs, root, two per file, trailing blank
const MAX_SEGMENTS: usize = 5 + 2 * MAX_FILES;

/// Fills one sector of generated file content.
///
/// Gets the sector index within the file and a zeroed sector buffer, returns
/// the number of bytes produced.
pub type ReadFn = fn(sector: u32, buf: &mut [u8]) -> usize;

/// Where a file's content comes from.
#[derive(Clone)]
pub enum FileSource {
    /// Constant data.
    Static(&'static [u8]),
    /// Content rendered when the volume was built.
    Rendered(Vec<u8, SECTOR_SIZE>),
    /// Produced on demand, `size` bytes long.
    Callback {
        /// Sector reader.
        read: ReadFn,
        /// File size in bytes.
        size: u32,
    },
}

impl FileSource {
    fn size(&self) -> u32 {
        match self {
            FileSource::Static(data) => data.len() as u32,
            FileSource::Rendered(data) => data.len() as u32,
            FileSource::Callback { size, .. } => *size,
        }
    }

    fn read(&self, sector: u32, out: &mut [u8]) {
        let start = sector as usize * SECTOR_SIZE;
        let copy = |data: &[u8], out: &mut [u8]| {
            if start < data.len() {
                let len = (data.len() - start).min(SECTOR_SIZE);
                out[..len].copy_from_slice(&data[start..start + len]);
            }
        };
        match self {
            FileSource::Static(data) => copy(*data, out),
            FileSource::Rendered(data) => copy(data.as_slice(), out),
            FileSource::Callback { read, size } => {
                if start < *size as usize {
                    let len = read(sector, &mut out[..SECTOR_SIZE]).min(SECTOR_SIZE);
                    out[len..SECTOR_SIZE].fill(0);
                }
            }
        }
    }
}

/// Root directory slot of a file, its identity for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FileHandle(pub u16);

/// How a root directory slot changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChangeKind {
    /// A name appeared in an empty or deleted slot.
    Created,
    /// A live name was erased.
    Deleted,
    /// Size, attributes or first cluster changed under the same name.
    Changed,
}

/// A root directory change made by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChange {
    /// What happened.
    pub kind: ChangeKind,
    /// Which slot.
    pub handle: FileHandle,
    /// The new entry, or the old one for [`ChangeKind::Deleted`].
    pub entry: DirEntry,
}

/// Building the volume failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VfsError {
    /// The file table is full.
    #[error("too many files")]
    TooManyFiles,
    /// No clusters left.
    #[error("volume full")]
    DiskFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    BootSector,
    Fat,
    RootDir,
    File(usize),
    Blank,
}

#[derive(Clone)]
struct VfsFile {
    source: FileSource,
    first_cluster: u32,
    clusters: u32,
}

/// The emulated volume.
pub struct VirtualFs {
    geometry: Geometry,
    label: Filename,
    files: Vec<VfsFile, MAX_FILES>,
    next_cluster: u32,
    root: [u8; ROOT_BYTES],
    segments: Vec<(Segment, u32), MAX_SEGMENTS>,
}

impl VirtualFs {
    /// Empty volume labelled `label` with room for `disk_size` bytes.
    pub fn new(label: &Filename, disk_size: u32) -> Self {
        let mut fs = Self {
            geometry: Geometry::for_disk_size(disk_size),
            label: *label,
            files: Vec::new(),
            next_cluster: 2,
            root: [0; ROOT_BYTES],
            segments: Vec::new(),
        };
        let volume = DirEntry::file(label, Attributes::VOLUME_ID | Attributes::ARCHIVE, 0, 0);
        volume.write(&mut fs.root[..DIR_ENTRY_SIZE]);
        fs.layout();
        fs
    }

    /// Volume layout.
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Sectors on the volume.
    pub fn sector_count(&self) -> u32 {
        self.geometry.total_sectors
    }

    /// Add a file after the existing ones.
    pub fn add_file(&mut self, name: &Filename, attributes: Attributes, source: FileSource) -> Result<FileHandle, VfsError> {
        if self.files.is_full() {
            return Err(VfsError::TooManyFiles);
        }
        let size = source.size();
        let clusters = (size + self.geometry.cluster_bytes() - 1) / self.geometry.cluster_bytes();
        if self.next_cluster + clusters > self.geometry.cluster_count() + 2 {
            return Err(VfsError::DiskFull);
        }
        let first_cluster = if clusters == 0 { 0 } else { self.next_cluster };
        let slot = self.files.len() + 1;
        let entry = DirEntry::file(name, attributes, first_cluster, size);
        entry.write(&mut self.root[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]);
        self.files
            .push(VfsFile { source, first_cluster, clusters })
            .map_err(|_| VfsError::TooManyFiles)?;
        self.next_cluster += clusters;
        self.layout();
        Ok(FileHandle(slot as u16))
    }

    /// Current root directory entry in `handle`'s slot.
    pub fn entry(&self, handle: FileHandle) -> Option<DirEntry> {
        let start = handle.0 as usize * DIR_ENTRY_SIZE;
        self.root.get(start..start + DIR_ENTRY_SIZE).map(DirEntry::parse)
    }

    /// First sector of the file described by `entry`, if it has data.
    pub fn start_sector(&self, entry: &DirEntry) -> Option<u32> {
        let cluster = entry.first_cluster();
        (cluster >= 2).then(|| self.geometry.cluster_sector(cluster))
    }

    /// Whether `sector` lies in the data region.
    pub fn is_data_sector(&self, sector: u32) -> bool {
        sector >= self.geometry.data_start() && sector < self.geometry.total_sectors
    }

    /// Fill `buf` (whole sectors) starting at `sector`.
    pub fn read_sectors(&self, sector: u32, buf: &mut [u8]) {
        for (i, chunk) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
            self.read_sector(sector + i as u32, chunk);
        }
    }

    /// Store host writes starting at `sector`, reporting root directory
    /// changes to `on_change`.
    pub fn write_sectors(&mut self, sector: u32, data: &[u8], mut on_change: impl FnMut(FileChange)) {
        for (i, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let sector = sector + i as u32;
            match self.locate(sector) {
                Some((Segment::RootDir, offset)) => self.write_root(offset, chunk, &mut on_change),
                other => trace!("vfs: write to sector {} ({:?}) not stored", sector, other.map(|s| s.0)),
            }
        }
    }

    fn read_sector(&self, sector: u32, out: &mut [u8]) {
        out.fill(0);
        let Some((segment, offset)) = self.locate(sector) else {
            return;
        };
        match segment {
            Segment::BootSector => self.geometry.write_boot_sector(&self.label, out),
            Segment::Fat => {
                let base = offset * SECTOR_SIZE as u32;
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte = fat::fat12_byte(base + i as u32, |cluster| self.fat_entry(cluster));
                }
            }
            Segment::RootDir => {
                let start = offset as usize * SECTOR_SIZE;
                let len = out.len().min(SECTOR_SIZE);
                out[..len].copy_from_slice(&self.root[start..start + len]);
            }
            Segment::File(index) => self.files[index].source.read(offset, out),
            Segment::Blank => {}
        }
    }

    fn write_root(&mut self, offset: u32, chunk: &[u8], on_change: &mut impl FnMut(FileChange)) {
        for (k, raw) in chunk.chunks_exact(DIR_ENTRY_SIZE).enumerate() {
            let slot = offset as usize * ENTRIES_PER_SECTOR + k;
            let stored = &mut self.root[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE];
            if stored == raw {
                continue;
            }
            let old = DirEntry::parse(stored);
            stored.copy_from_slice(raw);
            let new = DirEntry::parse(raw);
            let handle = FileHandle(slot as u16);

            if new.is_lfn() || new.is_volume_label() {
                continue;
            }
            match (old.is_live(), new.is_live()) {
                (true, false) => on_change(FileChange { kind: ChangeKind::Deleted, handle, entry: old }),
                (false, true) => on_change(FileChange { kind: ChangeKind::Created, handle, entry: new }),
                (true, true) if old.name != new.name => {
                    on_change(FileChange { kind: ChangeKind::Deleted, handle, entry: old });
                    on_change(FileChange { kind: ChangeKind::Created, handle, entry: new });
                }
                (true, true)
                    if old.filesize != new.filesize
                        || old.attributes != new.attributes
                        || old.first_cluster() != new.first_cluster() =>
                {
                    on_change(FileChange { kind: ChangeKind::Changed, handle, entry: new })
                }
                _ => {}
            }
        }
    }

    fn fat_entry(&self, cluster: u32) -> u16 {
        if cluster < 2 {
            return fat::reserved_fat_entry(cluster);
        }
        self.files
            .iter()
            .find(|f| f.clusters > 0 && (f.first_cluster..f.first_cluster + f.clusters).contains(&cluster))
            .map_or(0, |f| {
                if cluster + 1 == f.first_cluster + f.clusters {
                    0xfff
                } else {
                    cluster as u16 + 1
                }
            })
    }

    fn locate(&self, sector: u32) -> Option<(Segment, u32)> {
        let mut start = 0;
        for &(segment, len) in &self.segments {
            if sector < start + len {
                return Some((segment, sector - start));
            }
            start += len;
        }
        None
    }

    fn layout(&mut self) {
        let g = self.geometry;
        let per_cluster = Geometry::SECTORS_PER_CLUSTER;
        let mut segments: Vec<(Segment, u32), MAX_SEGMENTS> = Vec::new();
        let mut push = |segment, len: u32| {
            if len > 0 && segments.push((segment, len)).is_err() {
                warn!("vfs: segment table full, sector map truncated");
            }
        };
        push(Segment::BootSector, Geometry::RESERVED_SECTORS);
        push(Segment::Fat, g.sectors_per_fat);
        push(Segment::Fat, g.sectors_per_fat);
        push(Segment::RootDir, Geometry::ROOT_SECTORS);
        let mut used = g.data_start();
        for (index, file) in self.files.iter().enumerate() {
            let data = (file.source.size() + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32;
            push(Segment::File(index), data);
            push(Segment::Blank, file.clusters * per_cluster - data);
            used += file.clusters * per_cluster;
        }
        push(Segment::Blank, g.total_sectors - used);
        self.segments = segments;
    }
}
