//! Memory-mapped access to NAND dump files

use nix::sys::mman::{mmap, msync, munmap, MapFlags, MsFlags, ProtFlags};

use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;

/// The raw mapping shared by [FileMapping] and [FileMappingMut]; unmapped on drop.
#[derive(Debug)]
struct Mapping {
    mem: NonNull<c_void>,
    len: usize,
}

// The mapping is plain memory owned by this object.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn new(file: &File, len: u64, prot: ProtFlags, flags: MapFlags) -> anyhow::Result<Self> {
        let len = usize::try_from(len)?;
        let length = NonZeroUsize::new(len).ok_or(anyhow::anyhow!("cannot map an empty file"))?;

        let mem = unsafe { mmap(None, length, prot, flags, file, 0)? };

        Ok(Self { mem, len })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr().cast(), self.len) }
    }

    /// Only sound for mappings created with `PROT_WRITE`
    unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.mem.as_ptr().cast(), self.len)
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.mem, self.len) };
    }
}

/// A dump file mapped read-only.
///
/// The mapping is private and can't be written through, so it only hands out `&[u8]`:
///
/// ```compile_fail
/// use nand_ecc::nand::mapping::FileMapping;
///
/// fn correct(_image: &mut [u8]) {}
///
/// let mut mapping = FileMapping::open("dump.bin").unwrap();
/// correct(&mut mapping);
/// ```
///
/// ```compile_fail
/// use nand_ecc::nand::mapping::FileMapping;
///
/// let mut mapping = FileMapping::open("dump.bin").unwrap();
/// mapping[0] = 9;
/// ```
#[derive(Debug)]
pub struct FileMapping(Mapping);

impl FileMapping {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mapping = Mapping::new(&file, len, ProtFlags::PROT_READ, MapFlags::MAP_PRIVATE)?;
        Ok(Self(mapping))
    }
}

impl Deref for FileMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// A dump file mapped read-write. The mapping is shared, so modifications land in the file.
#[derive(Debug)]
pub struct FileMappingMut(Mapping);

impl FileMappingMut {
    /// Map a file, creating it if needed.
    ///
    /// If `size` is given and the file is shorter, the file is grown to `size` bytes first and
    /// exactly `size` bytes are mapped.
    pub fn open<P: AsRef<Path>>(path: P, size: Option<u64>) -> anyhow::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut len = file.metadata()?.len();
        if let Some(size) = size {
            if len < size {
                file.set_len(size)?;
            }
            len = size;
        }

        let mapping = Mapping::new(
            &file,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
        )?;
        Ok(Self(mapping))
    }

    /// Synchronously write modified pages back to the file
    pub fn flush(&self) -> anyhow::Result<()> {
        unsafe { msync(self.0.mem, self.0.len, MsFlags::MS_SYNC)? };
        Ok(())
    }
}

impl Deref for FileMappingMut {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl DerefMut for FileMappingMut {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Mapped with PROT_WRITE in FileMappingMut::open.
        unsafe { self.0.as_mut_slice() }
    }
}

#[cfg(test)]
fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("nand-ecc-{}-{name}", std::process::id()))
}

#[test]
fn test_map_readonly() -> anyhow::Result<()> {
    let path = temp_path("readonly");
    std::fs::write(&path, [1u8, 2, 3, 4, 5])?;

    let mapping = FileMapping::open(&path)?;
    assert_eq!(mapping.len(), 5);
    assert_eq!(&mapping[..], [1, 2, 3, 4, 5]);
    drop(mapping);

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_map_writable_grows_and_persists() -> anyhow::Result<()> {
    let path = temp_path("writable");
    std::fs::write(&path, [0xAAu8; 16])?;

    let mut mapping = FileMappingMut::open(&path, Some(64))?;
    assert_eq!(mapping.len(), 64);
    assert_eq!(&mapping[..16], [0xAA; 16]);
    assert!(mapping[16..].iter().all(|&x| x == 0));

    mapping[60..].copy_from_slice(&[1, 2, 3, 4]);
    mapping.flush()?;
    drop(mapping);

    let content = std::fs::read(&path)?;
    assert_eq!(content.len(), 64);
    assert_eq!(content[60..], [1, 2, 3, 4]);

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_correct_mapped_dump_in_place() -> anyhow::Result<()> {
    use crate::ecc::{process_pages, process_pages_in_place, Codeword, Disposition};
    use crate::nand::{NandSection, NandStructure, PageStructure};

    let path = temp_path("in-place");
    std::fs::write(&path, [0x0Fu8; 8 * 4])?;

    let structure: PageStructure = "0:6:d,0:2:e".parse()?;
    let nand = NandStructure::new(vec![NandSection::new(structure, 0, 0)])?;
    let flip = |cw: &mut Codeword<'_>| {
        cw.data.iter_mut().for_each(|b| *b = !*b);
        Disposition::WriteBack
    };

    // A read-only mapping can only be an input
    let readonly = FileMapping::open(&path)?;
    assert_eq!(process_pages(&readonly, None, 8, &nand, &flip, 2)?, 4);
    assert!(readonly.iter().all(|&b| b == 0x0F));
    drop(readonly);

    let mut mapping = FileMappingMut::open(&path, None)?;
    assert_eq!(process_pages_in_place(&mut mapping, 8, &nand, &flip, 2)?, 4);
    mapping.flush()?;
    drop(mapping);

    let content = std::fs::read(&path)?;
    for page in content.chunks_exact(8) {
        assert_eq!(page, [0xF0, 0xF0, 0xF0, 0xF0, 0xF0, 0xF0, 0x0F, 0x0F]);
    }

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_map_empty_file_fails() -> anyhow::Result<()> {
    let path = temp_path("empty");
    std::fs::write(&path, [0u8; 0])?;

    assert!(FileMapping::open(&path).is_err());
    assert!(FileMappingMut::open(&path, None).is_err());

    std::fs::remove_file(&path)?;
    Ok(())
}
