//! Shared memory segment implementation
//!
//! The daemon is the sole creator of named segments (exclusive create);
//! applications may only open what already exists. A process that finds no
//! segment to open concludes the daemon is not running.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    os::fd::OwnedFd,
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use memmap2::{MmapMut, MmapOptions};
use nix::{
    sys::memfd::{memfd_create, MemFdCreateFlag},
    unistd::ftruncate,
};

use crate::{
    error::{MonetError, Result},
    layout::{SegmentHeader, SegmentId, SegmentTable},
};

/// Types of shared memory backing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackingType {
    /// File on a tmpfs directory, openable by other processes
    FileBacked { dir: PathBuf },
    /// Anonymous memory file descriptor, private to this process tree
    MemFd,
}

/// How a segment comes into existence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPolicy {
    /// Create the backing file, failing if it already exists
    ExclusiveCreate,
    /// Open an existing file, failing if it does not exist
    OpenExisting,
}

/// Configuration for creating or opening a segment
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    pub name: String,
    pub segment_id: SegmentId,
    pub size: usize,
    pub backing: BackingType,
    pub policy: CreationPolicy,
    /// Unix permission bits applied on creation
    pub permissions: u32,
    /// Group name given ownership of the backing file, if any
    pub group: Option<String>,
}

impl SegmentConfig {
    pub fn new(name: impl Into<String>, segment_id: SegmentId, size: usize) -> Self {
        Self {
            name: name.into(),
            segment_id,
            size,
            backing: BackingType::MemFd,
            policy: CreationPolicy::ExclusiveCreate,
            permissions: 0o660,
            group: None,
        }
    }

    pub fn with_backing(mut self, backing: BackingType) -> Self {
        self.backing = backing;
        self
    }

    pub fn with_policy(mut self, policy: CreationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MonetError::invalid_parameter("name", "segment name cannot be empty"));
        }
        if self.size < std::mem::size_of::<SegmentHeader>() {
            return Err(MonetError::invalid_parameter(
                "size",
                "segment too small for its header",
            ));
        }
        Ok(())
    }

    fn file_path(&self) -> Option<PathBuf> {
        match &self.backing {
            BackingType::FileBacked { dir } => Some(dir.join(format!("monet_{}", self.name))),
            BackingType::MemFd => None,
        }
    }
}

/// A mapped shared memory segment
#[derive(Debug)]
pub struct SharedMemorySegment {
    name: String,
    segment_id: SegmentId,
    size: usize,
    mmap: MmapMut,
    _file: Option<File>,
    _owned_fd: Option<OwnedFd>,
    /// Path to unlink on drop when this process owns the segment
    unlink_path: Option<PathBuf>,
}

impl SharedMemorySegment {
    /// Create a segment as its exclusive owner and write a fresh header
    pub fn create(config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        if config.policy != CreationPolicy::ExclusiveCreate {
            return Err(MonetError::invalid_parameter(
                "policy",
                "create requires the exclusive-create policy",
            ));
        }

        let mut segment = match &config.backing {
            BackingType::FileBacked { .. } => Self::create_file_backed(&config)?,
            BackingType::MemFd => Self::create_memfd(&config)?,
        };

        let header = SegmentHeader::new(config.segment_id as u32, config.size as u64);
        unsafe {
            std::ptr::write(segment.mmap.as_mut_ptr() as *mut SegmentHeader, header);
        }
        Ok(segment)
    }

    /// Open an existing segment and validate its header
    ///
    /// Never creates backing storage: a missing file means the daemon is
    /// not running.
    pub fn open(config: SegmentConfig) -> Result<Self> {
        config.validate()?;
        let path = config.file_path().ok_or_else(|| {
            MonetError::invalid_parameter("backing", "only file-backed segments can be opened")
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MonetError::daemon_unavailable(format!(
                    "segment {} does not exist",
                    path.display()
                )),
                std::io::ErrorKind::PermissionDenied => MonetError::PermissionDenied {
                    message: format!("cannot open segment {}", path.display()),
                },
                _ => MonetError::from_io(e, "failed to open segment"),
            })?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(config.size)
                .map_mut(&file)
                .map_err(|e| MonetError::from_io(e, "failed to map segment"))?
        };

        let segment = Self {
            name: config.name,
            segment_id: config.segment_id,
            size: config.size,
            mmap,
            _file: Some(file),
            _owned_fd: None,
            unlink_path: None,
        };
        segment.header().validate()?;
        Ok(segment)
    }

    fn create_file_backed(config: &SegmentConfig) -> Result<Self> {
        let path = config.file_path().expect("file-backed config has a path");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(config.permissions)
            .open(&path)
            .map_err(|e| MonetError::shm_create(&config.name, format!("{}: {}", path.display(), e)))?;

        file.set_len(config.size as u64)
            .map_err(|e| MonetError::shm_create(&config.name, format!("truncate failed: {}", e)))?;

        if let Some(group) = &config.group {
            apply_group(&path, group)?;
        }

        let mmap = unsafe {
            MmapOptions::new()
                .len(config.size)
                .map_mut(&file)
                .map_err(|e| MonetError::shm_create(&config.name, format!("mmap failed: {}", e)))?
        };

        Ok(Self {
            name: config.name.clone(),
            segment_id: config.segment_id,
            size: config.size,
            mmap,
            _file: Some(file),
            _owned_fd: None,
            unlink_path: Some(path),
        })
    }

    fn create_memfd(config: &SegmentConfig) -> Result<Self> {
        let name_cstr = CString::new(config.name.clone())
            .map_err(|_| MonetError::invalid_parameter("name", "name contains null bytes"))?;

        let owned_fd = memfd_create(&name_cstr, MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(|e| MonetError::shm_create(&config.name, format!("memfd_create: {}", e)))?;

        ftruncate(&owned_fd, config.size as i64)
            .map_err(|e| MonetError::shm_create(&config.name, format!("ftruncate: {}", e)))?;

        let mmap = unsafe {
            MmapOptions::new()
                .len(config.size)
                .map_mut(&owned_fd)
                .map_err(|e| MonetError::shm_create(&config.name, format!("mmap failed: {}", e)))?
        };

        Ok(Self {
            name: config.name.clone(),
            segment_id: config.segment_id,
            size: config.size,
            mmap,
            _file: None,
            _owned_fd: Some(owned_fd),
            unlink_path: None,
        })
    }

    /// Segment header view
    pub fn header(&self) -> &SegmentHeader {
        unsafe { &*(self.mmap.as_ptr() as *const SegmentHeader) }
    }

    /// Mutable segment header view
    ///
    /// # Safety
    /// Caller must be the daemon during single-threaded startup layout.
    pub unsafe fn header_mut(&self) -> &mut SegmentHeader {
        &mut *(self.mmap.as_ptr() as *mut SegmentHeader)
    }

    /// Local base address of the mapping
    pub fn base_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether dropping this handle unlinks the backing file
    pub fn is_owner(&self) -> bool {
        self.unlink_path.is_some() || self._owned_fd.is_some()
    }

    /// Register this mapping in a process-local segment table
    pub fn register_with(&self, table: &SegmentTable) {
        unsafe { table.insert(self.segment_id, self.base_ptr(), self.size) };
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        if let Some(path) = &self.unlink_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

fn apply_group(path: &Path, group: &str) -> Result<()> {
    let entry = nix::unistd::Group::from_name(group)
        .map_err(|e| MonetError::config("group", format!("lookup failed: {}", e)))?
        .ok_or_else(|| MonetError::config("group", format!("unknown group {}", group)))?;
    nix::unistd::chown(path, None, Some(entry.gid)).map_err(|e| MonetError::PermissionDenied {
        message: format!("chown {} to group {}: {}", path.display(), group, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memfd_segment_has_valid_header() {
        let config = SegmentConfig::new("header_test", 7, 64 * 1024);
        let segment = SharedMemorySegment::create(config).unwrap();
        assert!(segment.header().validate().is_ok());
        assert_eq!(segment.header().segment_id, 7);
        assert!(segment.is_owner());
    }

    #[test]
    fn exclusive_create_rejects_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let backing = BackingType::FileBacked {
            dir: dir.path().to_path_buf(),
        };
        let config = SegmentConfig::new("excl", 1, 16 * 1024).with_backing(backing.clone());

        let _first = SharedMemorySegment::create(config.clone()).unwrap();
        assert!(matches!(
            SharedMemorySegment::create(config),
            Err(MonetError::ShmCreateFailed { .. })
        ));
    }

    #[test]
    fn open_missing_segment_reports_daemon_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig::new("absent", 2, 16 * 1024)
            .with_backing(BackingType::FileBacked {
                dir: dir.path().to_path_buf(),
            })
            .with_policy(CreationPolicy::OpenExisting);

        assert!(matches!(
            SharedMemorySegment::open(config),
            Err(MonetError::DaemonUnavailable { .. })
        ));
    }

    #[test]
    fn open_sees_creator_header() {
        let dir = tempfile::tempdir().unwrap();
        let backing = BackingType::FileBacked {
            dir: dir.path().to_path_buf(),
        };
        let create = SegmentConfig::new("shared", 3, 16 * 1024).with_backing(backing.clone());
        let created = SharedMemorySegment::create(create).unwrap();

        let open = SegmentConfig::new("shared", 3, 16 * 1024)
            .with_backing(backing)
            .with_policy(CreationPolicy::OpenExisting);
        let opened = SharedMemorySegment::open(open).unwrap();

        assert_eq!(opened.header().segment_id, created.header().segment_id);
        assert!(!opened.is_owner());
    }
}
