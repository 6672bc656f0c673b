//! Removable storage card access.
//!
//! The Dock engine and the Hayes extension commands talk to the card
//! through this driver trait; the platform supplies the filesystem
//! implementation. Status codes keep the stable FatFS-flavoured
//! semantics the rest of the system expects, including the two custom
//! classifications for directory and package entries.

use alloc::rc::Rc;
use alloc::string::String;
use bitflags::bitflags;
use core::cell::RefCell;

/// Stable status codes for card operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Low-level storage failure.
    DiskError,
    /// The card is not mounted (absent or unreadable).
    NotMounted,
    /// No filesystem recognised on the card.
    NoFilesystem,
    /// The named file or directory does not exist.
    NoFile,
    /// The path component is not a directory.
    NoPath,
}

impl SdError {
    /// Human-readable code, used by the Hayes `AT[` extension.
    pub fn as_str(&self) -> &'static str {
        match self {
            SdError::DiskError => "DISK_ERROR",
            SdError::NotMounted => "NOT_MOUNTED",
            SdError::NoFilesystem => "NO_FILESYSTEM",
            SdError::NoFile => "NO_FILE",
            SdError::NoPath => "NO_PATH",
        }
    }
}

bitflags! {
    /// Directory entry attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryAttr: u8 {
        const DIRECTORY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const READ_ONLY = 0x08;
    }
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attr: EntryAttr,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attr.contains(EntryAttr::DIRECTORY)
    }

    /// Hidden and system entries never show up in Dock listings.
    pub fn is_visible(&self) -> bool {
        !self.attr.intersects(EntryAttr::HIDDEN | EntryAttr::SYSTEM)
    }

    pub fn is_package(&self) -> bool {
        !self.is_directory() && {
            let name = self.name.as_bytes();
            name.len() > 4 && name[name.len() - 4..].eq_ignore_ascii_case(b".pkg")
        }
    }
}

/// Platform filesystem access for the storage card.
pub trait SdCardDriver {
    /// The volume label, or an empty string when the card has none.
    fn label(&mut self) -> Result<String, SdError>;

    fn chdir(&mut self, path: &str) -> Result<(), SdError>;

    fn open_dir(&mut self) -> Result<(), SdError>;
    /// Next raw entry of the open directory; `None` at the end.
    fn read_dir(&mut self) -> Result<Option<DirEntry>, SdError>;
    fn close_dir(&mut self);

    fn open_file(&mut self, name: &str) -> Result<(), SdError>;
    /// Size of the open file in bytes.
    fn file_size(&mut self) -> u32;
    /// Read from the open file at its current position.
    fn read_file(&mut self, buf: &mut [u8]) -> Result<usize, SdError>;
    fn close_file(&mut self);
}

/// The card is shared between the Dock engine and the Hayes filters;
/// all access happens on the scheduler thread.
pub type SdCardRef = Rc<RefCell<dyn SdCardDriver>>;
