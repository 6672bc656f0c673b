//! Flash-backed user settings.
//!
//! Two 256-byte pages: a fixed-layout fingerprint page carrying the
//! magic, flash geometry and the factory-programmed hardware identity,
//! and a data page with the user-tunable registers. The fingerprint
//! page also holds an inverted page map for simple wear levelling: each
//! write consumes the next still-set bit and programs a fresh data
//! page; when the sector is exhausted it is erased and the cycle starts
//! over. Read failures fall back to factory defaults without affecting
//! live sessions.

use alloc::boxed::Box;
use alloc::rc::Rc;
use core::cell::RefCell;
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const PAGE_SIZE: usize = 256;
pub const PAGES_PER_SECTOR: u8 = 16;

const MAGIC: [u8; 8] = [0xC1, 0xA5, 0x51, 0xF1, 0xED, 0xC0, 0xFF, 0xEE];

/// Page 0 bit in the map is the fingerprint itself.
const FRESH_PAGE_MAP: u32 = 0xFFFF_FFFE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be read or programmed.
    Io,
    /// No valid settings found in the store.
    Invalid,
}

/// Persistent page storage, typically the last flash sector.
pub trait SettingsStore {
    fn read_page(&mut self, page: u8, buf: &mut [u8; PAGE_SIZE]) -> Result<(), StoreError>;
    /// Erase the whole settings sector (all bytes back to 0xFF).
    fn erase(&mut self) -> Result<(), StoreError>;
    fn program_page(&mut self, page: u8, data: &[u8; PAGE_SIZE]) -> Result<(), StoreError>;
}

/// Fixed-layout fingerprint page contents.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
#[repr(C)]
pub struct Fingerprint {
    pub magic: [u8; 8],
    /// Inverted map of consumed pages; bit n cleared = page n programmed.
    pub page_map: u32,
    /// Flash geometry, in 256-byte pages.
    pub page_size: u8,
    pub sector_size: u8,
    pub sector_count: u8,
    pub version: u8,
    pub serial_no: u32,
    pub hardware_id: u16,
    pub hardware_version: u16,
    pub hardware_revision: u16,
    reserved: [u8; 2],
}

const _: () = assert!(size_of::<Fingerprint>() <= PAGE_SIZE);

const FACTORY_FINGERPRINT: Fingerprint = Fingerprint {
    magic: MAGIC,
    page_map: 0xFFFF_FFFF,
    page_size: 1,
    sector_size: 16,
    sector_count: 1,
    version: 0,
    serial_no: 0,
    hardware_id: 0,
    hardware_version: 0,
    hardware_revision: 0,
    reserved: [0xFF; 2],
};

/// The user-tunable registers, stored postcard-encoded in a data page.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct SettingsData {
    /// S300: absolute MNP throttle delay in microseconds.
    pub mnpt_absolute_delay: u32,
    /// S301: MNP throttle delay in characters at the current bitrate.
    pub mnpt_num_char_delay: u8,
    /// S12 on the UART-side Hayes filter, in 1/50 s.
    pub hayes0_esc_guard_time: u8,
    /// S12 on the CDC-side Hayes filter, in 1/50 s.
    pub hayes1_esc_guard_time: u8,
}

impl Default for SettingsData {
    fn default() -> SettingsData {
        SettingsData {
            mnpt_absolute_delay: 400,
            mnpt_num_char_delay: 8,
            hayes0_esc_guard_time: 50,
            hayes1_esc_guard_time: 50,
        }
    }
}

pub struct UserSettings {
    pub data: SettingsData,
    fingerprint: Fingerprint,
    store: Option<Box<dyn SettingsStore>>,
}

/// Settings are shared by the Hayes filters, the throttle and the
/// bridge; all access happens on the scheduler thread.
pub type SettingsRef = Rc<RefCell<UserSettings>>;

impl UserSettings {
    pub fn new(store: Option<Box<dyn SettingsStore>>) -> UserSettings {
        UserSettings {
            data: SettingsData::default(),
            fingerprint: FACTORY_FINGERPRINT,
            store,
        }
    }

    pub fn shared(store: Option<Box<dyn SettingsStore>>) -> SettingsRef {
        Rc::new(RefCell::new(UserSettings::new(store)))
    }

    pub fn serial(&self) -> u32 {
        self.fingerprint.serial_no
    }

    pub fn hardware_id(&self) -> u16 {
        self.fingerprint.hardware_id
    }

    pub fn hardware_version(&self) -> u16 {
        self.fingerprint.hardware_version
    }

    pub fn hardware_revision(&self) -> u16 {
        self.fingerprint.hardware_revision
    }

    /// Reset the in-memory settings to factory state. Does not touch
    /// the store; call [`UserSettings::write`] to persist.
    pub fn factory_reset(&mut self) {
        self.fingerprint = FACTORY_FINGERPRINT;
        self.data = SettingsData::default();
    }

    /// Load settings from the store. On any failure the factory
    /// defaults stay in effect and the error is reported.
    pub fn read(&mut self) -> Result<(), StoreError> {
        let Some(store) = self.store.as_mut() else {
            return Err(StoreError::Invalid);
        };
        let mut page = [0u8; PAGE_SIZE];
        store.read_page(0, &mut page)?;
        let fp = Fingerprint::read_from_bytes(&page[..size_of::<Fingerprint>()])
            .map_err(|_| StoreError::Invalid)?;
        if fp.magic != MAGIC
            || fp.page_size != FACTORY_FINGERPRINT.page_size
            || fp.sector_size != FACTORY_FINGERPRINT.sector_size
        {
            log::warn!("settings: invalid fingerprint, using factory defaults");
            self.factory_reset();
            return Err(StoreError::Invalid);
        }
        let Some(active) = Self::active_page(fp.page_map) else {
            log::warn!("settings: no data page programmed yet");
            self.fingerprint = fp;
            self.data = SettingsData::default();
            return Err(StoreError::Invalid);
        };
        store.read_page(active, &mut page)?;
        match postcard::from_bytes(&page) {
            Ok(data) => {
                self.fingerprint = fp;
                self.data = data;
                log::info!("settings: loaded page {active}");
                Ok(())
            }
            Err(_) => {
                log::warn!("settings: corrupt data page {active}, using factory defaults");
                self.fingerprint = fp;
                self.data = SettingsData::default();
                Err(StoreError::Invalid)
            }
        }
    }

    /// Persist the current settings, consuming the next free page or
    /// recycling the sector when it is exhausted.
    pub fn write(&mut self) -> Result<(), StoreError> {
        let next = match Self::next_free_page(self.fingerprint.page_map) {
            Some(page) => page,
            None => {
                self.store_mut()?.erase()?;
                self.fingerprint.page_map = FRESH_PAGE_MAP;
                1
            }
        };
        self.fingerprint.page_map &= !(1u32 << next);
        let fp_page = Self::page_of(self.fingerprint.as_bytes());
        let mut data_page = [0xFFu8; PAGE_SIZE];
        postcard::to_slice(&self.data, &mut data_page).map_err(|_| StoreError::Io)?;
        let store = self.store_mut()?;
        store.program_page(0, &fp_page)?;
        store.program_page(next, &data_page)?;
        log::info!("settings: wrote page {next}");
        Ok(())
    }

    /// Program the factory identity. Forces a sector erase so the
    /// fingerprint page can be rewritten cleanly.
    pub fn write_serial(
        &mut self,
        serial: u32,
        id: u16,
        version: u16,
        revision: u16,
    ) -> Result<(), StoreError> {
        self.fingerprint.serial_no = serial;
        self.fingerprint.hardware_id = id;
        self.fingerprint.hardware_version = version;
        self.fingerprint.hardware_revision = revision;
        self.store_mut()?.erase()?;
        self.fingerprint.page_map = FRESH_PAGE_MAP;
        self.write()
    }

    fn store_mut(&mut self) -> Result<&mut Box<dyn SettingsStore>, StoreError> {
        self.store.as_mut().ok_or(StoreError::Invalid)
    }

    fn page_of(bytes: &[u8]) -> [u8; PAGE_SIZE] {
        let mut page = [0xFFu8; PAGE_SIZE];
        page[..bytes.len()].copy_from_slice(bytes);
        page
    }

    /// The most recently programmed data page: the last cleared bit
    /// before the first still-set one.
    fn active_page(page_map: u32) -> Option<u8> {
        let mut active = None;
        for page in 1..PAGES_PER_SECTOR {
            if page_map & (1 << page) != 0 {
                break;
            }
            active = Some(page);
        }
        active
    }

    fn next_free_page(page_map: u32) -> Option<u8> {
        (1..PAGES_PER_SECTOR).find(|&page| page_map & (1 << page) != 0)
    }
}
