//! The Newton Docking protocol engine.
//!
//! The Dock protocol is a full duplex binary stream carried in MNP LT
//! payloads. Commands start with the magic `newtdock`, a four-byte
//! verb, a big-endian length and `length` payload bytes padded to a
//! four-byte boundary. This engine implements the desktop side of the
//! interactive browse and package-install session: it answers the
//! handshake, proves itself with the DES password exchange, serves
//! path and file listings from the storage card as NSOF values, and
//! streams package files down to the handheld.
//!
//! Protocol-level trouble is answered with a `dres` carrying a
//! negative Newton error code and never tears down the link; only MNP
//! disconnects do that.

use crate::event::{Event, MnpEvent, SendResult};
use crate::newton::des;
use crate::newton::nsof::{self, NsArena, NsRef, NsofError};
use crate::pipe::{send_to, Pipe, PipeRef};
use crate::endpoints::sdcard::SdCardRef;
use crate::status::{AppStatus, StatusRef};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

const MAGIC: &[u8; 8] = b"newtdock";

/// Session type for `dock`: setting up.
const SESSION_SETTING_UP: u32 = 1;
/// Desktop protocol version advertised in `dinf`.
const PROTOCOL_VERSION: u32 = 10;
/// `wicn` icon mask: the install icon only.
const ICON_INSTALL: u32 = 4;
/// Session timeout sent in `stim`, seconds.
const SESSION_TIMEOUT_S: u32 = 90;
/// Package files stream in chunks of this size.
const PKG_CHUNK: usize = 512;

/// Our challenge to the handheld, sent in `dinf`.
const DESKTOP_CHALLENGE: [u8; 8] = [0x5F, 0xFE, 0xF6, 0x6A, 0x5B, 0xE3, 0xDA, 0x62];

/// Entry types in `path`/`file` listings.
const K_DESKTOP: i32 = 0;
const K_FILE: i32 = 1;
const K_FOLDER: i32 = 2;
const K_DISK: i32 = 3;

/// Newton error codes surfaced through `dres`.
const ERR_BAD_PATH: i32 = -48401;
const ERR_EXPECTED_STRING: i32 = -48402;
const ERR_FILE_NOT_FOUND: i32 = -48403;
const ERR_UNKNOWN_COMMAND: i32 = -48404;

/// Name shown for the synthetic desktop root.
const DESKTOP_NAME: &str = "CrabDock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Matching `newtdock`, position within the magic.
    Magic(u8),
    Verb(u8),
    Length(u8),
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterDres {
    SetTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PkgTask {
    None,
    /// Open the file and send the `lpkg` header.
    Start,
    /// Stream the next chunk.
    Continue,
    /// All chunks queued; close the file.
    Finish,
}

/// One queued outbound transfer.
struct OutData {
    bytes: Vec<u8>,
    pos: usize,
    start_frame: bool,
    end_frame: bool,
}

pub struct Dock {
    connected: bool,
    scan: ScanState,
    verb: [u8; 4],
    length: u32,
    aligned_length: u32,
    in_index: u32,
    in_data: Vec<u8>,

    /// Challenge received in `ninf`, to be encrypted for `pass`.
    newt_challenge: (u32, u32),
    after_dres: Option<AfterDres>,
    path_is_desktop: bool,

    queue: VecDeque<OutData>,
    task: PkgTask,
    pkg_filename: String,
    pkg_size: u32,
    pkg_aligned: u32,
    pkg_cursor: u32,

    sdcard: SdCardRef,
    status: Option<StatusRef>,
    out: Option<PipeRef>,
}

impl Dock {
    pub fn new(sdcard: SdCardRef) -> Dock {
        Dock {
            connected: false,
            scan: ScanState::Magic(0),
            verb: [0; 4],
            length: 0,
            aligned_length: 0,
            in_index: 0,
            in_data: Vec::with_capacity(400),
            newt_challenge: (0, 0),
            after_dres: None,
            path_is_desktop: true,
            queue: VecDeque::new(),
            task: PkgTask::None,
            pkg_filename: String::new(),
            pkg_size: 0,
            pkg_aligned: 0,
            pkg_cursor: 0,
            sdcard,
            status: None,
            out: None,
        }
    }

    pub fn link_status(&mut self, status: StatusRef) {
        self.status = Some(status);
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    // -- Inbound stream ----------------------------------------------

    fn scan_byte(&mut self, byte: u8) {
        match self.scan {
            ScanState::Magic(pos) => {
                if byte == MAGIC[pos as usize] {
                    self.scan = if pos == 7 {
                        ScanState::Verb(0)
                    } else {
                        ScanState::Magic(pos + 1)
                    };
                } else {
                    if pos > 0 {
                        log::debug!("Dock: stream out of sync");
                    }
                    self.scan = ScanState::Magic(0);
                }
            }
            ScanState::Verb(pos) => {
                self.verb[pos as usize] = byte;
                self.scan = if pos == 3 {
                    ScanState::Length(0)
                } else {
                    ScanState::Verb(pos + 1)
                };
            }
            ScanState::Length(pos) => {
                self.length = self.length << 8 | byte as u32;
                if pos < 3 {
                    self.scan = ScanState::Length(pos + 1);
                    return;
                }
                self.in_data.clear();
                self.in_index = 0;
                if self.length == 0 {
                    self.process_command();
                    self.reset_scan();
                } else if self.length == 0xFFFF_FFFF {
                    // Open-ended command; the data runs until the next
                    // magic. None of the supported verbs use it.
                    log::debug!("Dock: open-ended length on '{}'", self.verb_str());
                    self.reset_scan();
                } else {
                    self.aligned_length = (self.length + 3) & !3;
                    self.scan = ScanState::Payload;
                }
            }
            ScanState::Payload => {
                if self.in_index < self.aligned_length {
                    if self.in_index < self.length {
                        self.in_data.push(byte);
                    }
                    self.in_index += 1;
                }
                if self.in_index == self.aligned_length {
                    self.process_command();
                    self.reset_scan();
                }
            }
        }
    }

    fn reset_scan(&mut self) {
        self.scan = ScanState::Magic(0);
        self.length = 0;
        self.aligned_length = 0;
    }

    fn verb_str(&self) -> &str {
        core::str::from_utf8(&self.verb).unwrap_or("????")
    }

    fn process_command(&mut self) {
        log::debug!(
            "Dock: '{}' with {} payload bytes",
            self.verb_str(),
            self.length
        );
        match &self.verb {
            b"rtdk" => self.send_dock(SESSION_SETTING_UP),
            b"name" => {
                // The payload carries the owner name and version info;
                // nothing in it changes our reply.
                self.after_dres = Some(AfterDres::SetTimeout);
                self.send_dinf();
            }
            b"ninf" => {
                self.after_dres = Some(AfterDres::SetTimeout);
                if self.in_data.len() >= 12 {
                    self.newt_challenge = (
                        u32::from_be_bytes(self.in_data[4..8].try_into().unwrap()),
                        u32::from_be_bytes(self.in_data[8..12].try_into().unwrap()),
                    );
                }
                self.send_wicn(ICON_INSTALL);
            }
            b"dres" => {
                let code = self
                    .in_data
                    .first_chunk::<4>()
                    .map(|b| i32::from_be_bytes(*b))
                    .unwrap_or(0);
                if code != 0 {
                    log::warn!("Dock: peer result {code}");
                }
                if self.after_dres.take() == Some(AfterDres::SetTimeout) {
                    self.send_stim(SESSION_TIMEOUT_S);
                }
            }
            b"pass" => self.send_pass(),
            b"rtbr" => self.send_dres(0),
            b"dpth" => self.send_path(),
            b"gfil" => self.send_file_list(),
            b"gfin" => self.handle_get_file_info(),
            b"lpfl" => self.handle_load_package(),
            b"spth" => self.handle_set_path(),
            b"opcn" => {
                log::info!("Dock: operation canceled by peer");
                self.abort_package_task();
                self.queue.clear();
                self.send_ocaa();
            }
            b"helo" => {
                // Keep-alive; the MNP acknowledgement is answer enough.
            }
            _ => {
                log::warn!("Dock: unknown command '{}'", self.verb_str());
                self.send_dres(ERR_UNKNOWN_COMMAND);
            }
        }
    }

    // -- Outbound builders -------------------------------------------

    fn push_command(&mut self, verb: &[u8; 4], payload: &[u8]) {
        self.push_command_frames(verb, payload, true, true);
    }

    fn push_command_frames(
        &mut self,
        verb: &[u8; 4],
        payload: &[u8],
        start_frame: bool,
        end_frame: bool,
    ) {
        let aligned = (payload.len() + 3) & !3;
        let mut bytes = Vec::with_capacity(16 + aligned);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(verb);
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes.resize(16 + aligned, 0);
        self.queue.push_back(OutData {
            bytes,
            pos: 0,
            start_frame,
            end_frame,
        });
    }

    fn push_nsof_command(&mut self, verb: &[u8; 4], arena: &NsArena, root: NsRef) {
        let mut payload = Vec::new();
        nsof::encode(arena, root, &mut payload);
        self.push_command(verb, &payload);
    }

    fn send_dock(&mut self, session_type: u32) {
        self.push_command(b"dock", &session_type.to_be_bytes());
    }

    fn send_dinf(&mut self) {
        let mut arena = NsArena::new();
        let name = arena.symbol("name");
        let id = arena.symbol("id");
        let version = arena.symbol("version");
        let does_auto = arena.symbol("doesAuto");
        let app_name = arena.string("Newton Connection");
        let app = arena.frame(vec![
            (name, NsRef::Obj(app_name)),
            (id, NsRef::Int(2)),
            (version, NsRef::Int(1)),
            (does_auto, NsRef::True),
        ]);
        let apps = arena.array(vec![NsRef::Obj(app)]);
        let mut encoded = Vec::new();
        nsof::encode(&arena, NsRef::Obj(apps), &mut encoded);

        let mut payload = Vec::with_capacity(24 + encoded.len());
        payload.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes()); // desktop type: Mac
        payload.extend_from_slice(&DESKTOP_CHALLENGE);
        payload.extend_from_slice(&SESSION_SETTING_UP.to_be_bytes());
        payload.extend_from_slice(&1u32.to_be_bytes()); // selective sync allowed
        payload.extend_from_slice(&encoded);
        self.push_command(b"dinf", &payload);
    }

    fn send_wicn(&mut self, icon_mask: u32) {
        self.push_command(b"wicn", &icon_mask.to_be_bytes());
    }

    fn send_stim(&mut self, seconds: u32) {
        self.push_command(b"stim", &seconds.to_be_bytes());
    }

    fn send_dres(&mut self, code: i32) {
        self.push_command(b"dres", &code.to_be_bytes());
    }

    /// Keep-alive from our side.
    pub fn send_helo(&mut self) {
        self.push_command(b"helo", &[]);
    }

    /// Ask the peer to cancel the operation in progress.
    pub fn send_opca(&mut self) {
        self.push_command(b"opca", &[]);
    }

    fn send_ocaa(&mut self) {
        self.push_command(b"ocaa", &[]);
    }

    fn send_pass(&mut self) {
        let key = des::key_from_password(&[]);
        let response = des::encode_nonce(key, self.newt_challenge);
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&response.0.to_be_bytes());
        payload[4..].copy_from_slice(&response.1.to_be_bytes());
        log::debug!("Dock: password response {:08x}'{:08x}", response.0, response.1);
        self.push_command(b"pass", &payload);
    }

    fn disk_label(&self) -> String {
        match self.sdcard.borrow_mut().label() {
            Ok(label) if !label.is_empty() => label,
            _ => String::from("SD Card"),
        }
    }

    /// The default path: the synthetic desktop root and the card.
    fn send_path(&mut self) {
        let label = self.disk_label();
        let mut arena = NsArena::new();
        let name = arena.symbol("name");
        let kind = arena.symbol("type");
        let desktop_name = arena.string(DESKTOP_NAME);
        let desktop = arena.frame(vec![
            (name, NsRef::Obj(desktop_name)),
            (kind, NsRef::Int(K_DESKTOP)),
        ]);
        let disk_name = arena.string(&label);
        let disk = arena.frame(vec![
            (name, NsRef::Obj(disk_name)),
            (kind, NsRef::Int(K_DISK)),
        ]);
        let path = arena.array(vec![NsRef::Obj(desktop), NsRef::Obj(disk)]);
        self.push_nsof_command(b"path", &arena, NsRef::Obj(path));
    }

    fn send_file_list(&mut self) {
        let mut arena = NsArena::new();
        let name = arena.symbol("name");
        let kind = arena.symbol("type");
        let mut entries: Vec<NsRef> = Vec::new();

        if self.path_is_desktop {
            let label = self.disk_label();
            let disk_name = arena.string(&label);
            let disk = arena.frame(vec![
                (name, NsRef::Obj(disk_name)),
                (kind, NsRef::Int(K_DISK)),
            ]);
            entries.push(NsRef::Obj(disk));
        } else {
            self.flash_storage_active();
            let mut sdcard = self.sdcard.borrow_mut();
            if sdcard.open_dir().is_ok() {
                // Bounded like the original firmware; huge directories
                // would not fit the handheld's browser anyway.
                for _ in 0..50 {
                    match sdcard.read_dir() {
                        Ok(Some(entry)) if entry.is_visible() => {
                            let entry_kind = if entry.is_directory() {
                                K_FOLDER
                            } else if entry.is_package() {
                                K_FILE
                            } else {
                                continue;
                            };
                            let entry_name = arena.string(&entry.name);
                            let frame = arena.frame(vec![
                                (name, NsRef::Obj(entry_name)),
                                (kind, NsRef::Int(entry_kind)),
                            ]);
                            entries.push(NsRef::Obj(frame));
                        }
                        Ok(Some(_)) => continue,
                        Ok(None) | Err(_) => break,
                    }
                }
                sdcard.close_dir();
            }
        }

        let list = arena.array(entries);
        self.push_nsof_command(b"file", &arena, NsRef::Obj(list));
    }

    fn decode_request(&mut self) -> Result<(NsArena, NsRef), NsofError> {
        let mut arena = NsArena::new();
        let root = nsof::decode(&mut arena, &self.in_data)?;
        Ok((arena, root))
    }

    fn handle_get_file_info(&mut self) {
        let (mut arena, root) = match self.decode_request() {
            Ok(decoded) => decoded,
            Err(err) => {
                log::debug!("Dock: gfin: bad NSOF {err:?}");
                self.send_dres(ERR_EXPECTED_STRING);
                return;
            }
        };
        let Some(filename) = arena.string_to_utf8(root) else {
            self.send_dres(ERR_EXPECTED_STRING);
            return;
        };
        self.flash_storage_active();
        let sized = {
            let mut sdcard = self.sdcard.borrow_mut();
            sdcard.open_file(&filename).map(|()| {
                let size = sdcard.file_size();
                sdcard.close_file();
                size
            })
        };
        let file_size = match sized {
            Ok(size) => size,
            Err(err) => {
                log::debug!("Dock: gfin '{filename}': {err:?}");
                self.send_dres(ERR_FILE_NOT_FOUND);
                return;
            }
        };

        let kind = arena.symbol("kind");
        let size = arena.symbol("size");
        let created = arena.symbol("created");
        let modified = arena.symbol("modified");
        let path = arena.symbol("path");
        let icon = arena.symbol("icon");
        let kind_text = arena.string("Package");
        let info = arena.frame(vec![
            (kind, NsRef::Obj(kind_text)),
            (size, NsRef::Int(file_size as i32)),
            (created, NsRef::Int(0)),
            (modified, NsRef::Int(0)),
            // Echo the request string; the precedent table collapses it.
            (path, root),
            (icon, NsRef::Nil),
        ]);
        self.push_nsof_command(b"finf", &arena, NsRef::Obj(info));
    }

    fn handle_load_package(&mut self) {
        if self.task != PkgTask::None {
            log::warn!("Dock: lpfl while a package transfer is running");
            self.send_dres(ERR_UNKNOWN_COMMAND);
            return;
        }
        let (arena, root) = match self.decode_request() {
            Ok(decoded) => decoded,
            Err(err) => {
                log::debug!("Dock: lpfl: bad NSOF {err:?}");
                self.send_dres(ERR_EXPECTED_STRING);
                return;
            }
        };
        match arena.string_to_utf8(root) {
            Some(filename) => {
                log::info!("Dock: loading package '{filename}'");
                self.pkg_filename = filename;
                self.task = PkgTask::Start;
            }
            None => self.send_dres(ERR_EXPECTED_STRING),
        }
    }

    fn handle_set_path(&mut self) {
        let (arena, root) = match self.decode_request() {
            Ok(decoded) => decoded,
            Err(err) => {
                log::debug!("Dock: spth: bad NSOF {err:?}");
                self.send_dres(ERR_EXPECTED_STRING);
                return;
            }
        };
        let Some(elements) = arena.as_array(root) else {
            self.send_dres(ERR_EXPECTED_STRING);
            return;
        };
        if elements.is_empty() {
            self.send_dres(ERR_BAD_PATH);
            return;
        }
        if elements.len() == 1 {
            self.path_is_desktop = true;
        } else {
            // Elements beyond the desktop and disk entries name real
            // directories on the card.
            self.path_is_desktop = false;
            let mut path = String::new();
            for element in &elements[2..] {
                let Some(component) = arena.string_to_utf8(*element) else {
                    self.send_dres(ERR_BAD_PATH);
                    return;
                };
                path.push('/');
                path.push_str(&component);
            }
            if path.is_empty() {
                path.push('/');
            }
            let changed = self.sdcard.borrow_mut().chdir(&path);
            if let Err(err) = changed {
                log::debug!("Dock: spth '{path}': {err:?}");
                self.send_dres(ERR_FILE_NOT_FOUND);
                return;
            }
        }
        self.send_file_list();
    }

    // -- Package streaming -------------------------------------------

    fn abort_package_task(&mut self) {
        if matches!(self.task, PkgTask::Continue | PkgTask::Finish) {
            self.sdcard.borrow_mut().close_file();
        }
        self.task = PkgTask::None;
    }

    fn package_task(&mut self) {
        match self.task {
            PkgTask::None => {}
            PkgTask::Start => {
                let opened = self.sdcard.borrow_mut().open_file(&self.pkg_filename);
                if let Err(err) = opened {
                    log::warn!("Dock: cannot open '{}': {err:?}", self.pkg_filename);
                    self.send_dres(ERR_FILE_NOT_FOUND);
                    self.task = PkgTask::None;
                    return;
                }
                self.pkg_size = self.sdcard.borrow_mut().file_size();
                self.pkg_aligned = (self.pkg_size + 3) & !3;
                self.pkg_cursor = 0;
                let mut header = Vec::with_capacity(16);
                header.extend_from_slice(MAGIC);
                header.extend_from_slice(b"lpkg");
                header.extend_from_slice(&self.pkg_size.to_be_bytes());
                self.queue.push_back(OutData {
                    bytes: header,
                    pos: 0,
                    start_frame: true,
                    end_frame: false,
                });
                self.task = PkgTask::Continue;
            }
            PkgTask::Continue => {
                self.flash_storage_active();
                let read_size = (self.pkg_size - self.pkg_cursor).min(PKG_CHUNK as u32);
                self.pkg_cursor += read_size;
                let last = self.pkg_cursor >= self.pkg_size;
                let chunk_size = if last {
                    read_size + (self.pkg_aligned - self.pkg_size)
                } else {
                    read_size
                };
                let mut chunk = vec![0u8; chunk_size as usize];
                let read = self
                    .sdcard
                    .borrow_mut()
                    .read_file(&mut chunk[..read_size as usize]);
                match read {
                    Ok(n) if n as u32 == read_size => {}
                    Ok(n) => log::warn!("Dock: short package read {n}/{read_size}"),
                    Err(err) => {
                        log::warn!("Dock: package read failed: {err:?}");
                        self.abort_package_task();
                        self.send_dres(ERR_FILE_NOT_FOUND);
                        return;
                    }
                }
                self.queue.push_back(OutData {
                    bytes: chunk,
                    pos: 0,
                    start_frame: false,
                    end_frame: last,
                });
                if last {
                    self.task = PkgTask::Finish;
                }
            }
            PkgTask::Finish => {
                self.sdcard.borrow_mut().close_file();
                self.task = PkgTask::None;
                log::info!("Dock: package '{}' sent", self.pkg_filename);
            }
        }
    }

    fn flash_storage_active(&mut self) {
        if let Some(status) = &self.status {
            status.borrow_mut().repeat(AppStatus::SdCardActive, 2);
        }
    }

    /// Push queued bytes into the MNP path until it pushes back.
    fn pump_queue(&mut self) -> SendResult {
        while let Some(job) = self.queue.front_mut() {
            if job.start_frame {
                if send_to(&self.out, Event::Mnp(MnpEvent::FrameStart, 0)).is_rejected() {
                    return SendResult::Rejected;
                }
                job.start_frame = false;
            }
            while job.pos < job.bytes.len() {
                if send_to(&self.out, Event::Data(job.bytes[job.pos])).is_rejected() {
                    return SendResult::Rejected;
                }
                job.pos += 1;
            }
            if job.end_frame
                && send_to(&self.out, Event::Mnp(MnpEvent::FrameEnd, 0)).is_rejected()
            {
                return SendResult::Rejected;
            }
            self.queue.pop_front();
        }
        SendResult::Ok
    }
}

impl Pipe for Dock {
    fn send(&mut self, event: Event) -> SendResult {
        match event {
            Event::Data(byte) => {
                self.scan_byte(byte);
                SendResult::Ok
            }
            Event::Mnp(MnpEvent::Connected, _) => {
                log::info!("Dock: link up");
                self.connected = true;
                self.reset_scan();
                if let Some(status) = &self.status {
                    status.borrow_mut().set(AppStatus::DockConnected);
                }
                SendResult::Ok
            }
            Event::Mnp(MnpEvent::Disconnected, _) => {
                log::info!("Dock: link down");
                self.connected = false;
                self.abort_package_task();
                self.queue.clear();
                self.after_dres = None;
                self.path_is_desktop = true;
                self.reset_scan();
                if let Some(status) = &self.status {
                    status.borrow_mut().set(AppStatus::Idle);
                }
                SendResult::Ok
            }
            Event::Mnp(_, _) => SendResult::Ok,
            _ => SendResult::OK_NOT_HANDLED,
        }
    }

    fn tick(&mut self, _cycle_us: u32) -> SendResult {
        if self.pump_queue().is_rejected() {
            return SendResult::Ok;
        }
        if self.queue.is_empty() {
            self.package_task();
        }
        SendResult::Ok
    }

    fn set_out(&mut self, out: PipeRef) {
        self.out = Some(out);
    }
}
