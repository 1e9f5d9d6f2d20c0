//! Privileged driver built on Linux fanotify.
//!
//! Marks the whole filesystem of each root (`FAN_MARK_FILESYSTEM`) and asks
//! the kernel to report directory handles plus entry names
//! (`FAN_REPORT_DFID_NAME`). Handles are resolved back to paths with
//! `open_by_handle_at`, which needs `CAP_DAC_READ_SEARCH`; events outside
//! the configured roots are discarded. Requires Linux 5.9 or newer and root.

use crate::{
    error::DriverError,
    watcher::drivers::{DriverContext, WatchRoot},
};

/// Whether the process runs with root-equivalent privilege.
pub fn has_elevated_privilege() -> bool {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}

/// Initializes a fanotify group and closes it immediately.
///
/// # Errors
///
/// Returns `DriverError` if the kernel refuses the group.
pub fn probe() -> Result<(), DriverError> {
    #[cfg(target_os = "linux")]
    {
        sys::init().map(drop)
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(DriverError::unavailable("fanotify is only available on Linux"))
    }
}

/// Kernel-level watcher reading fanotify records on the driver thread.
pub struct PrivilegedDriver {
    roots: Vec<WatchRoot>,
    #[cfg(target_os = "linux")]
    group: sys::Group,
}

#[cfg(not(target_os = "linux"))]
impl PrivilegedDriver {
    pub fn new(_roots: Vec<WatchRoot>) -> Result<Self, DriverError> {
        Err(DriverError::unavailable("fanotify is only available on Linux"))
    }

    pub fn roots_watched(&self) -> usize {
        self.roots.len()
    }

    pub fn run(self, _context: &mut DriverContext) -> Result<(), DriverError> {
        Err(DriverError::unavailable("fanotify is only available on Linux"))
    }
}

#[cfg(target_os = "linux")]
impl PrivilegedDriver {
    /// Creates the fanotify group and marks the filesystem of every root.
    ///
    /// Roots that cannot be marked are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `DriverError` if the group cannot be created or no root
    /// could be marked.
    pub fn new(roots: Vec<WatchRoot>) -> Result<Self, DriverError> {
        use tracing::{debug, warn};

        let mut group = sys::Group::new(sys::init()?);
        let mut marked = Vec::new();
        for root in roots {
            match group.mark_filesystem(&root.path) {
                Ok(()) => {
                    debug!("Marked filesystem of {:?}", root.path);
                    marked.push(root);
                }
                Err(e) => warn!("Failed to mark {:?}: {}", root.path, e),
            }
        }
        if marked.is_empty() {
            return Err(DriverError::unavailable("no root could be marked"));
        }
        Ok(Self {
            roots: marked,
            group,
        })
    }

    pub fn roots_watched(&self) -> usize {
        self.roots.len()
    }

    /// Reads and translates kernel records until stopped.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::TooManyErrors` when reads keep failing.
    pub fn run(self, context: &mut DriverContext) -> Result<(), DriverError> {
        use {anyhow::Error, std::io::ErrorKind};

        use crate::{
            error::ErrorReporter,
            watcher::{
                drivers::TICK_INTERVAL,
                events::{Backend, WatchEvent},
                filter::{is_within, normalize_path},
            },
        };

        let mut buffer = vec![0u8; sys::READ_BUFFER_SIZE];
        while !context.should_stop() {
            context.pipeline.tick();

            match self.group.wait_readable(TICK_INTERVAL) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    context.errors.failure(Backend::Privileged, e)?;
                    continue;
                }
            }

            let len = match self.group.read(&mut buffer) {
                Ok(len) => len,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                    continue;
                }
                Err(e) => {
                    context.errors.failure(Backend::Privileged, e)?;
                    continue;
                }
            };

            let records = match sys::parse_records(&buffer[..len]) {
                Ok(records) => records,
                Err(e) => {
                    context.errors.failure(Backend::Privileged, e)?;
                    continue;
                }
            };
            context.errors.success();

            for record in records {
                if record.mask & sys::FAN_Q_OVERFLOW != 0 {
                    context
                        .errors
                        .failure(Backend::Privileged, "kernel event queue overflowed")?;
                    continue;
                }
                let (Some(handle), Some(name)) = (record.handle, record.name) else {
                    continue;
                };
                let directory = match self.group.resolve_handle(handle) {
                    Ok(directory) => directory,
                    Err(e) => {
                        // Stale handles and lost permissions are expected; skip the record.
                        ErrorReporter::debug(
                            &Error::new(e).context("resolving directory handle"),
                            "privileged driver",
                        );
                        continue;
                    }
                };
                let path = if name == "." {
                    normalize_path(&directory)
                } else {
                    normalize_path(&directory.join(name))
                };
                if !self
                    .roots
                    .iter()
                    .any(|root| is_within(&path, &root.path, root.recursive))
                {
                    continue;
                }

                let is_dir = record.mask & sys::FAN_ONDIR != 0;
                for kind in sys::kinds_for_mask(record.mask) {
                    context.pipeline.submit(WatchEvent::new(
                        path.clone(),
                        kind,
                        Backend::Privileged,
                        is_dir,
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod sys {
    //! Raw fanotify bindings and record parsing.

    use std::{
        ffi::{CString, OsStr},
        fs::{File, read_link},
        io::{Error as IoError, ErrorKind},
        os::{
            fd::{AsRawFd, FromRawFd, OwnedFd},
            unix::ffi::OsStrExt,
        },
        path::{Path, PathBuf},
        time::Duration,
    };

    use crate::{error::DriverError, watcher::events::EventKind};

    pub const READ_BUFFER_SIZE: usize = 64 * 1024;

    const FAN_CLOEXEC: u32 = 0x0000_0001;
    const FAN_NONBLOCK: u32 = 0x0000_0002;
    const FAN_CLASS_NOTIF: u32 = 0x0000_0000;
    const FAN_REPORT_DIR_FID: u32 = 0x0000_0400;
    const FAN_REPORT_NAME: u32 = 0x0000_0800;
    const FAN_REPORT_DFID_NAME: u32 = FAN_REPORT_DIR_FID | FAN_REPORT_NAME;

    const FAN_MARK_ADD: u32 = 0x0000_0001;
    const FAN_MARK_FILESYSTEM: u32 = 0x0000_0100;

    pub const FAN_MODIFY: u64 = 0x0000_0002;
    pub const FAN_MOVED_FROM: u64 = 0x0000_0040;
    pub const FAN_MOVED_TO: u64 = 0x0000_0080;
    pub const FAN_CREATE: u64 = 0x0000_0100;
    pub const FAN_DELETE: u64 = 0x0000_0200;
    pub const FAN_Q_OVERFLOW: u64 = 0x0000_4000;
    pub const FAN_ONDIR: u64 = 0x4000_0000;

    const WATCH_MASK: u64 =
        FAN_CREATE | FAN_DELETE | FAN_MODIFY | FAN_MOVED_FROM | FAN_MOVED_TO | FAN_ONDIR;

    const FANOTIFY_METADATA_VERSION: u8 = 3;
    const METADATA_LEN: usize = 24;
    const FAN_EVENT_INFO_TYPE_DFID_NAME: u8 = 2;
    /// Info header (4) + fsid (8).
    const FILE_HANDLE_OFFSET: usize = 12;
    /// `handle_bytes` (4) + `handle_type` (4).
    const FILE_HANDLE_HEADER_LEN: usize = 8;

    /// Creates a notification-class fanotify group reporting directory handles and names.
    pub fn init() -> Result<OwnedFd, DriverError> {
        let flags = FAN_CLASS_NOTIF | FAN_CLOEXEC | FAN_NONBLOCK | FAN_REPORT_DFID_NAME;
        // SAFETY: fanotify_init takes plain integer flags.
        let fd = unsafe { libc::fanotify_init(flags, (libc::O_RDONLY | libc::O_LARGEFILE) as u32) };
        if fd < 0 {
            return Err(IoError::last_os_error().into());
        }
        // SAFETY: fd was just returned by the kernel and is owned by nobody else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// An initialized group plus the directories used to resolve handles.
    pub struct Group {
        fd: OwnedFd,
        mount_dirs: Vec<File>,
    }

    impl Group {
        pub fn new(fd: OwnedFd) -> Self {
            Self {
                fd,
                mount_dirs: Vec::new(),
            }
        }

        pub fn mark_filesystem(&mut self, path: &Path) -> Result<(), IoError> {
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|e| IoError::new(ErrorKind::InvalidInput, e))?;
            // SAFETY: the group fd is valid and c_path is NUL-terminated.
            let result = unsafe {
                libc::fanotify_mark(
                    self.fd.as_raw_fd(),
                    FAN_MARK_ADD | FAN_MARK_FILESYSTEM,
                    WATCH_MASK,
                    libc::AT_FDCWD,
                    c_path.as_ptr(),
                )
            };
            if result < 0 {
                return Err(IoError::last_os_error());
            }
            self.mount_dirs.push(File::open(path)?);
            Ok(())
        }

        /// Waits up to `timeout` for the group to become readable.
        pub fn wait_readable(&self, timeout: Duration) -> Result<bool, IoError> {
            let mut pollfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
            // SAFETY: pollfd points to one valid, initialized entry.
            let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if ready < 0 {
                return Err(IoError::last_os_error());
            }
            Ok(ready > 0 && pollfd.revents & libc::POLLIN != 0)
        }

        pub fn read(&self, buffer: &mut [u8]) -> Result<usize, IoError> {
            // SAFETY: buffer is valid for writes of buffer.len() bytes.
            let read = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buffer.as_mut_ptr().cast::<libc::c_void>(),
                    buffer.len(),
                )
            };
            if read < 0 {
                return Err(IoError::last_os_error());
            }
            Ok(read as usize)
        }

        /// Turns a `struct file_handle` of a directory into its current path.
        pub fn resolve_handle(&self, handle: &[u8]) -> Result<PathBuf, IoError> {
            let mut last_error = IoError::from(ErrorKind::NotFound);
            for dir in &self.mount_dirs {
                // SAFETY: handle holds a complete file_handle copied from a kernel
                // record; the kernel only reads from it.
                let fd = unsafe {
                    libc::syscall(
                        libc::SYS_open_by_handle_at,
                        dir.as_raw_fd() as libc::c_long,
                        handle.as_ptr(),
                        libc::O_PATH as libc::c_long,
                    )
                };
                if fd < 0 {
                    last_error = IoError::last_os_error();
                    continue;
                }
                // SAFETY: the syscall returned a fresh descriptor we now own.
                let fd = unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) };
                return read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()));
            }
            Err(last_error)
        }
    }

    /// One fanotify event, borrowed from the read buffer.
    #[derive(Debug, PartialEq, Eq)]
    pub struct RawRecord<'a> {
        pub mask: u64,
        /// `struct file_handle` of the parent directory.
        pub handle: Option<&'a [u8]>,
        /// Entry name within that directory.
        pub name: Option<&'a OsStr>,
    }

    fn read_u16(buffer: &[u8], offset: usize) -> Option<u16> {
        Some(u16::from_ne_bytes(buffer.get(offset..offset + 2)?.try_into().ok()?))
    }

    fn read_u32(buffer: &[u8], offset: usize) -> Option<u32> {
        Some(u32::from_ne_bytes(buffer.get(offset..offset + 4)?.try_into().ok()?))
    }

    fn read_u64(buffer: &[u8], offset: usize) -> Option<u64> {
        Some(u64::from_ne_bytes(buffer.get(offset..offset + 8)?.try_into().ok()?))
    }

    fn malformed(what: &str) -> IoError {
        IoError::new(ErrorKind::InvalidData, format!("malformed fanotify record: {what}"))
    }

    /// Splits a read buffer into records.
    pub fn parse_records(buffer: &[u8]) -> Result<Vec<RawRecord<'_>>, IoError> {
        let mut records = Vec::new();
        let mut offset = 0;

        while offset + METADATA_LEN <= buffer.len() {
            let event_len = read_u32(buffer, offset).ok_or_else(|| malformed("length"))? as usize;
            let version = buffer[offset + 4];
            let metadata_len =
                read_u16(buffer, offset + 6).ok_or_else(|| malformed("metadata length"))? as usize;
            let mask = read_u64(buffer, offset + 8).ok_or_else(|| malformed("mask"))?;

            if version != FANOTIFY_METADATA_VERSION {
                return Err(malformed("unsupported version"));
            }
            if event_len < metadata_len || metadata_len < METADATA_LEN {
                return Err(malformed("inconsistent lengths"));
            }
            let event = buffer
                .get(offset..offset + event_len)
                .ok_or_else(|| malformed("truncated event"))?;

            let mut record = RawRecord {
                mask,
                handle: None,
                name: None,
            };
            let mut info_offset = metadata_len;
            while info_offset + 4 <= event.len() {
                let info_type = event[info_offset];
                let info_len = read_u16(event, info_offset + 2)
                    .ok_or_else(|| malformed("info length"))? as usize;
                if info_len < 4 {
                    return Err(malformed("info length"));
                }
                let info = event
                    .get(info_offset..info_offset + info_len)
                    .ok_or_else(|| malformed("truncated info"))?;
                if info_type == FAN_EVENT_INFO_TYPE_DFID_NAME {
                    let handle_bytes = read_u32(info, FILE_HANDLE_OFFSET)
                        .ok_or_else(|| malformed("handle size"))?
                        as usize;
                    let name_start = FILE_HANDLE_OFFSET + FILE_HANDLE_HEADER_LEN + handle_bytes;
                    record.handle = Some(
                        info.get(FILE_HANDLE_OFFSET..name_start)
                            .ok_or_else(|| malformed("truncated handle"))?,
                    );
                    let name = info.get(name_start..).unwrap_or_default();
                    let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                    if end > 0 {
                        record.name = Some(OsStr::from_bytes(&name[..end]));
                    }
                }
                info_offset += info_len;
            }

            records.push(record);
            offset += event_len;
        }
        Ok(records)
    }

    /// Canonical kinds carried by a (possibly merged) event mask, in causal order.
    pub fn kinds_for_mask(mask: u64) -> Vec<EventKind> {
        [
            (FAN_CREATE, EventKind::Created),
            (FAN_MOVED_TO, EventKind::MovedTo),
            (FAN_MODIFY, EventKind::Modified),
            (FAN_MOVED_FROM, EventKind::MovedFrom),
            (FAN_DELETE, EventKind::Deleted),
        ]
        .into_iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, kind)| kind)
        .collect()
    }

}
