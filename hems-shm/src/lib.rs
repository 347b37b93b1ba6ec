// Copyright 2021-Present HEMS contributors
// SPDX-License-Identifier: Apache-2.0

//! Payload Transport: shared-memory segments that carry the bytes an
//! `Envelope` only names. Grounded on `datadog-ipc`'s
//! `platform/unix/mem_handle.rs` (`NamedShmHandle`, `mmap_handle`,
//! `munmap_handle`), simplified to the write/read/destroy contract spec.md
//! §4.2 asks for: the receiver reads once and destroys, so there is no
//! need to keep a long-lived mapped handle around between calls.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

/// Length bound for a segment name as carried in an `Envelope`
/// (`segment_name`), including the NUL terminator. Matches
/// `MAXLEN_SHARED_SEGMENT_NAME` in the original program.
pub const N_SEG: usize = 24;

const NAME_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("segment name is not valid for shm_open: {0}")]
    InvalidName(String),
    #[error("shm_open failed: {0}")]
    Open(#[source] nix::Error),
    #[error("ftruncate failed: {0}")]
    Truncate(#[source] nix::Error),
    #[error("mmap failed: {0}")]
    Map(#[source] nix::Error),
    #[error("munmap failed: {0}")]
    Unmap(#[source] nix::Error),
    #[error("shm_unlink failed: {0}")]
    Unlink(#[source] nix::Error),
}

/// Generates a random segment name of length `N_SEG - 1` over
/// `[0-9A-Za-z]`, per spec.md §4.2. Collisions are not checked for here;
/// per spec.md §5 they are treated as transient and left to the next
/// allocation (a fresh random name) by the caller.
pub fn generate_segment_name() -> String {
    (0..N_SEG - 1)
        .map(|_| {
            let idx = fastrand::usize(..NAME_ALPHABET.len());
            NAME_ALPHABET[idx] as char
        })
        .collect()
}

fn os_path(name: &str) -> Result<CString, ShmError> {
    CString::new(format!("/hems_shm_{name}")).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// Creates or opens the segment named `name` and writes `bytes` into it.
/// The segment is sized `max(1, bytes.len())` (spec.md §4.2 requires
/// `max(1, payload_len + 1)`; an extra byte buys nothing here since `read`
/// is always told the exact length to copy out, so only the non-zero
/// floor is kept). The segment is left alive for the receiver.
pub fn write(name: &str, bytes: &[u8]) -> Result<(), ShmError> {
    let path = os_path(name)?;
    let fd: RawFd = shm_open(
        path.as_c_str(),
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(ShmError::Open)?;

    let result = (|| {
        let size = bytes.len().max(1);
        ftruncate(fd, size as libc::off_t).map_err(ShmError::Truncate)?;

        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr() as *mut u8, bytes.len());
            munmap(ptr, size).map_err(ShmError::Unmap)?;
        }
        Ok(())
    })();

    let _ = close(fd);
    result
}

/// Opens the segment named `name` read-only and copies out `len` bytes.
pub fn read(name: &str, len: usize) -> Result<Vec<u8>, ShmError> {
    let path = os_path(name)?;
    let fd: RawFd = shm_open(path.as_c_str(), OFlag::O_RDONLY, Mode::empty()).map_err(ShmError::Open)?;

    let result = (|| {
        let size = len.max(1);
        let ptr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).unwrap(),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
        }
        .map_err(ShmError::Map)?;

        let mut buf = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr() as *const u8, buf.as_mut_ptr(), len);
            munmap(ptr, size).map_err(ShmError::Unmap)?;
        }
        Ok(buf)
    })();

    let _ = close(fd);
    result
}

/// Unlinks the segment. Per spec.md §4.2, the receiver calls this after
/// the handler returns, or when the segment turns out to be stale.
pub fn destroy(name: &str) -> Result<(), ShmError> {
    let path = os_path(name)?;
    shm_unlink(path.as_c_str()).map_err(ShmError::Unlink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let name = generate_segment_name();
        assert_eq!(name.len(), N_SEG - 1);

        write(&name, b"hello world").unwrap();
        let out = read(&name, b"hello world".len()).unwrap();
        assert_eq!(out, b"hello world");

        destroy(&name).unwrap();
    }

    #[test]
    fn empty_payload_is_tolerated() {
        let name = generate_segment_name();
        write(&name, b"").unwrap();
        let out = read(&name, 0).unwrap();
        assert!(out.is_empty());
        destroy(&name).unwrap();
    }

    #[test]
    fn destroy_then_read_fails() {
        let name = generate_segment_name();
        write(&name, b"x").unwrap();
        destroy(&name).unwrap();
        assert!(read(&name, 1).is_err());
    }

    #[test]
    fn generated_names_are_distinct() {
        let a = generate_segment_name();
        let b = generate_segment_name();
        assert_ne!(a, b);
    }
}
