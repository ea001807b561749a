//! Per-handle range-download engine.
//!
//! FTP has no random-access read beyond "resume from offset", so the window
//! keeps a single download in flight on the shared connection and services
//! arbitrary-offset reads out of a sliding in-memory buffer over that stream.
//! A read inside the buffered range is answered directly; a read just past it
//! drives the stream forward; anything else restarts the download at the new
//! offset with a REST marker. Sequential readers therefore cost one RETR per
//! open, and a seek costs one restart.

use std::io::ErrorKind;
use std::io::Read;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::warn;
use suppaftp::FtpError;

use crate::buffer::Buffer;
use crate::connection::ConnState;
use crate::connection::Download;
use crate::connection::SharedConnection;
use crate::error::Error;
use crate::error::Result;
use crate::handle::OpenFile;

/// Window length above which a shrinkable window slides forward.
pub const MAX_WINDOW_LEN: usize = 300 * 1024;

/// Read size used when driving the download forward.
const DRIVE_CHUNK: usize = 64 * 1024;

/// Socket read timeout while waiting for download bytes; bounds how long the
/// connection lock is held without rechecking the exit conditions.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// A download that produces nothing for this long fails the read.
const STALL_LIMIT: Duration = Duration::from_secs(60);

fn in_window(window: &Buffer, offset: u64, size: usize) -> bool {
    offset >= window.begin_offset()
        && offset <= window.end_offset()
        && offset + size as u64 <= window.end_offset()
}

/// Whether the active download can be driven further or must be restarted.
fn needs_restart(
    current_fh: Option<u64>,
    attached: bool,
    fh: u64,
    window: &Buffer,
    offset: u64,
) -> bool {
    current_fh != Some(fh)
        || offset < window.begin_offset()
        || offset > window.end_offset()
        || !attached
}

/// Copy up to `size` bytes at `offset` out of the window, then apply the
/// shrink policy. Returns the number of bytes copied.
fn deliver(
    window: &mut Buffer,
    offset: u64,
    size: usize,
    out: Option<&mut Vec<u8>>,
    can_shrink: bool,
) -> usize {
    let end = window.end_offset();
    let copied = if offset >= end {
        0
    } else {
        let start = (offset - window.begin_offset()) as usize;
        let n = size.min((end - offset) as usize);
        if let Some(out) = out {
            out.extend_from_slice(&window.as_slice()[start..start + n]);
        }
        n
    };
    if can_shrink && window.len() > MAX_WINDOW_LEN {
        let consumed = (offset.saturating_sub(window.begin_offset())) as usize + copied;
        window.slide(consumed);
    }
    copied
}

fn channel_error(conn: &SharedConnection, state: &mut ConnState, err: FtpError) -> Error {
    if matches!(err, FtpError::ConnectionError(_)) {
        conn.reconnect(state);
    }
    Error::io(err)
}

/// Service one `read(offset, size)` against the handle's window.
///
/// `out = None` with `size = 1` is the open-time probe: it warms the window
/// and validates that the file is retrievable without copying anything.
/// Returns the number of bytes copied; reads at or past end of file return 0.
pub fn read_chunk(
    conn: &SharedConnection,
    file: &mut OpenFile,
    fh: u64,
    offset: u64,
    size: usize,
    out: Option<&mut Vec<u8>>,
    update_cursor: bool,
) -> Result<usize> {
    if size == 0 || offset >= file.known_size {
        if update_cursor {
            file.last_offset = offset;
        }
        return Ok(0);
    }

    let mut state = conn.lock();

    if !in_window(&file.window, offset, size) {
        if needs_restart(
            state.current_fh,
            state.download.is_some(),
            fh,
            &file.window,
            offset,
        ) {
            debug!(
                "restarting download for {} at offset {offset}",
                file.remote_path
            );
            conn.abort_download(&mut state);
            file.window.restart_at(offset);
            state.current_fh = Some(fh);
            if offset > 0 {
                state
                    .ftp
                    .resume_transfer(offset as usize)
                    .map_err(|err| channel_error(conn, &mut state, err))?;
            }
            match state.ftp.retr_as_stream(&file.remote_path) {
                Ok(stream) => {
                    let _ = stream.get_ref().set_read_timeout(Some(READ_TIMEOUT));
                    state.download = Some(Download { stream, owner: fh });
                }
                Err(err) => {
                    warn!("RETR {} failed: {err}", file.remote_path);
                    return Err(channel_error(conn, &mut state, err));
                }
            }
        }

        let mut chunk = vec![0u8; DRIVE_CHUNK];
        let mut last_progress = Instant::now();
        while !in_window(&file.window, offset, size) && state.download.is_some() {
            let download = state.download.as_mut().expect("checked above");
            match download.stream.read(&mut chunk) {
                Ok(0) => {
                    let download = state.download.take().expect("checked above");
                    if let Err(err) = state.ftp.finalize_retr_stream(download.stream) {
                        warn!("finalizing RETR of {} failed: {err}", file.remote_path);
                        return Err(channel_error(conn, &mut state, err));
                    }
                }
                Ok(n) => {
                    if let Err(err) = file.window.add_mem(&chunk[..n]) {
                        conn.abort_download(&mut state);
                        return Err(err);
                    }
                    last_progress = Instant::now();
                }
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    if last_progress.elapsed() >= STALL_LIMIT {
                        drop(state.download.take());
                        conn.reconnect(&mut state);
                        return Err(Error::io(format!(
                            "download of {} stalled",
                            file.remote_path
                        )));
                    }
                }
                Err(err) => {
                    drop(state.download.take());
                    conn.reconnect(&mut state);
                    return Err(Error::io(err));
                }
            }
        }
    }

    let copied = deliver(&mut file.window, offset, size, out, file.can_shrink);
    if update_cursor {
        file.last_offset = offset + copied as u64;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_at(begin: u64, len: usize) -> Buffer {
        let mut buf = Buffer::new();
        buf.restart_at(begin);
        buf.add_mem(&vec![7u8; len]).unwrap();
        buf
    }

    #[test]
    fn in_window_classification() {
        let buf = window_at(100, 50);
        assert!(in_window(&buf, 100, 50));
        assert!(in_window(&buf, 120, 30));
        assert!(in_window(&buf, 150, 0));
        // request extends past the buffered range
        assert!(!in_window(&buf, 120, 31));
        // before and after the range
        assert!(!in_window(&buf, 99, 1));
        assert!(!in_window(&buf, 151, 1));
    }

    #[test]
    fn restart_decision() {
        let buf = window_at(100, 50);
        // attached, owned, contiguous: drive forward
        assert!(!needs_restart(Some(3), true, 3, &buf, 150));
        // another handle owns the download
        assert!(needs_restart(Some(9), true, 3, &buf, 150));
        // backward jump
        assert!(needs_restart(Some(3), true, 3, &buf, 50));
        // disjoint forward jump
        assert!(needs_restart(Some(3), true, 3, &buf, 151));
        // nothing attached (completed or pre-empted)
        assert!(needs_restart(Some(3), false, 3, &buf, 150));
    }

    #[test]
    fn deliver_copies_requested_range() {
        let mut buf = Buffer::new();
        buf.restart_at(10);
        buf.add_mem(b"abcdefghij").unwrap();
        let mut out = Vec::new();
        let n = deliver(&mut buf, 12, 4, Some(&mut out), false);
        assert_eq!(n, 4);
        assert_eq!(out, b"cdef");
    }

    #[test]
    fn deliver_clamps_at_end() {
        let mut buf = Buffer::new();
        buf.restart_at(0);
        buf.add_mem(b"abcdef").unwrap();
        let mut out = Vec::new();
        assert_eq!(deliver(&mut buf, 4, 100, Some(&mut out), false), 2);
        assert_eq!(out, b"ef");
        assert_eq!(deliver(&mut buf, 6, 100, Some(&mut out), false), 0);
        assert_eq!(deliver(&mut buf, 50, 100, Some(&mut out), false), 0);
    }

    #[test]
    fn probe_copies_nothing() {
        let mut buf = Buffer::new();
        buf.add_mem(b"abc").unwrap();
        assert_eq!(deliver(&mut buf, 0, 1, None, false), 1);
        assert_eq!(buf.as_slice(), b"abc");
    }

    #[test]
    fn shrink_fires_only_above_limit() {
        let mut buf = Buffer::new();
        buf.restart_at(0);
        buf.add_mem(&vec![0u8; MAX_WINDOW_LEN]).unwrap();
        deliver(&mut buf, 0, 4096, Some(&mut Vec::new()), true);
        // at the limit, not above it
        assert_eq!(buf.begin_offset(), 0);

        buf.add_mem(&[1u8]).unwrap();
        let end = buf.end_offset();
        let n = deliver(&mut buf, 4096, 4096, Some(&mut Vec::new()), true);
        assert_eq!(n, 4096);
        assert_eq!(buf.begin_offset(), 4096 + 4096);
        assert_eq!(buf.end_offset(), end);
    }

    #[test]
    fn shrink_requires_opt_in() {
        let mut buf = Buffer::new();
        buf.restart_at(0);
        buf.add_mem(&vec![0u8; MAX_WINDOW_LEN + 1]).unwrap();
        deliver(&mut buf, 0, 4096, Some(&mut Vec::new()), false);
        assert_eq!(buf.begin_offset(), 0);
        assert_eq!(buf.len(), MAX_WINDOW_LEN + 1);
    }
}
