//! Per-handle streaming upload pipeline.
//!
//! A sequence of append-only `write` calls becomes one long-lived STOR (or
//! APPE on resume) on a connection owned by a dedicated upload thread. The
//! kernel thread and the upload thread meet through a rendezvous: a bounded
//! chunk channel hands buffer ownership over, an acknowledgment channel
//! reports each chunk drained to the wire, and a one-shot readiness channel
//! covers setup. Dropping the chunk sender is end-of-stream. At any moment
//! exactly one chunk is in flight: the producer is either blocked handing the
//! next chunk over or blocked waiting for the previous one to be written.

use std::io::Write;
use std::sync::Arc;
use std::sync::mpsc;
use std::sync::mpsc::Receiver;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use log::warn;
use parking_lot::Mutex;

use crate::config::Config;
use crate::connection::establish;
use crate::error::Error;
use crate::error::Result;
use crate::handle::OpenFile;

/// Stalled-writer guard on the upload socket.
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Failure slot the upload thread latches its error into; the producer
/// surfaces it on the next write or at flush.
pub(crate) type FailureLatch = Arc<Mutex<Option<Error>>>;

/// Producer-side endpoints of a running upload.
pub(crate) struct Upload {
    chunk_tx: Option<SyncSender<Vec<u8>>>,
    ack_rx: Receiver<()>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl Upload {
    /// Spawn the upload thread and wait until its STOR/APPE stream is open.
    pub(crate) fn start(
        config: Arc<Config>,
        remote_path: String,
        append: bool,
        latch: FailureLatch,
    ) -> Result<Upload> {
        let (chunk_tx, chunk_rx) = mpsc::sync_channel::<Vec<u8>>(0);
        let (ack_tx, ack_rx) = mpsc::sync_channel::<()>(1);
        let (ready_tx, ready_rx) = mpsc::sync_channel::<std::result::Result<(), Error>>(1);
        let thread = thread::Builder::new()
            .name("ftpfs-upload".to_string())
            .spawn(move || {
                upload_thread(config, remote_path, append, latch, chunk_rx, ack_tx, ready_tx)
            })
            .map_err(Error::io)?;
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Upload {
                chunk_tx: Some(chunk_tx),
                ack_rx,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::io("upload thread died during setup"))
            }
        }
    }

    /// Hand one chunk over and wait until it has been written to the wire.
    pub(crate) fn send(&mut self, chunk: Vec<u8>) -> Result<()> {
        let tx = self
            .chunk_tx
            .as_ref()
            .ok_or_else(|| Error::io("upload already finished"))?;
        if tx.send(chunk).is_err() {
            return Err(Error::io("upload thread is gone"));
        }
        match self.ack_rx.recv() {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::io("upload failed while writing")),
        }
    }

    /// Signal end-of-stream, join the thread, and report how the upload ended.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.chunk_tx = None;
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(_) => Err(Error::io("upload thread panicked")),
            },
            None => Ok(()),
        }
    }
}

impl Drop for Upload {
    fn drop(&mut self) {
        self.chunk_tx = None;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upload")
            .field("live", &self.thread.is_some())
            .finish()
    }
}

fn upload_thread(
    config: Arc<Config>,
    remote_path: String,
    append: bool,
    latch: FailureLatch,
    chunk_rx: Receiver<Vec<u8>>,
    ack_tx: SyncSender<()>,
    ready_tx: SyncSender<std::result::Result<(), Error>>,
) -> Result<()> {
    let setup_failed = |err: Error| {
        *latch.lock() = Some(err.clone());
        let _ = ready_tx.send(Err(err.clone()));
        Err(err)
    };
    let mut ftp = match establish(&config) {
        Ok(ftp) => ftp,
        Err(err) => return setup_failed(err),
    };
    let stream = if append {
        ftp.append_with_stream(&remote_path)
    } else {
        ftp.put_with_stream(&remote_path)
    };
    let mut stream = match stream {
        Ok(stream) => stream,
        Err(err) => return setup_failed(Error::io(err)),
    };
    let _ = stream.get_ref().set_write_timeout(Some(WRITE_TIMEOUT));
    let _ = ready_tx.send(Ok(()));
    debug!(
        "upload of {remote_path} started ({})",
        if append { "APPE" } else { "STOR" }
    );

    while let Ok(chunk) = chunk_rx.recv() {
        if let Err(err) = stream.write_all(&chunk) {
            warn!("upload of {remote_path} failed: {err}");
            *latch.lock() = Some(Error::io(&err));
            // returning drops ack_tx, which wakes a producer blocked on it
            return Err(Error::io(err));
        }
        if ack_tx.send(()).is_err() {
            break;
        }
    }

    match ftp.finalize_put_stream(stream) {
        Ok(()) => {
            debug!("upload of {remote_path} complete");
            let _ = ftp.quit();
            Ok(())
        }
        Err(err) => {
            warn!("upload of {remote_path} did not finalize: {err}");
            let folded = Error::io(err);
            *latch.lock() = Some(folded.clone());
            Err(folded)
        }
    }
}

/// The VFS-side write operation.
///
/// `remote_size` is consulted only on the first write of a handle opened
/// without `O_CREAT`/`O_TRUNC`, to confirm a preceding truncate-to-zero.
pub fn write(
    file: &mut OpenFile,
    config: &Arc<Config>,
    data: &[u8],
    offset: u64,
    remote_size: impl FnOnce() -> Result<u64>,
) -> Result<usize> {
    if let Some(err) = file.write_fail.lock().clone() {
        return Err(err);
    }
    file.dirty = true;

    if file.upload.is_none() {
        if file.pos == 0 && offset == 0 {
            if !file.write_may_start {
                if remote_size()? != 0 {
                    return Err(Error::io("write into existing data is not supported"));
                }
                file.write_may_start = true;
            }
            file.upload = Some(Upload::start(
                Arc::clone(config),
                file.remote_path.clone(),
                false,
                Arc::clone(&file.write_fail),
            )?);
        } else if file.pos > 0 && offset == file.pos {
            file.upload = Some(Upload::start(
                Arc::clone(config),
                file.remote_path.clone(),
                true,
                Arc::clone(&file.write_fail),
            )?);
        } else {
            return Err(Error::io(format!(
                "non-sequential write at offset {offset} (upload position {})",
                file.pos
            )));
        }
    } else if offset != file.pos {
        // Tear the pipeline down; nothing written past this point would land
        // where the caller thinks it does.
        if let Some(mut upload) = file.upload.take() {
            let _ = upload.finish();
        }
        let err = Error::io(format!(
            "non-sequential write at offset {offset} (upload position {})",
            file.pos
        ));
        *file.write_fail.lock() = Some(err.clone());
        return Err(err);
    }

    let mut chunk = Vec::new();
    chunk
        .try_reserve(data.len())
        .map_err(|_| Error::OutOfMemory)?;
    chunk.extend_from_slice(data);

    let upload = file.upload.as_mut().expect("upload started above");
    match upload.send(chunk) {
        Ok(()) => {
            file.pos += data.len() as u64;
            Ok(data.len())
        }
        Err(err) => Err(file.write_fail.lock().clone().unwrap_or(err)),
    }
}

/// Drain and join the upload, reporting how it ended. The flush path calls
/// this before verifying the final remote size.
pub fn finish(file: &mut OpenFile) -> Result<()> {
    if let Some(mut upload) = file.upload.take() {
        upload.finish()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::OpenFile;

    /// An Upload whose consumer is a plain thread collecting into `sink`,
    /// failing after `fail_after` chunks when set.
    fn fake_upload(sink: Arc<Mutex<Vec<u8>>>, fail_after: Option<usize>) -> Upload {
        let (chunk_tx, chunk_rx) = mpsc::sync_channel::<Vec<u8>>(0);
        let (ack_tx, ack_rx) = mpsc::sync_channel::<()>(1);
        let thread = thread::spawn(move || -> Result<()> {
            let mut seen = 0usize;
            while let Ok(chunk) = chunk_rx.recv() {
                if fail_after == Some(seen) {
                    return Err(Error::io("injected failure"));
                }
                seen += 1;
                sink.lock().extend_from_slice(&chunk);
                if ack_tx.send(()).is_err() {
                    break;
                }
            }
            Ok(())
        });
        Upload {
            chunk_tx: Some(chunk_tx),
            ack_rx,
            thread: Some(thread),
        }
    }

    fn write_handle(upload: Upload) -> OpenFile {
        let mut file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        file.write_may_start = true;
        file.upload = Some(upload);
        file
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config::from_args("ftp://127.0.0.1", []).unwrap())
    }

    #[test]
    fn sequential_writes_stream_in_order() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut file = write_handle(fake_upload(Arc::clone(&sink), None));
        let config = test_config();

        assert_eq!(write(&mut file, &config, b"abc", 0, || Ok(0)).unwrap(), 3);
        assert_eq!(write(&mut file, &config, b"defg", 3, || Ok(0)).unwrap(), 4);
        assert_eq!(file.pos, 7);

        finish(&mut file).unwrap();
        assert_eq!(sink.lock().as_slice(), b"abcdefg");
    }

    #[test]
    fn non_sequential_write_tears_down() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut file = write_handle(fake_upload(Arc::clone(&sink), None));
        let config = test_config();

        write(&mut file, &config, b"0123456789", 0, || Ok(0)).unwrap();
        let err = write(&mut file, &config, b"x", 5, || Ok(0)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(file.upload.is_none());
        assert!(file.write_fail.lock().is_some());

        // every later write observes the latched failure
        let err = write(&mut file, &config, b"y", 10, || Ok(0)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        // no silent corruption: only the sequential prefix reached the sink
        assert_eq!(sink.lock().as_slice(), b"0123456789");
    }

    #[test]
    fn consumer_failure_wakes_producer() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut file = write_handle(fake_upload(Arc::clone(&sink), Some(1)));
        let config = test_config();

        write(&mut file, &config, b"first", 0, || Ok(0)).unwrap();
        // second chunk hits the injected failure; the dropped ack endpoint
        // wakes the blocked producer
        let err = write(&mut file, &config, b"second", 5, || Ok(0)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn fresh_write_requires_truncated_remote() {
        let mut file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        let config = test_config();
        // opened without O_CREAT/O_TRUNC and never truncated: a non-empty
        // remote file rejects the write before any upload starts
        let err = write(&mut file, &config, b"abc", 0, || Ok(42)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(file.upload.is_none());
        assert_eq!(file.pos, 0);
    }

    #[test]
    fn first_write_must_be_at_zero() {
        let mut file = OpenFile::new("/f", "/f", libc::O_WRONLY);
        file.write_may_start = true;
        let config = test_config();
        let err = write(&mut file, &config, b"abc", 100, || Ok(0)).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn eof_after_partial_consumer_exit() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let mut file = write_handle(fake_upload(Arc::clone(&sink), None));
        let config = test_config();
        write(&mut file, &config, b"tail", 0, || Ok(0)).unwrap();
        // dropping the sender is end-of-stream; finish reports success
        finish(&mut file).unwrap();
        assert!(file.upload.is_none());
    }
}
