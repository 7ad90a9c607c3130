//! Background read loop.
//!
//! A reader thread repeatedly performs a blocking read and reports each
//! outcome to the connection's registered callback. The loop ends on the
//! first outcome that is not data (orderly close, failure or cancellation),
//! and that final callback is the only signal that the loop is over.

use crate::connection::{lock, Shared};
use crate::error::{Result, SockError};
use crate::io as sock_io;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

/// Callback invoked with every background read outcome
pub type ReadCallback = Arc<dyn Fn(ReadEvent<'_>) + Send + Sync>;

/// Outcome reported by the background reader
#[derive(Debug)]
pub enum ReadEvent<'a> {
    /// The loop is starting; delivered once, on the caller's thread, before any read
    Started,
    /// Bytes received into the reader's buffer
    Data(&'a [u8]),
    /// Peer ended the stream in an orderly way
    Closed,
    /// A read failed
    Failed(&'a SockError),
    /// The loop was stopped locally
    Cancelled,
}

impl ReadEvent<'_> {
    /// Whether this is the last event the loop will deliver
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReadEvent::Closed | ReadEvent::Failed(_) | ReadEvent::Cancelled
        )
    }
}

/// Join handle of the (at most one) reader thread of a connection
#[derive(Default)]
pub(crate) struct ReaderSlot {
    handle: Mutex<Option<JoinHandle<Vec<u8>>>>,
}

/// Body handed to the thread spawner
type ReaderBody = Box<dyn FnOnce() -> Vec<u8> + Send + 'static>;

impl ReaderSlot {
    /// Start a reader thread that fills `buf`
    pub(crate) fn start(&self, shared: &Arc<Shared>, buf: Vec<u8>) -> Result<()> {
        self.start_with(shared, buf, |body| {
            thread::Builder::new().name("sock-reader".into()).spawn(body)
        })
    }

    fn start_with<S>(&self, shared: &Arc<Shared>, buf: Vec<u8>, spawn: S) -> Result<()>
    where
        S: FnOnce(ReaderBody) -> io::Result<JoinHandle<Vec<u8>>>,
    {
        let callback = lock(&shared.callback)
            .clone()
            .ok_or(SockError::NoCallbackRegistered)?;
        shared.transport()?;

        {
            // A manual read in flight owns the read side; never overlap it
            let _side = match shared.read_side.try_lock() {
                Ok(side) => side,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return Err(SockError::ReaderActive),
            };
            if shared
                .reading
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(SockError::ReaderActive);
            }
        }
        shared.cancel.store(false, Ordering::Release);

        callback(ReadEvent::Started);

        let mut slot = lock(&self.handle);
        if let Some(finished) = slot.take() {
            let _ = finished.join();
        }

        let worker = Arc::clone(shared);
        let loop_callback = Arc::clone(&callback);
        let body: ReaderBody = Box::new(move || read_loop(worker, loop_callback, buf));
        match spawn(body) {
            Ok(handle) => {
                *slot = Some(handle);
                info!("Background reader started");
                Ok(())
            }
            Err(e) => {
                shared.reading.store(false, Ordering::Release);
                let err = SockError::Spawn(e);
                // Started was already delivered, so close the sequence
                callback(ReadEvent::Failed(&err));
                Err(err)
            }
        }
    }

    /// Stop the reader thread, if any, and hand back its buffer
    pub(crate) fn stop(&self, shared: &Shared) -> Option<Vec<u8>> {
        let handle = lock(&self.handle).take()?;

        if !handle.is_finished() {
            shared.cancel.store(true, Ordering::Release);
            if let Some(transport) = shared.transport.get() {
                if let Err(e) = transport.shutdown(Shutdown::Both) {
                    debug!("Failed to shut down transport for reader stop: {}", e);
                }
            }
        }

        match handle.join() {
            Ok(buf) => {
                debug!("Background reader joined");
                Some(buf)
            }
            Err(_) => {
                shared.reading.store(false, Ordering::Release);
                None
            }
        }
    }
}

fn read_loop(shared: Arc<Shared>, callback: ReadCallback, mut buf: Vec<u8>) -> Vec<u8> {
    loop {
        if shared.cancel.load(Ordering::Acquire) {
            callback(ReadEvent::Cancelled);
            break;
        }

        let outcome = {
            let mut side = lock(&shared.read_side);
            sock_io::read(&shared, &mut side, &mut buf)
        };
        let cancelled = shared.cancel.load(Ordering::Acquire);
        match outcome {
            Ok(n) if n > 0 => callback(ReadEvent::Data(&buf[..n])),
            _ if cancelled => {
                callback(ReadEvent::Cancelled);
                break;
            }
            Ok(_) => {
                callback(ReadEvent::Closed);
                break;
            }
            Err(e) => {
                callback(ReadEvent::Failed(&e));
                break;
            }
        }
    }

    shared.reading.store(false, Ordering::Release);
    debug!("Background reader finished");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{spawn_plain_echo, spawn_silent_peer, spawn_tls_peer, Pki, TlsPeer};
    use crate::{ConnectOptions, Connection, Context};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Owned copy of a [`ReadEvent`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Started,
        Data(Vec<u8>),
        Closed,
        Failed,
        Cancelled,
    }

    fn recording(conn: &Connection) -> mpsc::Receiver<(Seen, thread::ThreadId)> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        conn.set_read_callback(move |event| {
            let seen = match event {
                ReadEvent::Started => Seen::Started,
                ReadEvent::Data(bytes) => Seen::Data(bytes.to_vec()),
                ReadEvent::Closed => Seen::Closed,
                ReadEvent::Failed(_) => Seen::Failed,
                ReadEvent::Cancelled => Seen::Cancelled,
            };
            let _ = lock(&tx).send((seen, thread::current().id()));
        });
        rx
    }

    fn next(rx: &mpsc::Receiver<(Seen, thread::ThreadId)>) -> (Seen, thread::ThreadId) {
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    fn context(pki: &Pki) -> Context {
        Context::new(pki.trust_dir.path()).unwrap()
    }

    #[test]
    fn test_start_without_callback_fails() {
        let pki = Pki::generate("no callback ca");
        let port = spawn_plain_echo();
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_plain("127.0.0.1", port).unwrap();

        let err = conn.start_reader(vec![0u8; 64]).unwrap_err();
        assert!(matches!(err, SockError::NoCallbackRegistered));
        assert!(!conn.is_reading());
        assert!(conn.stop_reader().is_none());

        conn.set_read_callback(|_| {});
        conn.clear_read_callback();
        assert!(matches!(
            conn.start_reader(vec![0u8; 64]),
            Err(SockError::NoCallbackRegistered)
        ));
    }

    #[test]
    fn test_started_first_then_data_then_terminal() {
        let pki = Pki::generate("reader ca");
        let (port, _peer) = spawn_tls_peer(
            pki.server_config.clone(),
            TlsPeer::Greet(b"<stream>".to_vec()),
        );
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_secure("127.0.0.1", port, &ConnectOptions::default())
            .unwrap();
        let rx = recording(&conn);

        conn.start_reader(vec![0u8; 1024]).unwrap();

        let (first, first_thread) = next(&rx);
        assert_eq!(first, Seen::Started);
        assert_eq!(first_thread, thread::current().id());

        let mut data = Vec::new();
        let terminal = loop {
            let (seen, on) = next(&rx);
            assert_ne!(on, thread::current().id());
            match seen {
                Seen::Data(bytes) => data.extend(bytes),
                Seen::Started => panic!("started delivered twice"),
                other => break other,
            }
        };
        assert_eq!(data, b"<stream>");
        assert_eq!(terminal, Seen::Closed);

        let buf = conn.stop_reader().unwrap();
        assert_eq!(buf.len(), 1024);
        assert!(!conn.is_reading());
    }

    #[test]
    fn test_abrupt_close_reports_failure() {
        let pki = Pki::generate("reader drop ca");
        let (port, _peer) = spawn_tls_peer(pki.server_config.clone(), TlsPeer::Drop);
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_secure("127.0.0.1", port, &ConnectOptions::default())
            .unwrap();
        let rx = recording(&conn);

        conn.start_reader(vec![0u8; 256]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        assert_eq!(next(&rx).0, Seen::Failed);
        conn.stop_reader();
    }

    #[test]
    fn test_second_start_is_rejected() {
        let pki = Pki::generate("double start ca");
        let (port, _peer) = spawn_silent_peer();
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_plain("127.0.0.1", port).unwrap();
        let rx = recording(&conn);

        conn.start_reader(vec![0u8; 64]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        assert!(matches!(
            conn.start_reader(vec![0u8; 64]),
            Err(SockError::ReaderActive)
        ));
        assert!(matches!(
            conn.read(&mut [0u8; 8]),
            Err(SockError::ReaderActive)
        ));
        assert!(matches!(
            conn.handshake(&ConnectOptions::default()),
            Err(SockError::ReaderActive)
        ));

        conn.stop_reader().unwrap();
        assert_eq!(next(&rx).0, Seen::Cancelled);
    }

    #[test]
    fn test_stop_unblocks_idle_reader() {
        let pki = Pki::generate("stop ca");
        let (port, _peer) = spawn_tls_peer(pki.server_config.clone(), TlsPeer::Echo);
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_secure("127.0.0.1", port, &ConnectOptions::default())
            .unwrap();
        let rx = recording(&conn);

        conn.start_reader(vec![0u8; 512]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        assert!(conn.is_reading());

        // Writes keep working while the reader is blocked
        assert_eq!(conn.write(b"ping").unwrap(), 4);
        assert_eq!(next(&rx).0, Seen::Data(b"ping".to_vec()));

        let buf = conn.stop_reader().unwrap();
        assert_eq!(buf.len(), 512);
        assert_eq!(next(&rx).0, Seen::Cancelled);
        assert!(!conn.is_reading());
    }

    #[test]
    fn test_restart_after_loop_ended() {
        let pki = Pki::generate("restart ca");
        let port = spawn_plain_echo();
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_plain("127.0.0.1", port).unwrap();
        let rx = recording(&conn);

        conn.start_reader(vec![0u8; 64]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        conn.write(b"one").unwrap();
        assert_eq!(next(&rx).0, Seen::Data(b"one".to_vec()));
        conn.stop_reader().unwrap();
        assert_eq!(next(&rx).0, Seen::Cancelled);

        // The transport is closed now, so a fresh loop ends straight away
        conn.start_reader(vec![0u8; 64]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        assert!(next(&rx).0 != Seen::Started);
    }

    #[test]
    fn test_drop_joins_active_reader() {
        let pki = Pki::generate("drop join ca");
        let (port, _peer) = spawn_silent_peer();
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_plain("127.0.0.1", port).unwrap();
        let rx = recording(&conn);

        conn.start_reader(vec![0u8; 64]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        drop(conn);
        assert_eq!(next(&rx).0, Seen::Cancelled);
    }

    #[test]
    fn test_start_refused_while_manual_read_in_flight() {
        let pki = Pki::generate("manual read ca");
        let (port, _peer) = spawn_silent_peer();
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_plain("127.0.0.1", port).unwrap();
        let rx = recording(&conn);

        thread::scope(|s| {
            let blocked = s.spawn(|| conn.read(&mut [0u8; 8]));
            while conn.shared.read_side.try_lock().is_ok() {
                thread::sleep(Duration::from_millis(5));
            }

            assert!(matches!(
                conn.start_reader(vec![0u8; 64]),
                Err(SockError::ReaderActive)
            ));
            assert!(!conn.is_reading());

            conn.shutdown().unwrap();
            assert_eq!(blocked.join().unwrap().unwrap(), 0);
        });

        // A refused start never announces itself
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_spawn_failure_closes_event_sequence() {
        let pki = Pki::generate("spawn failure ca");
        let port = spawn_plain_echo();
        let conn = Connection::new(&context(&pki)).unwrap();
        conn.connect_plain("127.0.0.1", port).unwrap();
        let rx = recording(&conn);

        let err = conn
            .reader
            .start_with(&conn.shared, vec![0u8; 64], |_| {
                Err(io::Error::new(io::ErrorKind::Other, "no threads left"))
            })
            .unwrap_err();
        assert!(matches!(err, SockError::Spawn(_)));
        assert_eq!(next(&rx).0, Seen::Started);
        assert_eq!(next(&rx).0, Seen::Failed);
        assert!(!conn.is_reading());

        conn.start_reader(vec![0u8; 64]).unwrap();
        assert_eq!(next(&rx).0, Seen::Started);
        conn.stop_reader().unwrap();
        assert_eq!(next(&rx).0, Seen::Cancelled);
    }

    #[test]
    fn test_terminal_events() {
        let err = SockError::Io;
        assert!(!ReadEvent::Started.is_terminal());
        assert!(!ReadEvent::Data(b"x").is_terminal());
        assert!(ReadEvent::Closed.is_terminal());
        assert!(ReadEvent::Failed(&err).is_terminal());
        assert!(ReadEvent::Cancelled.is_terminal());
    }
}
