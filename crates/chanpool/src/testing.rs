//! Test doubles: scripted sockets, a recording handler and a manager rig.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chanpool_core::{BufferPool, ChannelId, EventManager, Shutdown, Socket, SourceId};
use chanpool_module::{FixedBufferPool, HeapBufferPool, MioEventManager, TcpSocketFactory};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelKind};
use crate::config::PoolConfig;
use crate::event::{ChannelEvent, ChannelEventKind, DataEvent, Handler, PoolEvent};
use crate::options::ChannelOptions;
use crate::shared::PoolShared;

fn unspecified() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 0))
}

enum Step {
    Data(Vec<u8>),
    Eof,
}

/// In-memory socket. Reads follow a script and return `WouldBlock` once
/// it runs dry; writes are captured up to an optional byte limit.
#[derive(Default)]
pub struct ScriptedSocket {
    script: VecDeque<Step>,
    written: Vec<u8>,
    write_limit: Option<usize>,
}

impl ScriptedSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&mut self, data: &[u8]) {
        self.script.push_back(Step::Data(data.to_vec()));
    }

    pub fn push_eof(&mut self) {
        self.script.push_back(Step::Eof);
    }

    /// Accept at most `limit` more bytes, then report `WouldBlock`.
    pub fn set_write_limit(&mut self, limit: usize) {
        self.write_limit = Some(limit);
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl Socket for ScriptedSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.script.front_mut() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(Step::Eof) => Ok(0),
            Some(Step::Data(data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                data.drain(..n);
                if data.is_empty() {
                    self.script.pop_front();
                }
                Ok(n)
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_vectored(&[IoSlice::new(buf)])
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut room = self.write_limit.unwrap_or(usize::MAX);
        if room == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let mut n = 0;
        for buf in bufs {
            let take = buf.len().min(room);
            self.written.extend_from_slice(&buf[..take]);
            n += take;
            room -= take;
            if room == 0 {
                break;
            }
        }
        if let Some(limit) = self.write_limit.as_mut() {
            *limit -= n;
        }
        Ok(n)
    }

    fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(unspecified())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(unspecified())
    }

    fn raw_fd(&self) -> RawFd {
        -1
    }
}

/// One end of a `UnixStream` pair as a channel socket.
pub struct UnixSocket(pub UnixStream);

impl Socket for UnixSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.0, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut self.0, buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        io::Write::write_vectored(&mut self.0, bufs)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.0.shutdown(how.into())
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.0.take_error()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(unspecified())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(unspecified())
    }

    fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    State(ChannelId, ChannelEventKind),
    Data(ChannelId, Vec<u8>),
    Pool(PoolEvent),
}

#[derive(Debug, Clone, Copy)]
enum DataMode {
    ConsumeAll,
    ConsumeAtMost(usize),
    Panic,
}

/// Handler that records everything it is told.
pub struct RecordingHandler {
    log: Mutex<Vec<Recorded>>,
    mode: DataMode,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            mode: DataMode::ConsumeAll,
        }
    }

    pub fn consuming_at_most(n: usize) -> Self {
        Self {
            mode: DataMode::ConsumeAtMost(n),
            ..Self::new()
        }
    }

    pub fn panicking_on_data() -> Self {
        Self {
            mode: DataMode::Panic,
            ..Self::new()
        }
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.log.lock().clone()
    }

    pub fn kinds(&self, id: ChannelId) -> Vec<ChannelEventKind> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::State(ch, kind) if *ch == id => Some(*kind),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, id: ChannelId, kind: ChannelEventKind) -> usize {
        self.kinds(id).iter().filter(|k| **k == kind).count()
    }

    pub fn downs(&self, id: ChannelId) -> usize {
        self.kinds(id)
            .iter()
            .filter(|k| matches!(k, ChannelEventKind::Down { .. }))
            .count()
    }

    pub fn data_of(&self, id: ChannelId) -> Vec<Vec<u8>> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Data(ch, bytes) if *ch == id => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Bytes presented across all deliveries to `id`.
    pub fn data_bytes(&self, id: ChannelId) -> usize {
        self.data_of(id).iter().map(Vec::len).sum()
    }

    pub fn pool_events(&self) -> Vec<PoolEvent> {
        self.log
            .lock()
            .iter()
            .filter_map(|r| match r {
                Recorded::Pool(event) => Some(*event),
                _ => None,
            })
            .collect()
    }

    /// Poll `pred` until it holds or `timeout` passes.
    pub fn wait_for(&self, timeout: Duration, mut pred: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }
}

impl Handler for RecordingHandler {
    fn channel_state(&self, event: &ChannelEvent) {
        self.log
            .lock()
            .push(Recorded::State(event.channel_id, event.kind));
    }

    fn data(&self, event: DataEvent<'_>) -> usize {
        let bytes = event.data.to_vec();
        let len = bytes.len();
        self.log.lock().push(Recorded::Data(event.channel_id, bytes));
        match self.mode {
            DataMode::ConsumeAll => len,
            DataMode::ConsumeAtMost(n) => len.min(n),
            DataMode::Panic => panic!("handler refuses data"),
        }
    }

    fn pool_state(&self, event: &PoolEvent) {
        self.log.lock().push(Recorded::Pool(*event));
    }
}

/// One manager driven by the test thread, plus the shared pool state.
pub struct Rig {
    pub manager: Arc<MioEventManager>,
    pub shared: Arc<PoolShared>,
    pub handler: Arc<RecordingHandler>,
}

impl Rig {
    pub fn new(config: impl FnOnce(PoolConfig) -> PoolConfig) -> Self {
        Self::with_handler(config, RecordingHandler::new())
    }

    pub fn with_handler(
        config: impl FnOnce(PoolConfig) -> PoolConfig,
        handler: RecordingHandler,
    ) -> Self {
        let config = config(PoolConfig::new().num_event_managers(1));
        let manager = Arc::new(MioEventManager::new(0, 64).unwrap());
        let handler = Arc::new(handler);
        let buffers: Arc<dyn BufferPool> = match config.max_buffers {
            None => Arc::new(HeapBufferPool::new(config.buffer_size)),
            Some(count) => Arc::new(FixedBufferPool::new(config.buffer_size, count)),
        };
        let shared = Arc::new(PoolShared::new(
            config.clone(),
            handler.clone(),
            buffers,
            Arc::new(TcpSocketFactory::new()),
            vec![manager.clone() as Arc<dyn EventManager>],
        ));
        Self {
            manager,
            shared,
            handler,
        }
    }

    /// Channel over one end of a socket pair; the other end is returned
    /// non-blocking. The start job is queued, not run.
    pub fn import(&self) -> (Arc<Channel>, UnixStream) {
        self.import_with(ChannelOptions {
            read_enabled: true,
            half_open: Default::default(),
        })
    }

    pub fn import_with(&self, options: ChannelOptions) -> (Arc<Channel>, UnixStream) {
        let (ours, peer) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        peer.set_nonblocking(true).unwrap();
        let channel = self
            .shared
            .open_channel(
                ChannelKind::Imported,
                SourceId(7),
                options,
                Some(Box::new(UnixSocket(ours))),
                None,
            )
            .unwrap();
        let starting = channel.clone();
        self.manager
            .execute(Box::new(move || starting.start()))
            .unwrap();
        (channel, peer)
    }
}

/// Run `n` manager iterations.
pub fn pump(manager: &MioEventManager, n: usize) {
    for _ in 0..n {
        manager
            .run_one_iteration(Some(Duration::from_millis(10)))
            .unwrap();
    }
}

/// Run manager iterations until `pred` holds; panics after five seconds.
pub fn pump_until(manager: &MioEventManager, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        manager
            .run_one_iteration(Some(Duration::from_millis(10)))
            .unwrap();
    }
}
