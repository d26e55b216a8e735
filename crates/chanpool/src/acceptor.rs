//! Listening sockets.
//!
//! An acceptor lives on one event manager. Each read readiness accepts up
//! to `max_reads_per_turn` connections; every accepted socket becomes a
//! channel on a manager chosen by the assignment policy. When `accept`
//! fails for any reason other than "nothing pending", the listener is
//! parked for an exponential back-off before it is armed again.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chanpool_core::error::is_resource_exhaustion;
use chanpool_core::{
    AcceptorId, CoreResult, EventManager, Interest, Listener, Socket, SourceId, TimerId,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::channel::ChannelKind;
use crate::error::PoolError;
use crate::event::PoolEvent;
use crate::options::ListenOptions;
use crate::shared::PoolShared;

struct AcceptorState {
    listener: Option<Box<dyn Listener>>,
    registered: bool,
    backoff: Duration,
    backoff_timer: Option<TimerId>,
    timeout_timer: Option<TimerId>,
}

pub(crate) struct Acceptor {
    id: AcceptorId,
    manager: Arc<dyn EventManager>,
    shared: Arc<PoolShared>,
    options: ListenOptions,
    local_addr: SocketAddr,
    fd: RawFd,
    state: Mutex<AcceptorState>,
    closed: AtomicBool,
}

impl Acceptor {
    pub fn new(
        id: AcceptorId,
        manager: Arc<dyn EventManager>,
        shared: Arc<PoolShared>,
        listener: Box<dyn Listener>,
        options: ListenOptions,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let fd = listener.raw_fd();
        let backoff = shared.config.accept_backoff_min;
        Ok(Self {
            id,
            manager,
            shared,
            options,
            local_addr,
            fd,
            state: Mutex::new(AcceptorState {
                listener: Some(listener),
                registered: false,
                backoff,
                backoff_timer: None,
                timeout_timer: None,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> AcceptorId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn manager(&self) -> &Arc<dyn EventManager> {
        &self.manager
    }

    /// Start accepting.
    pub fn start(self: &Arc<Self>) -> CoreResult<()> {
        let mut st = self.state.lock();
        self.arm(&mut st)?;
        self.arm_accept_timeout(&mut st);
        debug!(acceptor = %self.id, addr = %self.local_addr, "listening");
        Ok(())
    }

    fn arm(self: &Arc<Self>, st: &mut AcceptorState) -> CoreResult<()> {
        if !st.registered && st.listener.is_some() {
            let acceptor = self.clone();
            self.manager
                .register_read(self.fd, Box::new(move || acceptor.on_acceptable()))?;
            st.registered = true;
        }
        Ok(())
    }

    fn arm_accept_timeout(self: &Arc<Self>, st: &mut AcceptorState) {
        let timeout = match self.options.accept_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        if let Some(timer) = st.timeout_timer.take() {
            self.manager.cancel_timer(timer);
        }
        let acceptor = self.clone();
        st.timeout_timer = Some(self.manager.register_timer(
            Instant::now() + timeout,
            Box::new(move || acceptor.on_accept_timeout()),
        ));
    }

    fn on_acceptable(self: &Arc<Self>) {
        let mut accepted: Vec<(Box<dyn Socket>, SocketAddr)> = Vec::new();
        let mut failure = None;
        let mut requeue = false;
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let listener = match st.listener.as_mut() {
                Some(listener) => listener,
                None => return,
            };

            let max = self.shared.config.max_reads_per_turn;
            loop {
                if accepted.len() >= max {
                    requeue = true;
                    break;
                }
                match listener.accept() {
                    Ok(pair) => accepted.push(pair),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    // The pending connection died before we got to it.
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                        ) =>
                    {
                        continue
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if !accepted.is_empty() {
                st.backoff = self.shared.config.accept_backoff_min;
                self.arm_accept_timeout(st);
            }
            if failure.is_some() {
                self.park(st);
            }
        }

        for (socket, peer) in accepted {
            self.admit(socket, peer);
        }
        if let Some(e) = failure {
            warn!(
                acceptor = %self.id,
                error = %e,
                exhausted = is_resource_exhaustion(&e),
                "accept failed; backing off"
            );
            self.shared.notify_pool(PoolEvent::AcceptError {
                acceptor: self.id,
                kind: e.kind(),
            });
        }
        if requeue {
            let acceptor = self.clone();
            if self
                .manager
                .execute(Box::new(move || acceptor.on_acceptable()))
                .is_err()
            {
                trace!(acceptor = %self.id, "manager stopped; accept not requeued");
            }
        }
    }

    /// Stop listening for `backoff`, then re-arm; the next back-off doubles.
    fn park(self: &Arc<Self>, st: &mut AcceptorState) {
        if st.registered {
            self.manager.deregister(self.fd, Interest::Read);
            st.registered = false;
        }
        let delay = st.backoff;
        st.backoff = (delay * 2).min(self.shared.config.accept_backoff_max);
        let acceptor = self.clone();
        st.backoff_timer = Some(self.manager.register_timer(
            Instant::now() + delay,
            Box::new(move || acceptor.on_backoff_elapsed()),
        ));
    }

    fn on_backoff_elapsed(self: &Arc<Self>) {
        let mut st = self.state.lock();
        st.backoff_timer = None;
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.arm(&mut st) {
            warn!(acceptor = %self.id, error = %e, "re-arming listener failed");
            self.park(&mut st);
        }
    }

    fn admit(&self, socket: Box<dyn Socket>, peer: SocketAddr) {
        let source_id = SourceId(self.id.0);
        match self.shared.open_channel(
            ChannelKind::Accepted,
            source_id,
            self.options.channel(),
            Some(socket),
            None,
        ) {
            Ok(channel) => {
                trace!(acceptor = %self.id, channel = %channel.id(), %peer, "accepted");
                let starting = channel.clone();
                if channel
                    .manager()
                    .execute(Box::new(move || starting.start()))
                    .is_err()
                {
                    channel.close_quietly();
                }
            }
            Err(PoolError::ChannelLimit) => {
                debug!(acceptor = %self.id, %peer, "channel limit reached; connection dropped");
                self.shared
                    .notify_pool(PoolEvent::ChannelLimit { source_id });
            }
            Err(e) => warn!(acceptor = %self.id, %peer, error = %e, "accepted connection dropped"),
        }
    }

    fn on_accept_timeout(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            st.timeout_timer = None;
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.arm_accept_timeout(&mut st);
        }
        debug!(acceptor = %self.id, "accept timeout");
        self.shared
            .notify_pool(PoolEvent::AcceptTimeout { acceptor: self.id });
    }

    /// Stop listening and close the socket. Channels already accepted are
    /// not affected.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut st = self.state.lock();
        if st.registered {
            self.manager.deregister(self.fd, Interest::Both);
            st.registered = false;
        }
        for timer in [st.backoff_timer.take(), st.timeout_timer.take()]
            .into_iter()
            .flatten()
        {
            self.manager.cancel_timer(timer);
        }
        st.listener = None;
        debug!(acceptor = %self.id, "listener closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelEventKind;
    use crate::testing::{pump, pump_until, Rig};
    use chanpool_core::SocketFactory;
    use std::io::Write;
    use std::net::TcpStream;

    /// Listener whose `accept` always fails with `EMFILE`.
    struct Exhausted(RawFd, SocketAddr);

    impl Listener for Exhausted {
        fn accept(&mut self) -> io::Result<(Box<dyn Socket>, SocketAddr)> {
            Err(io::Error::from_raw_os_error(libc::EMFILE))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.1)
        }

        fn raw_fd(&self) -> RawFd {
            self.0
        }
    }

    fn acceptor(rig: &Rig, listener: Box<dyn Listener>, options: ListenOptions) -> Arc<Acceptor> {
        let acceptor = Arc::new(
            Acceptor::new(
                AcceptorId(9),
                rig.manager.clone(),
                rig.shared.clone(),
                listener,
                options,
            )
            .unwrap(),
        );
        acceptor.start().unwrap();
        acceptor
    }

    fn tcp_listener(rig: &Rig) -> Box<dyn Listener> {
        rig.shared
            .factory
            .listen("127.0.0.1:0".parse().unwrap(), 16, &rig.shared.config.socket_options())
            .unwrap()
    }

    #[test]
    fn test_accept_creates_channels() {
        let rig = Rig::new(|c| c);
        let acc = acceptor(&rig, tcp_listener(&rig), ListenOptions::default());

        let mut client = TcpStream::connect(acc.local_addr()).unwrap();
        pump_until(&rig.manager, || rig.shared.registry.len() == 1);
        client.write_all(b"hi").unwrap();

        pump_until(&rig.manager, || {
            rig.handler
                .recorded()
                .iter()
                .any(|r| matches!(r, crate::testing::Recorded::Data(_, d) if d == b"hi"))
        });
        let ch = rig.shared.registry.drain().pop().unwrap();
        assert_eq!(ch.kind(), ChannelKind::Accepted);
        assert_eq!(ch.source_id(), SourceId(9));
        assert_eq!(rig.handler.kinds(ch.id())[0], ChannelEventKind::Up);
        assert_eq!(ch.peer_addr(), Some(client.local_addr().unwrap()));
    }

    #[test]
    fn test_channel_limit_drops_connection() {
        let rig = Rig::new(|c| c.max_connections(Some(1)));
        let acc = acceptor(&rig, tcp_listener(&rig), ListenOptions::default());

        let _first = TcpStream::connect(acc.local_addr()).unwrap();
        pump_until(&rig.manager, || rig.shared.registry.len() == 1);
        let _second = TcpStream::connect(acc.local_addr()).unwrap();
        pump_until(&rig.manager, || {
            rig.handler
                .pool_events()
                .contains(&PoolEvent::ChannelLimit { source_id: SourceId(9) })
        });
        assert_eq!(rig.shared.registry.len(), 1);
    }

    #[test]
    fn test_accept_error_backs_off() {
        let rig = Rig::new(|c| c);
        // A socket pair end stands in for a listener that is always ready.
        let (ready, mut other) = std::os::unix::net::UnixStream::pair().unwrap();
        other.write_all(b"x").unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&ready);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let acc = acceptor(&rig, Box::new(Exhausted(fd, addr)), ListenOptions::default());

        pump_until(&rig.manager, || !rig.handler.pool_events().is_empty());
        assert_eq!(
            rig.handler.pool_events()[0],
            PoolEvent::AcceptError {
                acceptor: AcceptorId(9),
                kind: io::Error::from_raw_os_error(libc::EMFILE).kind(),
            }
        );
        // Parked: deregistered with a back-off timer pending.
        assert_eq!(rig.manager.num_sockets(), 0);
        assert_eq!(rig.manager.num_timers(), 1);
        assert_eq!(acc.state.lock().backoff, Duration::from_millis(20));

        acc.close();
        assert_eq!(rig.manager.num_timers(), 0);
        drop(ready);
    }

    #[test]
    fn test_accept_timeout_reports() {
        let rig = Rig::new(|c| c);
        let options = ListenOptions {
            accept_timeout: Some(Duration::from_millis(20)),
            ..ListenOptions::default()
        };
        let acc = acceptor(&rig, tcp_listener(&rig), options);
        pump_until(&rig.manager, || {
            rig.handler
                .pool_events()
                .iter()
                .filter(|e| matches!(e, PoolEvent::AcceptTimeout { .. }))
                .count()
                >= 2
        });
        acc.close();
        pump(&rig.manager, 1);
        assert_eq!(rig.manager.num_sockets(), 0);
        assert_eq!(rig.manager.num_timers(), 0);
    }
}
