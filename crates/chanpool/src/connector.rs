//! Outbound connection establishment with retry and deadline.
//!
//! A connecting channel owns a [`ConnectState`]. Each attempt asks the
//! socket factory for a non-blocking connect and waits for write
//! readiness; failures are retried every `retry_interval` until the
//! deadline or `max_attempts`. Only a successful attempt emits `Up`.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chanpool_core::{EventManager, Interest, SocketOptions, TimerId};
use tracing::{debug, trace};

use crate::channel::{core_error_kind, Channel, ChannelState};
use crate::event::{DownReason, PoolEvent};

pub(crate) struct ConnectState {
    pub addr: SocketAddr,
    pub options: SocketOptions,
    pub deadline: Instant,
    pub retry_interval: Duration,
    pub max_attempts: Option<u32>,
    pub attempts: u32,
    pub deadline_timer: Option<TimerId>,
    pub retry_timer: Option<TimerId>,
}

impl ConnectState {
    pub fn new(
        addr: SocketAddr,
        options: SocketOptions,
        timeout: Duration,
        retry_interval: Duration,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            addr,
            options,
            deadline: Instant::now() + timeout,
            retry_interval,
            max_attempts,
            attempts: 0,
            deadline_timer: None,
            retry_timer: None,
        }
    }

    pub fn cancel_timers(&mut self, manager: &dyn EventManager) {
        for timer in [self.deadline_timer.take(), self.retry_timer.take()]
            .into_iter()
            .flatten()
        {
            manager.cancel_timer(timer);
        }
    }
}

impl Channel {
    /// Arm the deadline and make the first attempt. Manager thread.
    pub(crate) fn start_connect(self: &Arc<Self>) {
        {
            let mut io = self.io.lock();
            if self.is_down() {
                return;
            }
            let connect = match io.connect.as_mut() {
                Some(connect) => connect,
                None => return,
            };
            let ch = self.clone();
            connect.deadline_timer = Some(
                self.manager()
                    .register_timer(connect.deadline, Box::new(move || ch.on_connect_deadline())),
            );
        }
        self.attempt_connect();
    }

    fn attempt_connect(self: &Arc<Self>) {
        let failure = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if self.is_down() {
                return;
            }
            let connect = match io.connect.as_mut() {
                Some(connect) => connect,
                None => return,
            };
            connect.retry_timer = None;
            connect.attempts += 1;
            trace!(channel = %self.id(), addr = %connect.addr, attempt = connect.attempts, "connecting");

            match self.shared().factory.connect(connect.addr, &connect.options) {
                Ok(socket) => match self
                    .manager()
                    .register_write(socket.raw_fd(), self.write_callback())
                {
                    Ok(()) => {
                        io.socket = Some(socket);
                        None
                    }
                    Err(e) => Some(core_error_kind(&e)),
                },
                Err(e) => Some(e.kind()),
            }
        };

        if let Some(kind) = failure {
            self.connect_attempt_failed(kind);
        }
    }

    /// Write readiness while connecting: the handshake resolved one way or
    /// the other.
    pub(crate) fn finish_connect(self: &Arc<Self>) {
        let outcome = {
            let mut io = self.io.lock();
            let socket = match io.socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            match socket.take_error() {
                Ok(Some(e)) | Err(e) => Err(e.kind()),
                Ok(None) => match socket.peer_addr() {
                    Ok(_) => Ok(()),
                    // Spurious wakeup; still in progress.
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                    Err(e) => Err(e.kind()),
                },
            }
        };

        match outcome {
            Ok(()) => self.connected(),
            Err(kind) => self.connect_attempt_failed(kind),
        }
    }

    fn connected(self: &Arc<Self>) {
        let attempts = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            let attempts = match io.connect.take() {
                Some(mut connect) => {
                    connect.cancel_timers(&**self.manager());
                    connect.attempts
                }
                None => 0,
            };
            if let Some(socket) = io.socket.as_ref() {
                self.manager().deregister(socket.raw_fd(), Interest::Write);
            }
            self.set_state(ChannelState::Connected);
            attempts
        };
        debug!(channel = %self.id(), attempts, "connected");
        self.start();
    }

    fn connect_attempt_failed(self: &Arc<Self>, kind: io::ErrorKind) {
        let (attempt, exhausted) = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if let Some(socket) = io.socket.take() {
                self.manager().deregister(socket.raw_fd(), Interest::Both);
                drop(socket);
            }
            let connect = match io.connect.as_mut() {
                Some(connect) => connect,
                None => return,
            };

            let attempt = connect.attempts;
            let exhausted = connect.max_attempts.is_some_and(|max| attempt >= max);
            if !exhausted {
                let next = Instant::now() + connect.retry_interval;
                // Past the deadline the deadline timer ends it.
                if next < connect.deadline {
                    let ch = self.clone();
                    connect.retry_timer = Some(
                        self.manager()
                            .register_timer(next, Box::new(move || ch.attempt_connect())),
                    );
                }
            }
            (attempt, exhausted)
        };

        debug!(channel = %self.id(), attempt, ?kind, exhausted, "connect attempt failed");
        self.shared().notify_pool(PoolEvent::ConnectAttemptFailed {
            channel_id: self.id(),
            source_id: self.source_id(),
            attempt,
            kind,
        });
        if exhausted {
            self.close(DownReason::ConnectFailed(kind));
        }
    }

    fn on_connect_deadline(self: &Arc<Self>) {
        let pending = {
            let mut io = self.io.lock();
            if let Some(connect) = io.connect.as_mut() {
                connect.deadline_timer = None;
            }
            self.state() == ChannelState::Connecting
        };
        if pending {
            self.close(DownReason::ConnectTimeout);
        }
    }
}
