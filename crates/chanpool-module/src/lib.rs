//! # chanpool-module — default capability implementations
//!
//! | Capability      | Implementation      | Backing                          |
//! |-----------------|---------------------|----------------------------------|
//! | `EventManager`  | `MioEventManager`   | `mio::Poll` + `TimerQueue`       |
//! | `BufferPool`    | `HeapBufferPool`    | growable, `SegQueue` freelist    |
//! | `BufferPool`    | `FixedBufferPool`   | bounded, `ArrayQueue` freelist   |
//! | `SocketFactory` | `TcpSocketFactory`  | `mio::net` + `socket2`           |
//!
//! Everything here is replaceable: the pool only sees the traits from
//! `chanpool-core`.

pub mod timer_queue;
pub mod mio_manager;
pub mod heap_buffers;
pub mod fixed_pool;
pub mod tcp;

pub use timer_queue::{TimerQueue, TimerQueueStats};
pub use mio_manager::{MioEventManager, DEFAULT_EVENTS_CAPACITY};
pub use heap_buffers::HeapBufferPool;
pub use fixed_pool::FixedBufferPool;
pub use tcp::{TcpListenerSocket, TcpSocket, TcpSocketFactory};
