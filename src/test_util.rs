use std::collections::VecDeque;
use std::io;
use std::io::IoSlice;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use tokio::io::Interest;
use crate::socket::ChannelSocket;

#[derive(Debug, Default)]
struct Pipe {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory connection. The number of bytes per send can be limited to simulate
///  partial writes.
#[derive(Debug, Clone)]
pub struct MemorySocket {
    inbound: Arc<Mutex<Pipe>>,
    outbound: Arc<Mutex<Pipe>>,
    max_per_send: Arc<AtomicUsize>,
    send_buffer_size: Arc<AtomicUsize>,
}

impl MemorySocket {
    pub fn pair() -> (MemorySocket, MemorySocket) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));

        let a = MemorySocket {
            inbound: b_to_a.clone(),
            outbound: a_to_b.clone(),
            max_per_send: Arc::new(AtomicUsize::new(usize::MAX)),
            send_buffer_size: Arc::new(AtomicUsize::new(0)),
        };
        let b = MemorySocket {
            inbound: a_to_b,
            outbound: b_to_a,
            max_per_send: Arc::new(AtomicUsize::new(usize::MAX)),
            send_buffer_size: Arc::new(AtomicUsize::new(0)),
        };
        (a, b)
    }

    pub fn boxed(&self) -> Box<dyn ChannelSocket> {
        Box::new(self.clone())
    }

    pub fn set_max_per_send(&self, max_per_send: usize) {
        self.max_per_send.store(max_per_send, Ordering::SeqCst);
    }

    pub fn send_buffer_size(&self) -> usize {
        self.send_buffer_size.load(Ordering::SeqCst)
    }

    /// Takes everything the peer sent so far
    pub fn take_received(&self) -> Vec<u8> {
        self.inbound.lock().unwrap().data.drain(..).collect()
    }

    pub fn num_received(&self) -> usize {
        self.inbound.lock().unwrap().data.len()
    }

    pub fn write_raw(&self, data: &[u8]) {
        self.outbound.lock().unwrap().data.extend(data);
    }

    /// The peer receives end of stream once it consumed everything sent before
    pub fn close(&self) {
        self.outbound.lock().unwrap().closed = true;
        self.inbound.lock().unwrap().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.lock().unwrap().closed
    }
}

#[async_trait]
impl ChannelSocket for MemorySocket {
    fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.inbound.lock().unwrap();
        if inbound.data.is_empty() {
            return if inbound.closed {
                Ok(0)
            }
            else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = buf.len().min(inbound.data.len());
        for (i, b) in inbound.data.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }

    fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut outbound = self.outbound.lock().unwrap();
        if outbound.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let max = self.max_per_send.load(Ordering::SeqCst);
        let mut n = 0;
        for buf in bufs {
            let take = buf.len().min(max - n);
            outbound.data.extend(&buf[..take]);
            n += take;
            if n == max {
                break;
            }
        }
        if n == 0 && bufs.iter().any(|b| !b.is_empty()) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    async fn wait_ready(&self, _interest: Interest) -> io::Result<()> {
        tokio::task::yield_now().await;
        Ok(())
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.send_buffer_size.store(size, Ordering::SeqCst);
        Ok(())
    }

    fn set_recv_buffer_size(&self, _size: usize) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> io::Result<()> {
        self.close();
        Ok(())
    }
}
