use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::io;
use std::io::IoSlice;
use std::str::FromStr;
use anyhow::{anyhow, bail};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;
use crate::buffers::transport_buffer::TransportBuffer;
use crate::config::MAX_FLUSH_ORDER_LEN;
use crate::ripc::{HEADER_LEN, PING_FRAME};

/// maximum number of frames passed to a single gathering send
pub const MAX_GATHER: usize = 64;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Priority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl Priority {
    fn from_char(c: char) -> Option<Priority> {
        match c {
            'H' => Some(Priority::High),
            'M' => Some(Priority::Medium),
            'L' => Some(Priority::Low),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Priority::High => 'H',
            Priority::Medium => 'M',
            Priority::Low => 'L',
        }
    }
}

/// The sequence in which the priority queues are drained, e.g. "HMHLHM": each position takes
///  one frame from the named queue, if it has one
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlushOrder(Vec<Priority>);

/// Parses the structure only. Whether a flush order is acceptable as a channel setting is up to
///  [crate::config::validate_flush_order].
impl FromStr for FlushOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<FlushOrder> {
        if s.is_empty() || s.len() > MAX_FLUSH_ORDER_LEN {
            bail!("flush order must have between 1 and {} characters", MAX_FLUSH_ORDER_LEN);
        }
        s.chars()
            .map(|c| Priority::from_char(c).ok_or_else(|| anyhow!("invalid priority '{}' in flush order", c)))
            .collect::<anyhow::Result<Vec<_>>>()
            .map(FlushOrder)
    }
}

impl Display for FlushOrder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for p in &self.0 {
            write!(f, "{}", p.as_char())?;
        }
        Ok(())
    }
}

/// Queues frames per priority and writes them to the socket with gathering sends.
///
/// Frames that were taken from the queues for a send, but not (completely) written yet, stay
///  'in flight' in the order in which they were taken. A partial send leaves them there, and the
///  next flush continues with them before taking more frames from the queues. So a partial write
///  never reorders frames.
///
/// Written frames are handed back to the caller, which returns their memory to the block pool.
pub struct WriteFlushEngine {
    queues: [VecDeque<TransportBuffer>; 3],
    flush_order: FlushOrder,
    flush_cursor: usize,
    in_flight: VecDeque<TransportBuffer>,
    /// unsent bytes of a ping frame, which are sent ahead of everything else
    ping_remaining: usize,
    bytes_queued: usize,
}

impl WriteFlushEngine {
    pub fn new(flush_order: FlushOrder) -> WriteFlushEngine {
        WriteFlushEngine {
            queues: Default::default(),
            flush_order,
            flush_cursor: 0,
            in_flight: VecDeque::new(),
            ping_remaining: 0,
            bytes_queued: 0,
        }
    }

    pub fn flush_order(&self) -> &FlushOrder {
        &self.flush_order
    }

    pub fn set_flush_order(&mut self, flush_order: FlushOrder) {
        self.flush_order = flush_order;
        self.flush_cursor = 0;
    }

    /// bytes that are queued or in flight, but were not written to the socket yet
    pub fn bytes_queued(&self) -> usize {
        self.bytes_queued
    }

    pub fn queue_len(&self, priority: Priority) -> usize {
        self.queues[priority as usize].len()
    }

    pub fn enqueue(&mut self, frame: TransportBuffer, priority: Priority) {
        self.bytes_queued += frame.frame_len();
        trace!("queueing frame of {} bytes with priority {:?}, {} bytes queued", frame.frame_len(), priority, self.bytes_queued);
        self.queues[priority as usize].push_back(frame);
    }

    /// Sends a ping frame, unless there is queued data: writing that keeps the connection alive
    ///  just as well. Returns the number of bytes that remain to be written.
    pub fn ping(&mut self, send: impl FnMut(&[IoSlice<'_>]) -> io::Result<usize>, written: &mut Vec<TransportBuffer>) -> io::Result<usize> {
        if self.bytes_queued == 0 {
            self.ping_remaining = HEADER_LEN;
            self.bytes_queued = HEADER_LEN;
        }
        self.flush(send, written)
    }

    /// Writes as much as possible, stopping on the first partial send. Fully written frames are
    ///  appended to `written`. Returns the number of bytes that remain queued.
    pub fn flush(&mut self, mut send: impl FnMut(&[IoSlice<'_>]) -> io::Result<usize>, written: &mut Vec<TransportBuffer>) -> io::Result<usize> {
        while self.bytes_queued > 0 {
            self.fill_gather();

            let (num_gathered, num_sent) = {
                let mut slices = Vec::with_capacity(self.in_flight.len() + 1);
                if self.ping_remaining > 0 {
                    slices.push(IoSlice::new(&PING_FRAME[HEADER_LEN - self.ping_remaining..]));
                }
                slices.extend(self.in_flight.iter().map(|f| IoSlice::new(f.frame())));
                let num_gathered: usize = slices.iter().map(|s| s.len()).sum();

                match send(&slices) {
                    Ok(n) => (num_gathered, n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => (num_gathered, 0),
                    Err(e) => return Err(e),
                }
            };
            trace!("sent {} of {} gathered bytes", num_sent, num_gathered);

            self.consume(num_sent, written);
            if num_sent < num_gathered {
                break;
            }
        }
        Ok(self.bytes_queued)
    }

    /// Takes frames from the queues in flush order until the gather array is full or the queues
    ///  are empty. Queues that are not part of the flush order are drained after a full pass of
    ///  the flush order took nothing.
    fn fill_gather(&mut self) {
        let order_len = self.flush_order.0.len();
        let mut num_empty_in_a_row = 0;

        while self.in_flight.len() < MAX_GATHER {
            if self.queues.iter().all(|q| q.is_empty()) {
                return;
            }

            if num_empty_in_a_row >= order_len {
                // only queues remain that the flush order does not mention
                match self.queues.iter_mut().find_map(|q| q.pop_front()) {
                    Some(frame) => self.in_flight.push_back(frame),
                    None => return,
                }
                continue;
            }

            let priority = self.flush_order.0[self.flush_cursor];
            self.flush_cursor = (self.flush_cursor + 1) % order_len;
            match self.queues[priority as usize].pop_front() {
                Some(frame) => {
                    num_empty_in_a_row = 0;
                    self.in_flight.push_back(frame);
                }
                None => num_empty_in_a_row += 1,
            }
        }
    }

    fn consume(&mut self, num_sent: usize, written: &mut Vec<TransportBuffer>) {
        self.bytes_queued -= num_sent;
        let mut left = num_sent;

        if self.ping_remaining > 0 {
            let n = left.min(self.ping_remaining);
            self.ping_remaining -= n;
            left -= n;
        }

        while left > 0 {
            let Some(front) = self.in_flight.front_mut() else {
                break;
            };
            let frame_len = front.frame_len();
            if left >= frame_len {
                left -= frame_len;
                if let Some(frame) = self.in_flight.pop_front() {
                    written.push(frame);
                }
            }
            else {
                front.advance_frame_start(left);
                left = 0;
            }
        }
    }

    /// Removes all frames, e.g. when the channel is closed
    pub fn drain_all(&mut self) -> Vec<TransportBuffer> {
        let mut result: Vec<TransportBuffer> = self.in_flight.drain(..).collect();
        for queue in self.queues.iter_mut() {
            result.extend(queue.drain(..));
        }
        self.ping_remaining = 0;
        self.bytes_queued = 0;
        result
    }
}
