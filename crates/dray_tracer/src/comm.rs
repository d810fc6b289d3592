//! Point-to-point messaging between ranks.
//!
//! The scheduler needs tagged sends and receives plus one collective,
//! a reduction whose result every rank learns. Reductions are built on
//! the point-to-point calls as a two-phase protocol: every rank sends its
//! contribution to rank 0, rank 0 combines and broadcasts the result.

use std::collections::VecDeque;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use bytemuck::Pod;
use dray_core::RenderConfig;
use parking_lot::Mutex;
use thiserror::Error;

/// Message channel a payload travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Transport size handshake
    Sizes,
    /// Transport ray payloads
    Rays,
    /// Contribution to a reduction
    Reduce,
    /// Result of a reduction
    Broadcast,
}

/// Errors raised by the messaging layer.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("rank {rank} is outside a world of {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    #[error("rank {0} disconnected")]
    Disconnected(usize),

    #[error("timed out waiting for {tag:?} from rank {src}")]
    Timeout { src: usize, tag: Tag },

    #[error("a single-process world has no peers")]
    NoPeers,

    #[error("malformed reduction payload from rank {0}")]
    Malformed(usize),
}

/// Result type for messaging operations.
pub type CommResult<T> = Result<T, CommError>;

/// How a reduction combines contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
}

/// Messaging between the ranks of one render.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Queue a payload for `dest`. Never waits for the receiver.
    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> CommResult<()>;

    /// Block until a payload with `tag` arrives from `src`. Payloads from
    /// the same sender on the same tag arrive in send order.
    fn recv(&self, src: usize, tag: Tag) -> CommResult<Vec<u8>>;

    /// Sum of `value` over every rank, returned on every rank.
    fn all_reduce_sum(&self, value: u64) -> CommResult<u64> {
        let total = two_phase(self, &[value], |acc, other| acc[0] += other[0])?;
        Ok(total[0])
    }

    /// Element-wise reduction of `values` over every rank, in place.
    fn all_reduce_f32(&self, values: &mut [f32], op: ReduceOp) -> CommResult<()> {
        let reduced = two_phase(self, values, |acc, other| {
            for (a, b) in acc.iter_mut().zip(other) {
                *a = match op {
                    ReduceOp::Sum => *a + *b,
                    ReduceOp::Min => a.min(*b),
                };
            }
        })?;
        values.copy_from_slice(&reduced);
        Ok(())
    }

    /// Return once every rank has called `barrier`.
    fn barrier(&self) -> CommResult<()> {
        self.all_reduce_sum(0).map(|_| ())
    }
}

/// Gather to rank 0, combine, broadcast back.
fn two_phase<C, T>(comm: &C, local: &[T], combine: impl Fn(&mut [T], &[T])) -> CommResult<Vec<T>>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    const ROOT: usize = 0;

    if comm.size() < 2 {
        return Ok(local.to_vec());
    }

    if comm.rank() == ROOT {
        let mut acc = local.to_vec();
        for src in 1..comm.size() {
            let bytes = comm.recv(src, Tag::Reduce)?;
            let incoming = decode::<T>(&bytes, local.len(), src)?;
            combine(&mut acc, &incoming);
        }
        let result: &[u8] = bytemuck::cast_slice(&acc);
        for dest in 1..comm.size() {
            comm.send(dest, Tag::Broadcast, result.to_vec())?;
        }
        Ok(acc)
    } else {
        comm.send(ROOT, Tag::Reduce, bytemuck::cast_slice(local).to_vec())?;
        let bytes = comm.recv(ROOT, Tag::Broadcast)?;
        decode::<T>(&bytes, local.len(), ROOT)
    }
}

fn decode<T: Pod>(bytes: &[u8], len: usize, src: usize) -> CommResult<Vec<T>> {
    let width = std::mem::size_of::<T>();
    if bytes.len() != len * width {
        return Err(CommError::Malformed(src));
    }
    Ok(bytes
        .chunks_exact(width)
        .map(bytemuck::pod_read_unaligned::<T>)
        .collect())
}

/// A world of one rank. Reductions return the local value and there is
/// nobody to message.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _dest: usize, _tag: Tag, _payload: Vec<u8>) -> CommResult<()> {
        Err(CommError::NoPeers)
    }

    fn recv(&self, _src: usize, _tag: Tag) -> CommResult<Vec<u8>> {
        Err(CommError::NoPeers)
    }
}

struct Envelope {
    src: usize,
    tag: Tag,
    payload: Vec<u8>,
}

/// In-process world: every rank is a thread, every link an mpsc channel.
pub struct ChannelComm {
    rank: usize,
    outboxes: Vec<Sender<Envelope>>,
    inbox: Mutex<Receiver<Envelope>>,
    /// Arrived payloads nobody asked for yet
    stash: Mutex<VecDeque<Envelope>>,
    timeout: Duration,
}

impl ChannelComm {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a connected world of `size` ranks; element `i` is rank `i`.
    pub fn world(size: usize) -> Vec<ChannelComm> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| channel()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| ChannelComm {
                rank,
                outboxes: senders.clone(),
                inbox: Mutex::new(inbox),
                stash: Mutex::new(VecDeque::new()),
                timeout: Self::DEFAULT_TIMEOUT,
            })
            .collect()
    }

    /// Connected world whose receives give up after `config.comm_timeout_ms`.
    pub fn world_with_config(size: usize, config: &RenderConfig) -> Vec<ChannelComm> {
        let timeout = config.comm_timeout();
        Self::world(size)
            .into_iter()
            .map(|comm| comm.with_timeout(timeout))
            .collect()
    }

    /// Bound every blocking receive.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn check_rank(&self, rank: usize) -> CommResult<()> {
        if rank >= self.outboxes.len() {
            return Err(CommError::InvalidRank {
                rank,
                world_size: self.outboxes.len(),
            });
        }
        Ok(())
    }

    fn take_stashed(&self, src: usize, tag: Tag) -> Option<Vec<u8>> {
        let mut stash = self.stash.lock();
        let pos = stash.iter().position(|e| e.src == src && e.tag == tag)?;
        stash.remove(pos).map(|e| e.payload)
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.outboxes.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> CommResult<()> {
        self.check_rank(dest)?;
        self.outboxes[dest]
            .send(Envelope {
                src: self.rank,
                tag,
                payload,
            })
            .map_err(|_| CommError::Disconnected(dest))
    }

    fn recv(&self, src: usize, tag: Tag) -> CommResult<Vec<u8>> {
        self.check_rank(src)?;

        // Another receiver may have stashed our message while we waited
        // for the inbox, so the stash is only checked under the inbox lock.
        let inbox = self.inbox.lock();
        if let Some(payload) = self.take_stashed(src, tag) {
            return Ok(payload);
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match inbox.recv_timeout(remaining) {
                Ok(envelope) if envelope.src == src && envelope.tag == tag => {
                    return Ok(envelope.payload);
                }
                Ok(envelope) => self.stash.lock().push_back(envelope),
                Err(RecvTimeoutError::Timeout) => return Err(CommError::Timeout { src, tag }),
                Err(RecvTimeoutError::Disconnected) => return Err(CommError::Disconnected(src)),
            }
        }
    }
}
