//! Ray exchange between ranks.
//!
//! Runs once local work is exhausted. Every rank drains the queues of
//! instances it does not own and packs them into one buffer per owner:
//!
//! ```text
//! [u32 instance][u32 count][count x packed ray] ...
//! ```
//!
//! Byte and ray totals go out first on [`Tag::Sizes`] to every peer, so
//! receivers know exactly what to expect, then the buffers themselves on
//! [`Tag::Rays`]. Received rays are appended to the local queues.

use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dray_core::InstanceId;
use thiserror::Error;

use crate::comm::{Communicator, Tag};
use crate::error::TraceResult;
use crate::queue::QueueManager;
use crate::ray::{PackError, Ray, RayVector, SURFACE_PACKED_SIZE};

/// Size of one batch header: instance id and ray count.
pub const BATCH_HEADER_SIZE: usize = 8;

/// Size of the handshake sent to every peer: byte count and ray count.
const SIZES_LEN: usize = 16;

/// Errors that corrupt an exchange. None of them can be repaired locally.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("rank {peer} announced {announced} bytes but sent {received}")]
    SizeMismatch {
        peer: usize,
        announced: u64,
        received: u64,
    },

    #[error("rank {peer} announced {announced} rays but {decoded} were decoded")]
    CountMismatch {
        peer: usize,
        announced: u64,
        decoded: u64,
    },

    #[error("batch for rank {peer} packed to {written} bytes, expected {expected}")]
    PackedSize {
        peer: usize,
        expected: usize,
        written: usize,
    },

    #[error("malformed size handshake from rank {0}")]
    MalformedSizes(usize),

    #[error("undecodable payload from rank {peer}: {source}")]
    Decode {
        peer: usize,
        #[source]
        source: PackError,
    },

    #[error("rank {peer} claims {count} rays for instance {instance} with only {remaining} bytes left")]
    BatchOverrun {
        peer: usize,
        instance: InstanceId,
        count: usize,
        remaining: usize,
    },

    #[error("rank {peer} sent rays for unknown instance {instance}")]
    UnknownInstance { peer: usize, instance: InstanceId },

    #[error("failed to pack rays: {0}")]
    Pack(#[from] io::Error),
}

/// Counters from one exchange.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Exchanged {
    pub rays_sent: u64,
    pub bytes_sent: u64,
    pub rays_received: u64,
}

/// One destination's outgoing buffer.
#[derive(Debug, Default)]
struct Outbox {
    bytes: Vec<u8>,
    rays: u64,
}

impl Outbox {
    /// Append one batch and check it packed to its predicted size.
    fn push_batch(&mut self, peer: usize, instance: InstanceId, rays: &[Ray]) -> Result<(), TransportError> {
        let expected = BATCH_HEADER_SIZE + rays.iter().map(Ray::packed_size).sum::<usize>();
        let start = self.bytes.len();
        self.bytes.reserve(expected);

        self.bytes.write_u32::<LittleEndian>(instance)?;
        self.bytes.write_u32::<LittleEndian>(rays.len() as u32)?;
        for ray in rays {
            ray.pack(&mut self.bytes)?;
        }

        let written = self.bytes.len() - start;
        if written != expected {
            return Err(TransportError::PackedSize {
                peer,
                expected,
                written,
            });
        }
        self.rays += rays.len() as u64;
        Ok(())
    }
}

/// Exchange rays queued for instances owned elsewhere.
///
/// `owner_of` returns the rank that must trace an instance, or `None` if
/// the rays stay here. A world of one skips the exchange.
pub fn exchange<C, F>(comm: &C, queues: &QueueManager, owner_of: F) -> TraceResult<Exchanged>
where
    C: Communicator + ?Sized,
    F: Fn(InstanceId) -> Option<usize>,
{
    let world_size = comm.size();
    let rank = comm.rank();
    if world_size < 2 {
        return Ok(Exchanged::default());
    }

    let mut outboxes: Vec<Outbox> = (0..world_size).map(|_| Outbox::default()).collect();
    for &instance in queues.ids() {
        let dest = match owner_of(instance) {
            Some(dest) if dest != rank => dest,
            _ => continue,
        };
        if queues.len(instance) == 0 {
            continue;
        }
        let rays = queues.drain(instance)?;
        outboxes[dest].push_batch(dest, instance, &rays)?;
    }

    let mut stats = Exchanged::default();

    for (peer, outbox) in outboxes.iter().enumerate() {
        if peer == rank {
            continue;
        }
        let sizes = encode_sizes(outbox.bytes.len() as u64, outbox.rays)?;
        comm.send(peer, Tag::Sizes, sizes)?;
    }

    let mut announced = vec![(0u64, 0u64); world_size];
    for (peer, slot) in announced.iter_mut().enumerate() {
        if peer == rank {
            continue;
        }
        let sizes = comm.recv(peer, Tag::Sizes)?;
        *slot = decode_sizes(peer, &sizes)?;
    }

    for (peer, outbox) in outboxes.into_iter().enumerate() {
        if peer == rank || outbox.bytes.is_empty() {
            continue;
        }
        stats.rays_sent += outbox.rays;
        stats.bytes_sent += outbox.bytes.len() as u64;
        comm.send(peer, Tag::Rays, outbox.bytes)?;
    }

    for (peer, &(bytes, rays)) in announced.iter().enumerate() {
        if peer == rank || bytes == 0 {
            continue;
        }
        let payload = comm.recv(peer, Tag::Rays)?;
        if payload.len() as u64 != bytes {
            return Err(TransportError::SizeMismatch {
                peer,
                announced: bytes,
                received: payload.len() as u64,
            }
            .into());
        }

        let decoded = receive_batches(peer, &payload, queues)?;
        if decoded != rays {
            return Err(TransportError::CountMismatch {
                peer,
                announced: rays,
                decoded,
            }
            .into());
        }
        stats.rays_received += decoded;
    }

    log::debug!(
        "[rank {}] exchange: sent {} rays ({} bytes), received {}",
        rank,
        stats.rays_sent,
        stats.bytes_sent,
        stats.rays_received
    );

    Ok(stats)
}

fn encode_sizes(bytes: u64, rays: u64) -> Result<Vec<u8>, TransportError> {
    let mut sizes = Vec::with_capacity(SIZES_LEN);
    sizes.write_u64::<LittleEndian>(bytes)?;
    sizes.write_u64::<LittleEndian>(rays)?;
    Ok(sizes)
}

fn decode_sizes(peer: usize, sizes: &[u8]) -> Result<(u64, u64), TransportError> {
    if sizes.len() != SIZES_LEN {
        return Err(TransportError::MalformedSizes(peer));
    }
    let mut cursor = Cursor::new(sizes);
    Ok((
        cursor.read_u64::<LittleEndian>()?,
        cursor.read_u64::<LittleEndian>()?,
    ))
}

/// Decode every batch in `payload` and append it to its queue.
/// Returns the number of rays decoded.
fn receive_batches(peer: usize, payload: &[u8], queues: &QueueManager) -> TraceResult<u64> {
    let decode_err = |source: PackError| TransportError::Decode { peer, source };
    let mut cursor = Cursor::new(payload);
    let mut decoded = 0u64;

    while (cursor.position() as usize) < payload.len() {
        let instance = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| decode_err(e.into()))?;
        let count = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| decode_err(e.into()))? as usize;
        if !queues.ids().contains(&instance) {
            return Err(TransportError::UnknownInstance { peer, instance }.into());
        }

        // Every ray packs to at least a surface record
        let remaining = payload.len() - cursor.position() as usize;
        if count > remaining / SURFACE_PACKED_SIZE {
            return Err(TransportError::BatchOverrun {
                peer,
                instance,
                count,
                remaining,
            }
            .into());
        }

        let mut rays = RayVector::with_capacity(count);
        for _ in 0..count {
            rays.push(Ray::unpack(&mut cursor).map_err(decode_err)?);
        }
        decoded += count as u64;
        queues.enqueue(instance, rays)?;
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ChannelComm, SingleProcess};
    use crate::error::TraceError;
    use crate::ray::{RayType, VolumeState};
    use glam::Vec3;
    use std::thread;

    fn rays(n: usize, base_id: i32) -> RayVector {
        (0..n)
            .map(|i| Ray::new(Vec3::new(i as f32, 0.0, 0.0), Vec3::Z).with_id(base_id + i as i32))
            .collect()
    }

    #[test]
    fn test_single_process_skips_exchange() {
        let queues = QueueManager::new([0, 1], 8);
        queues.enqueue(1, rays(3, 0)).unwrap();

        let stats = exchange(&SingleProcess, &queues, |_| Some(0)).unwrap();
        assert_eq!(stats, Exchanged::default());
        assert_eq!(queues.len(1), 3);
    }

    #[test]
    fn test_batch_packs_to_predicted_size() {
        let mut outbox = Outbox::default();
        let mut batch = rays(2, 0);
        batch.push(Ray::new(Vec3::ZERO, Vec3::X).with_volume(VolumeState {
            opacity: 0.5,
            sample_type: 1,
        }));
        outbox.push_batch(1, 7, &batch).unwrap();

        let expected = BATCH_HEADER_SIZE + batch.iter().map(Ray::packed_size).sum::<usize>();
        assert_eq!(outbox.bytes.len(), expected);
        assert_eq!(outbox.rays, 3);
        assert_eq!(&outbox.bytes[0..4], &7u32.to_le_bytes());
        assert_eq!(&outbox.bytes[4..8], &3u32.to_le_bytes());
    }

    #[test]
    fn test_two_ranks_swap_rays() {
        // Instance 0 lives on rank 0, instance 1 on rank 1
        let owner = |id: InstanceId| Some(id as usize);
        let world = ChannelComm::world(2);

        let results: Vec<(Exchanged, usize, usize)> = thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let queues = QueueManager::new([0, 1], 8);
                        // Every rank holds rays for both instances
                        let base = comm.rank() as i32 * 100;
                        queues.enqueue(0, rays(2 + comm.rank(), base)).unwrap();
                        queues.enqueue(1, rays(5, base + 50)).unwrap();

                        let stats = exchange(comm, &queues, owner).unwrap();
                        (stats, queues.len(0), queues.len(1))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Rank 0 keeps its 2 rays for instance 0 and receives 3 more from rank 1
        let (stats0, len0, len1) = results[0];
        assert_eq!((len0, len1), (5, 0));
        assert_eq!(stats0.rays_sent, 5);
        assert_eq!(stats0.rays_received, 3);

        let (stats1, len0, len1) = results[1];
        assert_eq!((len0, len1), (0, 10));
        assert_eq!(stats1.rays_sent, 3);
        assert_eq!(stats1.rays_received, 5);
        let packed = BATCH_HEADER_SIZE + 3 * Ray::new(Vec3::ZERO, Vec3::X).packed_size();
        assert_eq!(stats1.bytes_sent, packed as u64);
    }

    #[test]
    fn test_received_rays_keep_their_fields() {
        let world = ChannelComm::world(2);
        let mut shadow = Ray::new(Vec3::new(1.0, 2.0, 3.0), Vec3::Y)
            .with_id(42)
            .with_type(RayType::Shadow);
        shadow.color = Vec3::new(0.25, 0.5, 0.75);
        shadow.set_bounces(3);

        let received = thread::scope(|s| {
            let sender = s.spawn(|| {
                let queues = QueueManager::new([0], 8);
                queues.enqueue(0, vec![shadow]).unwrap();
                exchange(&world[0], &queues, |_| Some(1)).unwrap();
            });
            let receiver = s.spawn(|| {
                let queues = QueueManager::new([0], 8);
                exchange(&world[1], &queues, |_| Some(1)).unwrap();
                queues.drain(0).unwrap()
            });
            sender.join().unwrap();
            receiver.join().unwrap()
        });

        assert_eq!(received, vec![shadow]);
    }

    #[test]
    fn test_announced_size_mismatch_is_fatal() {
        let world = ChannelComm::world(2);
        let queues = QueueManager::new([0], 8);

        // Rank 1 hand-crafts a handshake that promises more than it sends
        world[1].send(0, Tag::Sizes, encode_sizes(1000, 1).unwrap()).unwrap();
        world[1].send(0, Tag::Rays, vec![0u8; 10]).unwrap();

        let err = exchange(&world[0], &queues, |_| Some(0)).unwrap_err();
        assert!(matches!(
            err,
            TraceError::Transport(TransportError::SizeMismatch {
                peer: 1,
                announced: 1000,
                received: 10
            })
        ));
    }

    #[test]
    fn test_batch_count_past_payload_end_is_fatal() {
        let world = ChannelComm::world(2);
        let queues = QueueManager::new([0], 8);

        // Header claims u32::MAX rays but no ray bytes follow
        let mut payload = Vec::new();
        payload.write_u32::<LittleEndian>(0).unwrap();
        payload.write_u32::<LittleEndian>(u32::MAX).unwrap();
        let sizes = encode_sizes(payload.len() as u64, u32::MAX as u64).unwrap();
        world[1].send(0, Tag::Sizes, sizes).unwrap();
        world[1].send(0, Tag::Rays, payload).unwrap();

        let err = exchange(&world[0], &queues, |_| Some(0)).unwrap_err();
        assert!(matches!(
            err,
            TraceError::Transport(TransportError::BatchOverrun {
                peer: 1,
                instance: 0,
                remaining: 0,
                ..
            })
        ));
        assert_eq!(queues.len(0), 0);
    }

    #[test]
    fn test_unknown_instance_is_fatal() {
        let world = ChannelComm::world(2);
        let queues = QueueManager::new([0], 8);

        let mut outbox = Outbox::default();
        outbox.push_batch(0, 9, &rays(1, 0)).unwrap();
        let sizes = encode_sizes(outbox.bytes.len() as u64, outbox.rays).unwrap();
        world[1].send(0, Tag::Sizes, sizes).unwrap();
        world[1].send(0, Tag::Rays, outbox.bytes).unwrap();

        let err = exchange(&world[0], &queues, |_| Some(0)).unwrap_err();
        assert!(matches!(
            err,
            TraceError::Transport(TransportError::UnknownInstance { peer: 1, instance: 9 })
        ));
    }
}
