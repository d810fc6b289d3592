//! Distributed termination detection.
//!
//! Every rank votes once per round with its pending-ray count. After a
//! barrier the counts are summed and the total is broadcast; the frame
//! is done only when the total is zero. One idle rank never ends the
//! frame on its own because a peer may still be about to send it work.

use crate::comm::Communicator;
use crate::error::TraceResult;

/// Global frame state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoteState {
    #[default]
    Running,
    Done,
}

/// Termination voter. `Running -> Done` is one-way until [`Voter::reset`].
#[derive(Debug, Default)]
pub struct Voter {
    state: VoteState,
    rounds: u64,
}

impl Voter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new frame.
    pub fn reset(&mut self) {
        self.state = VoteState::Running;
        self.rounds = 0;
    }

    pub fn state(&self) -> VoteState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == VoteState::Done
    }

    /// Number of votes cast this frame.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Whether this rank would propose termination.
    pub fn proposes(local_pending: usize) -> bool {
        local_pending == 0
    }

    /// Cast this rank's vote and learn the global outcome.
    ///
    /// Collective: every rank must call `vote` the same number of times.
    /// A single-rank world decides locally.
    pub fn vote<C: Communicator + ?Sized>(&mut self, comm: &C, local_pending: usize) -> TraceResult<VoteState> {
        if self.is_done() {
            return Ok(self.state);
        }
        self.rounds += 1;

        let total = if comm.size() < 2 {
            local_pending as u64
        } else {
            comm.barrier()?;
            comm.all_reduce_sum(local_pending as u64)?
        };

        log::debug!(
            "[rank {}] vote {}: local pending {} (proposes: {}), global pending {}",
            comm.rank(),
            self.rounds,
            local_pending,
            Self::proposes(local_pending),
            total
        );

        if total == 0 {
            self.state = VoteState::Done;
        }
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ChannelComm, SingleProcess};
    use std::thread;

    #[test]
    fn test_single_process_decides_locally() {
        let mut voter = Voter::new();
        assert_eq!(voter.vote(&SingleProcess, 3).unwrap(), VoteState::Running);
        assert_eq!(voter.vote(&SingleProcess, 0).unwrap(), VoteState::Done);
        assert_eq!(voter.rounds(), 2);
    }

    #[test]
    fn test_done_is_sticky_until_reset() {
        let mut voter = Voter::new();
        voter.vote(&SingleProcess, 0).unwrap();
        assert_eq!(voter.vote(&SingleProcess, 10).unwrap(), VoteState::Done);

        voter.reset();
        assert_eq!(voter.state(), VoteState::Running);
        assert_eq!(voter.vote(&SingleProcess, 10).unwrap(), VoteState::Running);
    }

    #[test]
    fn test_idle_rank_does_not_end_frame() {
        let world = ChannelComm::world(2);

        // Rank 0 is idle from the start; rank 1 needs two rounds to empty
        let outcomes: Vec<Vec<VoteState>> = thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let pending: &[usize] = if comm.rank() == 0 { &[0, 0, 0] } else { &[2, 1, 0] };
                        let mut voter = Voter::new();
                        pending
                            .iter()
                            .map(|&p| voter.vote(comm, p).unwrap())
                            .collect()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let expected = vec![VoteState::Running, VoteState::Running, VoteState::Done];
        assert_eq!(outcomes, vec![expected.clone(), expected]);
    }
}
