//! In-process transport.
//!
//! One unbounded channel per ordered rank pair; sends never block, so the
//! odd/even handshake orderings used by the engine cannot deadlock here
//! either. Collectives are implemented over the same channels with every
//! rank sending to and receiving from every peer in rank order.

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{Collective, CommError, Tag};

struct Message {
    tag: Tag,
    bytes: Vec<u8>,
}

/// Channel-backed communicator endpoint for one rank.
pub struct LocalCollective {
    rank: usize,
    size: usize,
    senders: Vec<Sender<Message>>,
    receivers: Vec<Receiver<Message>>,
}

impl LocalCollective {
    /// Creates a fully-connected group of `size` endpoints, indexed by
    /// rank. Each endpoint is `Send` and is typically moved into its own
    /// thread.
    pub fn ring(size: usize) -> Vec<LocalCollective> {
        let mut senders: Vec<Vec<Sender<Message>>> = (0..size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<Receiver<Message>>> = (0..size).map(|_| Vec::new()).collect();
        for from in 0..size {
            for to in 0..size {
                let (tx, rx) = unbounded();
                senders[from].push(tx);
                receivers[to].push(rx);
            }
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalCollective {
                rank,
                size,
                senders,
                receivers,
            })
            .collect()
    }

    /// Convenience single-rank communicator.
    pub fn single() -> LocalCollective {
        Self::ring(1).pop().expect("ring(1) yields one endpoint")
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, to: usize, tag: Tag, data: &[u8]) -> Result<(), CommError> {
        self.senders[to]
            .send(Message {
                tag,
                bytes: data.to_vec(),
            })
            .map_err(|_| CommError::Disconnected { peer: to })
    }

    fn recv(&self, from: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        let msg = self.receivers[from]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: from })?;
        if msg.tag != tag {
            return Err(CommError::TagMismatch {
                from,
                expected: tag,
                got: msg.tag,
            });
        }
        Ok(msg.bytes)
    }

    fn all_reduce_sum(&self, value: i64) -> Result<i64, CommError> {
        let mut total = value;
        for peer in 0..self.size {
            if peer != self.rank {
                self.send(peer, Tag::Reduce, &value.to_ne_bytes())?;
            }
        }
        for peer in 0..self.size {
            if peer != self.rank {
                let bytes = self.recv(peer, Tag::Reduce)?;
                let value: [u8; 8] =
                    bytes.as_slice().try_into().map_err(|_| CommError::Truncated {
                        needed: 8,
                        available: bytes.len(),
                    })?;
                total += i64::from_ne_bytes(value);
            }
        }
        Ok(total)
    }

    fn all_reduce_or(&self, value: bool) -> Result<bool, CommError> {
        Ok(self.all_reduce_sum(value as i64)? != 0)
    }

    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CommError> {
        for peer in 0..self.size {
            if peer != self.rank {
                self.send(peer, Tag::Gather, data)?;
            }
        }
        let mut gathered = vec![Vec::new(); self.size];
        gathered[self.rank] = data.to_vec();
        for peer in 0..self.size {
            if peer != self.rank {
                gathered[peer] = self.recv(peer, Tag::Gather)?;
            }
        }
        Ok(gathered)
    }

    fn broadcast(&self, root: usize, data: &[u8]) -> Result<Vec<u8>, CommError> {
        if self.rank == root {
            for peer in 0..self.size {
                if peer != root {
                    self.send(peer, Tag::Broadcast, data)?;
                }
            }
            Ok(data.to_vec())
        } else {
            self.recv(root, Tag::Broadcast)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn single_rank_collectives_are_identities() {
        let comm = LocalCollective::single();
        assert_eq!(comm.all_reduce_sum(5).unwrap(), 5);
        assert!(!comm.all_reduce_or(false).unwrap());
        let gathered = comm.all_gather(&[1, 2, 3]).unwrap();
        assert_eq!(gathered, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn collectives_agree_across_ranks() {
        let endpoints = LocalCollective::ring(3);
        thread::scope(|scope| {
            for comm in endpoints {
                scope.spawn(move || {
                    let sum = comm.all_reduce_sum(comm.rank() as i64 + 1).unwrap();
                    assert_eq!(sum, 6);
                    let any = comm.all_reduce_or(comm.rank() == 1).unwrap();
                    assert!(any);
                    let gathered = comm.all_gather(&[comm.rank() as u8]).unwrap();
                    assert_eq!(gathered, vec![vec![0u8], vec![1u8], vec![2u8]]);
                    let root = comm.broadcast(0, &[comm.rank() as u8]).unwrap();
                    assert_eq!(root, vec![0u8]);
                });
            }
        });
    }

    #[test]
    fn point_to_point_preserves_order_and_tags() {
        let mut endpoints = LocalCollective::ring(2);
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        thread::scope(|scope| {
            scope.spawn(|| {
                a.send(1, Tag::Migration, &[1]).unwrap();
                a.send(1, Tag::Migration, &[2]).unwrap();
            });
            scope.spawn(|| {
                assert_eq!(b.recv(0, Tag::Migration).unwrap(), vec![1]);
                assert_eq!(b.recv(0, Tag::Migration).unwrap(), vec![2]);
            });
        });
    }

    #[test]
    fn tag_mismatch_is_a_protocol_violation() {
        let mut endpoints = LocalCollective::ring(2);
        let b = endpoints.pop().unwrap();
        let a = endpoints.pop().unwrap();
        a.send(1, Tag::GhostData, &[0]).unwrap();
        assert!(matches!(
            b.recv(0, Tag::Migration),
            Err(CommError::TagMismatch { .. })
        ));
    }
}
