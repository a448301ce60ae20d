//! Message-passing transport between partitions.
//!
//! The core needs only three operations: non-blocking typed send, non-blocking
//! receive, and a collective wait. Sends and receives are matched by
//! `(peer, tag)`; payloads are opaque byte vectors (the barrier serialises
//! activity batches into them).
//!
//! [`MemoryTransport`] is the in-process implementation used by the
//! multi-partition runner and the tests; an MPI-style process transport
//! implements the same trait.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::types::Rank;

/// Message tag distinguishing exchange kinds on the same peer pair.
pub type Tag = u32;

/// Tag used by the periodic barrier exchange.
pub const BARRIER_TAG: Tag = 0;
/// Tag used by the one-shot init-data exchange.
pub const INIT_TAG: Tag = 1;

/// Transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer rank does not exist on this transport.
    #[error("peer rank {0} is not reachable on this transport")]
    UnknownPeer(Rank),

    /// A peer endpoint went away while requests were pending.
    ///
    /// Surfaced when a partition aborts mid-run: its peers unblock from
    /// `wait_all` with this error instead of hanging at the barrier.
    #[error("peer rank {0} disconnected while requests were pending")]
    Disconnected(Rank),
}

/// A posted non-blocking operation, completed by `wait_all`.
#[derive(Debug)]
pub struct Request {
    kind: RequestKind,
}

#[derive(Debug)]
enum RequestKind {
    Send { peer: Rank, tag: Tag },
    Recv { peer: Rank, tag: Tag },
}

/// Outcome of one completed request, in posting order.
#[derive(Debug)]
pub enum Completion {
    Sent { peer: Rank, tag: Tag },
    Received { peer: Rank, tag: Tag, payload: Vec<u8> },
}

impl Completion {
    /// The received payload, for receive completions.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Completion::Received { payload, .. } => Some(payload),
            Completion::Sent { .. } => None,
        }
    }
}

/// Non-blocking typed send/recv plus a collective wait.
pub trait Transport: Send {
    /// This endpoint's rank.
    fn rank(&self) -> Rank;

    /// Number of ranks on the transport.
    fn num_ranks(&self) -> u32;

    /// Posts a non-blocking send of `payload` to `peer`.
    fn isend(&mut self, peer: Rank, tag: Tag, payload: Vec<u8>) -> Result<Request, TransportError>;

    /// Posts a non-blocking receive from `peer`.
    fn irecv(&mut self, peer: Rank, tag: Tag) -> Result<Request, TransportError>;

    /// Blocks until every posted request completes. Completions come back
    /// in posting order.
    fn wait_all(&mut self, requests: Vec<Request>) -> Result<Vec<Completion>, TransportError>;
}

/// Shared state behind every in-process endpoint.
#[derive(Default)]
struct MailboxState {
    /// In-flight payloads keyed by (from, to, tag), FIFO per key.
    slots: HashMap<(Rank, Rank, Tag), VecDeque<Vec<u8>>>,
    /// Ranks whose endpoint has been dropped.
    closed: HashSet<Rank>,
}

struct Mailbox {
    state: Mutex<MailboxState>,
    delivered: Condvar,
}

/// In-process transport: one endpoint per rank over a shared mailbox.
///
/// Sends complete eagerly (buffered); receives block inside `wait_all`
/// until the matching payload arrives. Message order per `(peer, tag)`
/// pair is FIFO, so two runs with identical sends observe identical
/// delivery.
pub struct MemoryTransport {
    rank: Rank,
    num_ranks: u32,
    mailbox: Arc<Mailbox>,
}

impl MemoryTransport {
    /// Creates `num_ranks` connected endpoints, index = rank.
    pub fn hub(num_ranks: u32) -> Vec<MemoryTransport> {
        let mailbox = Arc::new(Mailbox {
            state: Mutex::new(MailboxState::default()),
            delivered: Condvar::new(),
        });
        (0..num_ranks)
            .map(|rank| MemoryTransport {
                rank,
                num_ranks,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    fn check_peer(&self, peer: Rank) -> Result<(), TransportError> {
        if peer >= self.num_ranks || peer == self.rank {
            return Err(TransportError::UnknownPeer(peer));
        }
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> u32 {
        self.num_ranks
    }

    fn isend(&mut self, peer: Rank, tag: Tag, payload: Vec<u8>) -> Result<Request, TransportError> {
        self.check_peer(peer)?;
        {
            let mut state = self.mailbox.state.lock();
            state
                .slots
                .entry((self.rank, peer, tag))
                .or_default()
                .push_back(payload);
        }
        self.mailbox.delivered.notify_all();
        Ok(Request {
            kind: RequestKind::Send { peer, tag },
        })
    }

    fn irecv(&mut self, peer: Rank, tag: Tag) -> Result<Request, TransportError> {
        self.check_peer(peer)?;
        Ok(Request {
            kind: RequestKind::Recv { peer, tag },
        })
    }

    fn wait_all(&mut self, requests: Vec<Request>) -> Result<Vec<Completion>, TransportError> {
        let mut completions = Vec::with_capacity(requests.len());
        for request in requests {
            match request.kind {
                RequestKind::Send { peer, tag } => {
                    completions.push(Completion::Sent { peer, tag });
                }
                RequestKind::Recv { peer, tag } => {
                    let mut state = self.mailbox.state.lock();
                    let payload = loop {
                        if let Some(payload) = state
                            .slots
                            .get_mut(&(peer, self.rank, tag))
                            .and_then(|q| q.pop_front())
                        {
                            break payload;
                        }
                        if state.closed.contains(&peer) {
                            return Err(TransportError::Disconnected(peer));
                        }
                        self.mailbox.delivered.wait(&mut state);
                    };
                    completions.push(Completion::Received { peer, tag, payload });
                }
            }
        }
        Ok(completions)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut state = self.mailbox.state.lock();
        state.closed.insert(self.rank);
        drop(state);
        self.mailbox.delivered.notify_all();
    }
}
