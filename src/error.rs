use std::fmt;

use crate::hex::ShortHexExt;
use crate::messages::MessageId;
use crate::overlay::{Direction, PeerId};

#[derive(Debug)]
pub enum Error {
    /// No neighbor exists in the (dimension, direction) a message must be
    /// forwarded to. The neighbor table contradicts the zone geometry.
    NoNeighbor {
        dimension: usize,
        direction: Direction,
    },
    /// A response arrived for a message id with no aggregation entry. This is
    /// a protocol violation, not a transient condition.
    UnknownResponseEntry(MessageId),
    /// A final response was pushed for a request the dispatcher is not
    /// tracking.
    UnknownPendingRequest(MessageId),
    /// An aggregation entry received more responses than it expected.
    EntryAlreadyCompleted(MessageId),
    /// The channel to a peer is closed.
    PeerUnreachable(PeerId),
    /// The caller awaiting a final response went away.
    ResponseChannelClosed,
    /// A fire-and-forget dispatch was given a request with a response
    /// provider.
    ProviderForbidden,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoNeighbor {
                dimension,
                direction,
            } => write!(
                f,
                "no neighbor on dimension {} towards the {} side",
                dimension, direction
            ),
            Error::UnknownResponseEntry(id) => {
                write!(f, "no response entry for message {}", id)
            }
            Error::UnknownPendingRequest(id) => {
                write!(f, "no pending request for message {}", id)
            }
            Error::EntryAlreadyCompleted(id) => {
                write!(f, "response entry for message {} already completed", id)
            }
            Error::PeerUnreachable(id) => {
                write!(f, "peer {} is unreachable", id.short_hex())
            }
            Error::ResponseChannelClosed => {
                write!(f, "requester stopped waiting for the final response")
            }
            Error::ProviderForbidden => write!(
                f,
                "fire-and-forget requests must not carry a response provider"
            ),
        }
    }
}

impl std::error::Error for Error {}
