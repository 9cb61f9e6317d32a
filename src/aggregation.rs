use std::sync::Arc;

use crate::error::Error;
use crate::messages::{FinalResponse, MergeFn, MessageId, Payload};

/// Combines the final responses of a dispatcher-side group: called with the
/// group's immutable context, the accumulator, and the next payload.
pub type CombinerFn = Arc<dyn Fn(&Payload, Payload, Payload) -> Payload + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    ReceiptInProgress,
    ReceiptCompleted,
}

pub(crate) fn merge_payloads(
    acc: Option<Payload>,
    incoming: Option<Payload>,
    merge: Option<&MergeFn>,
) -> Option<Payload> {
    match (acc, incoming) {
        (None, incoming) => incoming,
        (acc, None) => acc,
        // without a merge function the first payload wins
        (Some(acc), Some(incoming)) => Some(match merge {
            Some(merge) => merge(acc, incoming),
            None => acc,
        }),
    }
}

/// Tracks one fan-out on one peer: how many sub-responses are expected, how
/// many have arrived, and the running merge of their payloads. Completes
/// exactly once, when the last expected response is absorbed.
pub struct ResponseEntry {
    expected: u32,
    received: u32,
    payload: Option<Payload>,
    error: bool,
    inbound_hop_count: u32,
    outbound_hop_count: u32,
    status: Status,
}

impl ResponseEntry {
    /// `seed` is the hosting peer's own contribution, counted as payload but
    /// not as a received response.
    pub fn new(expected: u32, seed: Option<Payload>) -> Self {
        debug_assert!(expected >= 1);
        Self {
            expected,
            received: 0,
            payload: seed,
            error: false,
            inbound_hop_count: 0,
            outbound_hop_count: 0,
            status: Status::ReceiptInProgress,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Marks the hosting peer's own contribution as failed.
    pub fn mark_error(&mut self) {
        self.error = true;
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Folds one sub-response in and reports the resulting status. Absorbing
    /// past completion is a protocol violation and leaves the entry
    /// untouched.
    pub fn absorb(
        &mut self,
        id: MessageId,
        payload: Option<Payload>,
        error: bool,
        inbound_hop_count: u32,
        outbound_hop_count: u32,
        merge: Option<&MergeFn>,
    ) -> Result<Status, Error> {
        if self.status == Status::ReceiptCompleted {
            return Err(Error::EntryAlreadyCompleted(id));
        }

        self.payload = merge_payloads(self.payload.take(), payload, merge);
        self.error |= error;
        self.inbound_hop_count = self.inbound_hop_count.max(inbound_hop_count);
        self.outbound_hop_count = self.outbound_hop_count.max(outbound_hop_count);
        self.received += 1;
        if self.received == self.expected {
            self.status = Status::ReceiptCompleted;
        }

        Ok(self.status)
    }

    /// (payload, error, inbound hops, outbound hops) of the completed entry.
    pub fn into_parts(self) -> (Option<Payload>, bool, u32, u32) {
        (
            self.payload,
            self.error,
            self.inbound_hop_count,
            self.outbound_hop_count,
        )
    }
}

/// Dispatcher-side entry combining the final responses of an explicit group
/// of independent requests into one.
pub struct AggregationEntry {
    expected: u32,
    received: u32,
    context: Payload,
    combiner: CombinerFn,
    payload: Option<Payload>,
    error: bool,
    inbound_hop_count: u32,
    outbound_hop_count: u32,
    status: Status,
}

impl AggregationEntry {
    pub fn new(expected: u32, context: Payload, combiner: CombinerFn) -> Self {
        debug_assert!(expected >= 1);
        Self {
            expected,
            received: 0,
            context,
            combiner,
            payload: None,
            error: false,
            inbound_hop_count: 0,
            outbound_hop_count: 0,
            status: Status::ReceiptInProgress,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn absorb(&mut self, id: MessageId, response: FinalResponse) -> Result<Status, Error> {
        if self.status == Status::ReceiptCompleted {
            return Err(Error::EntryAlreadyCompleted(id));
        }

        self.payload = match (self.payload.take(), response.payload) {
            (None, incoming) => incoming,
            (payload, None) => payload,
            (Some(payload), Some(incoming)) => {
                Some((self.combiner)(&self.context, payload, incoming))
            }
        };
        self.error |= response.error;
        self.inbound_hop_count = self.inbound_hop_count.max(response.inbound_hop_count);
        self.outbound_hop_count = self.outbound_hop_count.max(response.outbound_hop_count);
        self.received += 1;
        if self.received == self.expected {
            self.status = Status::ReceiptCompleted;
        }

        Ok(self.status)
    }

    /// Final response of the whole group, delivered under the group id.
    pub fn into_final(self, id: MessageId) -> FinalResponse {
        let delivered_at = chrono::Utc::now();
        FinalResponse {
            id,
            aggregation_id: Some(id),
            payload: self.payload,
            error: self.error,
            inbound_hop_count: self.inbound_hop_count,
            outbound_hop_count: self.outbound_hop_count,
            dispatched_at: delivered_at,
            delivered_at,
        }
    }
}
