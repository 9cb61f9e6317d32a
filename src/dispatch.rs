use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use hashbrown::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::aggregation::{AggregationEntry, CombinerFn, Status};
use crate::error::Error;
use crate::messages::{FinalResponse, MessageId, Payload, Request};
use crate::overlay::PeerId;
use crate::peer::PeerStub;

/// Caller-facing entry point of the overlay: mints message ids, hands
/// requests to an access peer, and resolves the caller's future when the
/// aggregated final response lands. One dispatcher serves any number of
/// concurrent dispatches.
#[derive(Clone)]
pub struct MessageDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    proxy_id: PeerId,
    sequencer: AtomicU64,
    pending: Mutex<HashMap<MessageId, Pending>>,
}

enum Pending {
    Single(oneshot::Sender<FinalResponse>),
    Group(Box<GroupEntry>),
}

struct GroupEntry {
    entry: AggregationEntry,
    tx: oneshot::Sender<FinalResponse>,
}

impl DispatcherInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, Pending>> {
        // lock holders never panic
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn deliver(&self, response: FinalResponse) -> Result<(), Error> {
        let key = response.aggregation_id.unwrap_or(response.id);
        let mut pending = self.lock();
        match pending.get_mut(&key) {
            None => Err(Error::UnknownPendingRequest(key)),
            Some(Pending::Single(_)) => {
                if let Some(Pending::Single(tx)) = pending.remove(&key) {
                    tx.send(response)
                        .map_err(|_| Error::ResponseChannelClosed)?;
                }
                Ok(())
            }
            Some(Pending::Group(group)) => {
                let status = group.entry.absorb(key, response)?;
                if status == Status::ReceiptCompleted {
                    if let Some(Pending::Group(group)) = pending.remove(&key) {
                        let GroupEntry { entry, tx } = *group;
                        tx.send(entry.into_final(key))
                            .map_err(|_| Error::ResponseChannelClosed)?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Cloneable handle peers use to push a final response back to the
/// dispatcher that is waiting for it.
#[derive(Clone)]
pub struct FinalResponseSink {
    inner: Arc<DispatcherInner>,
}

impl FinalResponseSink {
    pub(crate) fn push(&self, response: FinalResponse) -> Result<(), Error> {
        self.inner.deliver(response)
    }
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                proxy_id: rand::random(),
                sequencer: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Producer half of every id this dispatcher mints.
    pub fn proxy_id(&self) -> PeerId {
        self.inner.proxy_id
    }

    fn next_message_id(&self) -> MessageId {
        MessageId {
            producer: self.inner.proxy_id,
            seq: self.inner.sequencer.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn sink(&self) -> FinalResponseSink {
        FinalResponseSink {
            inner: self.inner.clone(),
        }
    }

    /// Routes the request through `peer` and waits for its aggregated final
    /// response. The future completes once every reached peer has
    /// contributed.
    pub async fn dispatch(
        &self,
        mut request: Request,
        peer: &PeerStub,
    ) -> Result<FinalResponse, Error> {
        let id = self.next_message_id();
        request.id = id;
        request.dispatched_at = Utc::now();
        request.response_destination = Some(self.sink());

        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(id, Pending::Single(tx));
        debug!(%id, "dispatching request");

        if let Err(e) = peer.route(request) {
            self.inner.lock().remove(&id);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ResponseChannelClosed)
    }

    /// Routes the request without waiting for anything. No aggregation state
    /// is created anywhere; a response provider would go unanswered, so it is
    /// rejected outright.
    pub fn dispatch_forget(&self, mut request: Request, peer: &PeerStub) -> Result<(), Error> {
        if request.strategy.provider.is_some() {
            return Err(Error::ProviderForbidden);
        }
        let id = self.next_message_id();
        request.id = id;
        request.dispatched_at = Utc::now();
        debug!(%id, "dispatching fire-and-forget request");
        peer.route(request)
    }

    /// Dispatches several independent requests as one group and waits for a
    /// single response combining their final payloads. `requests` must not be
    /// empty; the combiner is called with `context` untouched between calls.
    pub async fn dispatch_group(
        &self,
        requests: Vec<Request>,
        context: Payload,
        combiner: CombinerFn,
        peer: &PeerStub,
    ) -> Result<FinalResponse, Error> {
        debug_assert!(!requests.is_empty());
        let group_id = self.next_message_id();
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(
            group_id,
            Pending::Group(Box::new(GroupEntry {
                entry: AggregationEntry::new(requests.len() as u32, context, combiner),
                tx,
            })),
        );
        debug!(id = %group_id, members = requests.len(), "dispatching request group");

        for mut request in requests {
            let id = self.next_message_id();
            request.id = id;
            request.aggregation_id = Some(group_id);
            request.dispatched_at = Utc::now();
            request.response_destination = Some(self.sink());
            if let Err(e) = peer.route(request) {
                self.inner.lock().remove(&group_id);
                return Err(e);
            }
        }
        rx.await.map_err(|_| Error::ResponseChannelClosed)
    }
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
