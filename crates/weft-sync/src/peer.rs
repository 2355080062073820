//! A document paired with the messages it still has to send.

use crate::error::Result;
use crate::protocol::{DefaultProtocol, Protocol, SyncMessage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::trace;
use weft_core::{Doc, DocOptions, Origin, SubscriptionId};

/// Unique identifier for a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Origin attached to transactions applying this peer's updates.
    pub fn origin(&self) -> Origin {
        Origin::new(format!("peer:{}", self.0))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wraps a [`Doc`] and queues an [`SyncMessage::Update`] for every local
/// transaction that changes it. Updates received from other peers are not
/// queued again.
pub struct SyncPeer<P: Protocol = DefaultProtocol> {
    id: PeerId,
    doc: Doc,
    protocol: P,
    outbox: Arc<Mutex<VecDeque<SyncMessage>>>,
    subscription: SubscriptionId,
}

impl SyncPeer<DefaultProtocol> {
    pub fn new(id: PeerId, options: DocOptions) -> Self {
        Self::with_protocol(id, options, DefaultProtocol)
    }
}

impl<P: Protocol> SyncPeer<P> {
    pub fn with_protocol(id: PeerId, options: DocOptions, protocol: P) -> Self {
        let mut doc = Doc::with_options(options);
        let outbox = Arc::new(Mutex::new(VecDeque::new()));
        let sink = outbox.clone();
        let subscription = doc.on_update(move |event| {
            sink.lock().push_back(SyncMessage::Update(event.update.clone()));
        });
        Self {
            id,
            doc,
            protocol,
            outbox,
            subscription,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn doc_mut(&mut self) -> &mut Doc {
        &mut self.doc
    }

    /// Step 1 of a handshake with another peer.
    pub fn start_sync(&self) -> SyncMessage {
        self.protocol.start(&self.doc)
    }

    /// Handle a message from `from`. Returns the reply to send back.
    pub fn receive(&mut self, from: &PeerId, message: SyncMessage) -> Result<Option<SyncMessage>> {
        trace!(peer = %self.id, %from, tag = message.tag(), "received");
        self.protocol.handle(&mut self.doc, message, Some(from.origin()))
    }

    /// Take every queued local update.
    pub fn take_outgoing(&self) -> Vec<SyncMessage> {
        self.outbox.lock().drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outbox.lock().is_empty()
    }

    /// Stop queueing local updates and return the document.
    pub fn into_doc(mut self) -> Doc {
        self.doc.unobserve(self.subscription);
        self.doc
    }
}

impl<P: Protocol> fmt::Debug for SyncPeer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPeer")
            .field("id", &self.id)
            .field("doc", &self.doc)
            .field("outgoing", &self.outbox.lock().len())
            .finish()
    }
}
