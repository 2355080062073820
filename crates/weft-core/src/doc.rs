//! Documents and their configuration.

use crate::block::Item;
use crate::branch::{TypeKind, TypePtr};
use crate::error::Result;
use crate::event::{TypeEvent, UpdateEvent};
use crate::id::{ClientId, StateVector};
use crate::markers::DEFAULT_MARKER_CAPACITY;
use crate::snapshot::Snapshot;
use crate::store::Store;
use crate::transaction::{ReadTxn, TransactionMut};
use crate::types::{ArrayRef, MapRef, SharedRef, TextRef};
use crate::update::{self, Update, UpdateEncoderV2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use ulid::Ulid;

/// Random client id. Kept within 32 bits so ids stay short on the wire.
pub fn generate_client_id() -> ClientId {
    rand::thread_rng().gen::<u32>() as ClientId
}

/// Caller-supplied tag attached to a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin(Arc<str>);

impl Origin {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().into())
    }

    /// An origin no other caller can produce.
    pub fn unique() -> Self {
        Self(Ulid::new().to_string().into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Origin {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Origin {
    fn from(name: String) -> Self {
        Self(name.into())
    }
}

/// Handle returned by observer registration, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Predicate deciding whether a deleted item may be garbage collected.
pub type GcFilter = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// Configuration for a [`Doc`].
#[derive(Clone)]
pub struct DocOptions {
    pub client_id: ClientId,
    pub guid: String,
    /// Discard the content of deleted items at commit.
    pub gc: bool,
    /// Items rejected by the filter keep their content.
    pub gc_filter: Option<GcFilter>,
    /// Search markers kept per sequence type.
    pub marker_capacity: usize,
}

impl Default for DocOptions {
    fn default() -> Self {
        Self {
            client_id: generate_client_id(),
            guid: Ulid::new().to_string(),
            gc: true,
            gc_filter: None,
            marker_capacity: DEFAULT_MARKER_CAPACITY,
        }
    }
}

impl fmt::Debug for DocOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocOptions")
            .field("client_id", &self.client_id)
            .field("guid", &self.guid)
            .field("gc", &self.gc)
            .field("gc_filter", &self.gc_filter.as_ref().map(|_| "<filter>"))
            .field("marker_capacity", &self.marker_capacity)
            .finish()
    }
}

impl DocOptions {
    pub fn builder() -> DocOptionsBuilder {
        DocOptionsBuilder::new()
    }
}

/// Builder for document configuration.
pub struct DocOptionsBuilder {
    options: DocOptions,
}

impl DocOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: DocOptions::default(),
        }
    }

    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.options.client_id = client_id;
        self
    }

    pub fn guid(mut self, guid: impl Into<String>) -> Self {
        self.options.guid = guid.into();
        self
    }

    pub fn gc(mut self, enabled: bool) -> Self {
        self.options.gc = enabled;
        self
    }

    pub fn gc_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Item) -> bool + Send + Sync + 'static,
    {
        self.options.gc_filter = Some(Arc::new(filter));
        self
    }

    pub fn marker_capacity(mut self, capacity: usize) -> Self {
        self.options.marker_capacity = capacity;
        self
    }

    pub fn build(self) -> DocOptions {
        self.options
    }
}

impl Default for DocOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) type ObserveFn = Arc<dyn Fn(&TransactionMut<'_>, &TypeEvent) + Send + Sync>;
pub(crate) type DeepObserveFn = Arc<dyn Fn(&TransactionMut<'_>, &[TypeEvent]) + Send + Sync>;
pub(crate) type UpdateFn = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;
pub(crate) type AfterTransactionFn = Arc<dyn Fn(&mut TransactionMut<'_>) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    pub(crate) shallow: HashMap<TypePtr, Vec<(SubscriptionId, ObserveFn)>>,
    pub(crate) deep: HashMap<TypePtr, Vec<(SubscriptionId, DeepObserveFn)>>,
    pub(crate) update: Vec<(SubscriptionId, UpdateFn)>,
    pub(crate) after_transaction: Vec<(SubscriptionId, AfterTransactionFn)>,
}

impl Observers {
    fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.len();
        for subs in self.shallow.values_mut() {
            subs.retain(|(sub, _)| *sub != id);
        }
        for subs in self.deep.values_mut() {
            subs.retain(|(sub, _)| *sub != id);
        }
        self.shallow.retain(|_, subs| !subs.is_empty());
        self.deep.retain(|_, subs| !subs.is_empty());
        self.update.retain(|(sub, _)| *sub != id);
        self.after_transaction.retain(|(sub, _)| *sub != id);
        self.len() < before
    }

    fn len(&self) -> usize {
        self.shallow.values().map(Vec::len).sum::<usize>()
            + self.deep.values().map(Vec::len).sum::<usize>()
            + self.update.len()
            + self.after_transaction.len()
    }
}

/// A replicated document: a struct store, its root types and the
/// callbacks observing them.
///
/// # Example
///
/// ```rust
/// use weft_core::{Doc, ReadTxn};
///
/// let mut alice = Doc::new();
/// let text = alice.get_text("notes");
/// {
///     let mut txn = alice.transact_mut();
///     text.insert(&mut txn, 0, "hello").unwrap();
/// }
///
/// let mut bob = Doc::new();
/// let update = alice.encode_state_as_update_v2(&bob.state_vector());
/// bob.apply_update_v2(&update).unwrap();
/// assert_eq!(bob.get_text("notes").get_string(&bob), "hello");
/// ```
pub struct Doc {
    pub(crate) client_id: ClientId,
    pub(crate) options: DocOptions,
    pub(crate) store: Store,
    pub(crate) observers: Observers,
}

impl fmt::Debug for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doc")
            .field("client_id", &self.client_id)
            .field("guid", &self.options.guid)
            .field("state", &self.store.state_vector())
            .finish()
    }
}

impl Default for Doc {
    fn default() -> Self {
        Self::new()
    }
}

impl Doc {
    pub fn new() -> Self {
        Self::with_options(DocOptions::default())
    }

    pub fn with_options(options: DocOptions) -> Self {
        Self {
            client_id: options.client_id,
            store: Store::new(options.marker_capacity),
            options,
            observers: Observers::default(),
        }
    }

    /// Client id used for local edits. Changes if a remote update is found
    /// to use the same id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn guid(&self) -> &str {
        &self.options.guid
    }

    pub fn options(&self) -> &DocOptions {
        &self.options
    }

    pub fn transact_mut(&mut self) -> TransactionMut<'_> {
        TransactionMut::new(self, None, true)
    }

    pub fn transact_mut_with(&mut self, origin: impl Into<Origin>) -> TransactionMut<'_> {
        TransactionMut::new(self, Some(origin.into()), true)
    }

    pub fn get_array(&mut self, name: &str) -> ArrayRef {
        ArrayRef::from(self.store.get_or_create_root(name, TypeKind::Array))
    }

    pub fn get_map(&mut self, name: &str) -> MapRef {
        MapRef::from(self.store.get_or_create_root(name, TypeKind::Map))
    }

    pub fn get_text(&mut self, name: &str) -> TextRef {
        TextRef::from(self.store.get_or_create_root(name, TypeKind::Text))
    }

    /// Decode and apply a remote update. Malformed input is rejected before
    /// any state changes.
    pub fn apply_update_v2(&mut self, bytes: &[u8]) -> Result<()> {
        self.apply_update_v2_with(bytes, None)
    }

    pub fn apply_update_v2_with(&mut self, bytes: &[u8], origin: Option<Origin>) -> Result<()> {
        let update = Update::decode_v2(bytes)?;
        self.apply_update(update, origin);
        Ok(())
    }

    pub fn apply_update(&mut self, update: Update, origin: Option<Origin>) {
        debug!(
            blocks = update.block_count(),
            origin = ?origin,
            "applying update"
        );
        let mut txn = TransactionMut::new(self, origin, false);
        txn.apply_update(update);
    }

    /// Call `f` with the event of every transaction that changes `target`.
    pub fn observe<S, F>(&mut self, target: &S, f: F) -> SubscriptionId
    where
        S: SharedRef,
        F: Fn(&TransactionMut<'_>, &TypeEvent) + Send + Sync + 'static,
    {
        let id = self.observers.next_id();
        self.observers
            .shallow
            .entry(target.type_ptr())
            .or_default()
            .push((id, Arc::new(f)));
        id
    }

    /// Call `f` with the events of `target` and all types nested in it,
    /// ordered from the shallowest to the deepest.
    pub fn observe_deep<S, F>(&mut self, target: &S, f: F) -> SubscriptionId
    where
        S: SharedRef,
        F: Fn(&TransactionMut<'_>, &[TypeEvent]) + Send + Sync + 'static,
    {
        let id = self.observers.next_id();
        self.observers
            .deep
            .entry(target.type_ptr())
            .or_default()
            .push((id, Arc::new(f)));
        id
    }

    /// Receive the update produced by every local transaction.
    pub fn on_update<F>(&mut self, f: F) -> SubscriptionId
    where
        F: Fn(&UpdateEvent) + Send + Sync + 'static,
    {
        let id = self.observers.next_id();
        self.observers.update.push((id, Arc::new(f)));
        id
    }

    pub(crate) fn on_after_transaction(&mut self, f: AfterTransactionFn) -> SubscriptionId {
        let id = self.observers.next_id();
        self.observers.after_transaction.push((id, f));
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unobserve(&mut self, id: SubscriptionId) -> bool {
        self.observers.remove(id)
    }

    pub fn snapshot(&self) -> Snapshot {
        ReadTxn::snapshot(self)
    }

    /// Update reproducing the document as it was at `snapshot`.
    pub fn encode_state_from_snapshot(&mut self, snapshot: &Snapshot) -> Result<Vec<u8>> {
        let mut txn = self.transact_mut();
        txn.encode_state_from_snapshot(snapshot)
    }

    /// Blocks and deletions still waiting for missing updates, encoded as
    /// an update so they can be forwarded or persisted.
    pub fn pending_update(&self) -> Option<Vec<u8>> {
        let pending = self.store.pending();
        let pending_ds = self.store.pending_delete_set();
        if pending.is_none() && pending_ds.is_none() {
            return None;
        }
        let mut enc = UpdateEncoderV2::new();
        match pending {
            Some(pending) => update::write_detached_blocks(&mut enc, &pending.blocks, Some(&self.store)),
            None => enc.rest.write_var_u64(0),
        }
        match pending_ds {
            Some(ds) => ds.encode(&mut enc),
            None => enc.rest.write_var_u64(0),
        }
        Some(enc.finish())
    }

    /// State of the remote replica is unknown: everything since `sv`.
    pub fn diff(&self, sv: &StateVector) -> Vec<u8> {
        self.encode_state_as_update_v2(sv)
    }
}
