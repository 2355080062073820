//! Undo/Redo for shared types.
//!
//! An [`UndoManager`] watches committed transactions that touch its scope
//! and records them as stack items: the delete set of the transaction plus
//! the state before and after it. Undoing a stack item deletes what it
//! inserted and re-creates what it deleted, so the reverted state is itself
//! an ordinary change that replicates to every peer.
//!
//! - Only transactions whose origin is tracked are recorded.
//! - Changes committed within the capture timeout of each other are grouped
//!   into one stack item.
//! - Items deleted by a recorded transaction are protected from garbage
//!   collection until the manager is cleared.

use crate::block::{BlockPtr, Item};
use crate::branch::TypePtr;
use crate::delete_set::DeleteSet;
use crate::doc::{Doc, Origin, SubscriptionId};
use crate::id::{StateVector, ID};
use crate::store::Store;
use crate::transaction::TransactionMut;
use crate::types::SharedRef;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Decides whether undo may delete an item it would otherwise remove.
pub type DeleteFilter = Arc<dyn Fn(&Item) -> bool + Send + Sync>;

/// Default grouping window for consecutive changes.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for an [`UndoManager`].
#[derive(Clone)]
pub struct UndoOptions {
    /// Changes closer together than this are undone as one step.
    pub capture_timeout: Duration,
    /// Origins whose transactions are recorded. `None` stands for local
    /// transactions started without an origin.
    pub tracked_origins: HashSet<Option<Origin>>,
    pub delete_filter: Option<DeleteFilter>,
}

impl Default for UndoOptions {
    fn default() -> Self {
        Self {
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            tracked_origins: HashSet::from([None]),
            delete_filter: None,
        }
    }
}

impl fmt::Debug for UndoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoOptions")
            .field("capture_timeout", &self.capture_timeout)
            .field("tracked_origins", &self.tracked_origins)
            .field("delete_filter", &self.delete_filter.is_some())
            .finish()
    }
}

/// One undoable step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackItem {
    pub delete_set: DeleteSet,
    pub before_state: StateVector,
    pub after_state: StateVector,
}

impl StackItem {
    /// Ranges of items created by this step.
    fn insertions(&self) -> DeleteSet {
        let mut ranges = DeleteSet::new();
        for (client, end) in self.after_state.iter() {
            let start = self.before_state.get(client);
            if end > start {
                ranges.push(ID::new(client, start), end - start);
            }
        }
        ranges
    }

    fn created(&self, id: &ID) -> bool {
        id.clock >= self.before_state.get(id.client) && id.clock < self.after_state.get(id.client)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StackKind {
    Undo,
    Redo,
}

struct UndoState {
    scope: HashSet<TypePtr>,
    options: UndoOptions,
    origin: Origin,
    undo_stack: Vec<StackItem>,
    redo_stack: Vec<StackItem>,
    undoing: bool,
    redoing: bool,
    last_change: Option<Instant>,
}

impl UndoState {
    fn in_scope(&self, store: &Store, item: &Item) -> bool {
        item.parent_type()
            .is_some_and(|parent| self.scope.iter().any(|s| store.is_descendant_of(parent, *s)))
    }

    fn is_tracked(&self, txn: &TransactionMut<'_>) -> bool {
        let origin = txn.origin().cloned();
        if origin.is_none() && !txn.is_local() {
            return false;
        }
        self.options.tracked_origins.contains(&origin)
    }

    /// Record a committed transaction.
    fn capture(&mut self, txn: &mut TransactionMut<'_>) {
        if !self.is_tracked(txn) || !self.scope.iter().any(|s| txn.changed_parent_types().contains(s)) {
            return;
        }
        let (undoing, redoing) = (self.undoing, self.redoing);
        if undoing {
            self.last_change = None;
        } else if !redoing {
            self.redo_stack.clear();
        }
        let now = Instant::now();
        let within_timeout = self
            .last_change
            .is_some_and(|last| now.duration_since(last) < self.options.capture_timeout);
        let stack = if undoing {
            &mut self.redo_stack
        } else {
            &mut self.undo_stack
        };
        match stack.last_mut() {
            Some(last) if within_timeout && !undoing && !redoing => {
                last.delete_set.merge(txn.delete_set());
                last.after_state = txn.after_state().clone();
            }
            _ => stack.push(StackItem {
                delete_set: txn.delete_set().clone(),
                before_state: txn.before_state().clone(),
                after_state: txn.after_state().clone(),
            }),
        }
        if !undoing && !redoing {
            self.last_change = Some(now);
        }

        let deleted = txn.delete_set().clone();
        let mut protect = Vec::new();
        txn.iterate_deleted_structs(&deleted, |store, ptr| {
            if let Some(item) = store.block(ptr).as_item() {
                if self.in_scope(store, item) {
                    protect.push(ptr);
                }
            }
            true
        });
        for ptr in protect {
            txn.keep_item(ptr, true);
        }
    }
}

/// Undo/redo stacks over a set of shared types.
///
/// The manager registers a hook on the document; call
/// [`destroy`](UndoManager::destroy) to remove it.
///
/// # Example
///
/// ```rust
/// use weft_core::{Doc, UndoManager};
///
/// let mut doc = Doc::new();
/// let text = doc.get_text("notes");
/// let undo = UndoManager::new(&mut doc, &text);
/// {
///     let mut txn = doc.transact_mut();
///     text.insert(&mut txn, 0, "hello").unwrap();
/// }
/// assert!(undo.undo(&mut doc));
/// assert_eq!(text.get_string(&doc), "");
/// assert!(undo.redo(&mut doc));
/// assert_eq!(text.get_string(&doc), "hello");
/// ```
pub struct UndoManager {
    state: Arc<Mutex<UndoState>>,
    subscription: SubscriptionId,
}

impl fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UndoManager")
            .field("scope", &state.scope)
            .field("undo_stack", &state.undo_stack.len())
            .field("redo_stack", &state.redo_stack.len())
            .finish()
    }
}

impl UndoManager {
    pub fn new<S: SharedRef>(doc: &mut Doc, scope: &S) -> Self {
        Self::with_options(doc, scope, UndoOptions::default())
    }

    pub fn with_options<S: SharedRef>(doc: &mut Doc, scope: &S, options: UndoOptions) -> Self {
        let origin = Origin::unique();
        let mut options = options;
        options.tracked_origins.insert(Some(origin.clone()));
        let state = Arc::new(Mutex::new(UndoState {
            scope: HashSet::from([scope.type_ptr()]),
            options,
            origin,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            undoing: false,
            redoing: false,
            last_change: None,
        }));
        let hook_state = state.clone();
        let subscription = doc.on_after_transaction(Arc::new(move |txn: &mut TransactionMut<'_>| {
            hook_state.lock().capture(txn);
        }));
        Self {
            state,
            subscription,
        }
    }

    /// Origin attached to the transactions this manager performs.
    pub fn origin(&self) -> Origin {
        self.state.lock().origin.clone()
    }

    /// Also record changes to `scope`.
    pub fn expand_scope<S: SharedRef>(&self, scope: &S) {
        self.state.lock().scope.insert(scope.type_ptr());
    }

    pub fn add_tracked_origin(&self, origin: impl Into<Origin>) {
        self.state.lock().options.tracked_origins.insert(Some(origin.into()));
    }

    pub fn remove_tracked_origin(&self, origin: &Origin) {
        self.state
            .lock()
            .options
            .tracked_origins
            .remove(&Some(origin.clone()));
    }

    /// Start a new stack item with the next change even if it falls within
    /// the capture timeout.
    pub fn stop_capturing(&self) {
        self.state.lock().last_change = None;
    }

    pub fn can_undo(&self) -> bool {
        !self.state.lock().undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.state.lock().redo_stack.is_empty()
    }

    pub fn undo_stack_size(&self) -> usize {
        self.state.lock().undo_stack.len()
    }

    pub fn redo_stack_size(&self) -> usize {
        self.state.lock().redo_stack.len()
    }

    /// Revert the most recent stack item. Returns `false` if nothing could
    /// be undone.
    pub fn undo(&self, doc: &mut Doc) -> bool {
        self.state.lock().undoing = true;
        let done = self.pop_stack_item(doc, StackKind::Undo);
        self.state.lock().undoing = false;
        done
    }

    /// Reapply the most recently undone stack item.
    pub fn redo(&self, doc: &mut Doc) -> bool {
        self.state.lock().redoing = true;
        let done = self.pop_stack_item(doc, StackKind::Redo);
        self.state.lock().redoing = false;
        done
    }

    /// Drop both stacks and release the items they protected from garbage
    /// collection.
    pub fn clear(&self, doc: &mut Doc) {
        let (items, scope) = {
            let mut state = self.state.lock();
            let mut items = std::mem::take(&mut state.undo_stack);
            items.append(&mut state.redo_stack);
            (items, state.scope.clone())
        };
        let mut txn = doc.transact_mut();
        for stack_item in &items {
            let mut release = Vec::new();
            txn.iterate_deleted_structs(&stack_item.delete_set, |store, ptr| {
                if let Some(item) = store.block(ptr).as_item() {
                    if item_in_scope(store, item, &scope) {
                        release.push(ptr);
                    }
                }
                true
            });
            for ptr in release {
                txn.keep_item(ptr, false);
            }
        }
        debug!(items = items.len(), "cleared undo history");
    }

    /// Unregister from `doc`. The stacks are discarded.
    pub fn destroy(self, doc: &mut Doc) {
        self.clear(doc);
        doc.unobserve(self.subscription);
    }

    fn pop_stack_item(&self, doc: &mut Doc, kind: StackKind) -> bool {
        let (origin, scope, delete_filter) = {
            let state = self.state.lock();
            (
                state.origin.clone(),
                state.scope.clone(),
                state.options.delete_filter.clone(),
            )
        };
        let mut txn = doc.transact_mut_with(origin);
        let mut performed = false;
        while !performed {
            let popped = {
                let mut state = self.state.lock();
                match kind {
                    StackKind::Undo => state.undo_stack.pop(),
                    StackKind::Redo => state.redo_stack.pop(),
                }
            };
            let Some(stack_item) = popped else {
                break;
            };
            performed = revert(&mut txn, &stack_item, &scope, delete_filter.as_ref());
        }
        // undo bypasses the index-based edit paths, so cached positions are stale
        for (ty, keys) in &txn.changed {
            if keys.contains(&None) {
                if let Some(branch) = txn.doc.store.branch(*ty) {
                    branch.clear_markers();
                }
            }
        }
        debug!(?kind, performed, "popped stack item");
        performed
    }
}

fn item_in_scope(store: &Store, item: &Item, scope: &HashSet<TypePtr>) -> bool {
    item.parent_type()
        .is_some_and(|parent| scope.iter().any(|s| store.is_descendant_of(parent, *s)))
}

/// Latest incarnation of `ptr`, split so that it covers no more than `len`
/// elements.
fn follow_redone(txn: &mut TransactionMut<'_>, mut ptr: BlockPtr) -> BlockPtr {
    loop {
        let Some(item) = txn.doc.store.block(ptr).as_item() else {
            return ptr;
        };
        let (Some(redone), len) = (item.redone, item.len) else {
            return ptr;
        };
        let Some(next) = txn.get_item_clean_start(&redone) else {
            return ptr;
        };
        if txn.doc.store.block(next).len() > len {
            txn.get_item_clean_start(&ID::new(redone.client, redone.clock + len));
        }
        ptr = next;
    }
}

/// Delete what `stack_item` inserted and restore what it deleted. Returns
/// whether the document changed.
fn revert(
    txn: &mut TransactionMut<'_>,
    stack_item: &StackItem,
    scope: &HashSet<TypePtr>,
    delete_filter: Option<&DeleteFilter>,
) -> bool {
    let mut inserted = Vec::new();
    txn.iterate_deleted_structs(&stack_item.insertions(), |store, ptr| {
        if store.block(ptr).as_item().is_some() {
            inserted.push(ptr);
        }
        true
    });
    let mut to_delete = Vec::new();
    for ptr in inserted {
        let ptr = follow_redone(txn, ptr);
        let store = &txn.doc.store;
        if let Some(item) = store.block(ptr).as_item() {
            if !item.is_deleted() && item_in_scope(store, item, scope) {
                to_delete.push(ptr);
            }
        }
    }

    let mut to_redo = Vec::new();
    txn.iterate_deleted_structs(&stack_item.delete_set, |store, ptr| {
        if let Some(item) = store.block(ptr).as_item() {
            if item_in_scope(store, item, scope) && !stack_item.created(&item.id) {
                to_redo.push(ptr);
            }
        }
        true
    });
    let redo_set: HashSet<BlockPtr> = to_redo.iter().copied().collect();

    let mut performed = false;
    for ptr in to_redo {
        match txn.redo_item(ptr, &redo_set) {
            Ok(Some(_)) => performed = true,
            Ok(None) => {}
            Err(err) => warn!(%err, "skipping item that cannot be restored"),
        }
    }
    for ptr in to_delete.into_iter().rev() {
        let allowed = match (delete_filter, txn.doc.store.block(ptr).as_item()) {
            (Some(filter), Some(item)) => filter(item),
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if allowed && txn.delete_item(ptr) {
            performed = true;
        }
    }
    performed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::DocOptions;
    use crate::transaction::ReadTxn;
    use crate::types::{In, Value};

    fn doc(client: u64) -> Doc {
        Doc::with_options(DocOptions::builder().client_id(client).build())
    }

    fn separate_steps() -> UndoOptions {
        UndoOptions {
            capture_timeout: Duration::ZERO,
            ..UndoOptions::default()
        }
    }

    #[test]
    fn test_undo_redo_insert() {
        let mut d = doc(1);
        let text = d.get_text("t");
        let undo = UndoManager::with_options(&mut d, &text, separate_steps());
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "abc").unwrap();
        }
        {
            let mut txn = d.transact_mut();
            text.push(&mut txn, "def").unwrap();
        }
        assert_eq!(undo.undo_stack_size(), 2);

        assert!(undo.undo(&mut d));
        assert_eq!(text.get_string(&d), "abc");
        assert!(undo.undo(&mut d));
        assert_eq!(text.get_string(&d), "");
        assert!(!undo.undo(&mut d));

        assert!(undo.redo(&mut d));
        assert_eq!(text.get_string(&d), "abc");
        assert!(undo.redo(&mut d));
        assert_eq!(text.get_string(&d), "abcdef");
        assert!(!undo.can_redo());
    }

    #[test]
    fn test_changes_within_timeout_are_grouped() {
        let mut d = doc(1);
        let list = d.get_array("list");
        let undo = UndoManager::with_options(
            &mut d,
            &list,
            UndoOptions {
                capture_timeout: Duration::from_secs(3600),
                ..UndoOptions::default()
            },
        );
        for value in 1..=3 {
            let mut txn = d.transact_mut();
            list.push_back(&mut txn, value).unwrap();
        }
        assert_eq!(undo.undo_stack_size(), 1);
        undo.stop_capturing();
        {
            let mut txn = d.transact_mut();
            list.push_back(&mut txn, 4).unwrap();
        }
        assert_eq!(undo.undo_stack_size(), 2);

        undo.undo(&mut d);
        assert_eq!(list.len(&d), 3);
        undo.undo(&mut d);
        assert_eq!(list.len(&d), 0);
    }

    #[test]
    fn test_undo_delete_restores_content() {
        let mut d = doc(1);
        let text = d.get_text("t");
        let undo = UndoManager::with_options(&mut d, &text, separate_steps());
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "hello world").unwrap();
        }
        {
            let mut txn = d.transact_mut();
            text.remove_range(&mut txn, 5, 6).unwrap();
        }
        assert_eq!(text.get_string(&d), "hello");
        undo.undo(&mut d);
        assert_eq!(text.get_string(&d), "hello world");
        undo.redo(&mut d);
        assert_eq!(text.get_string(&d), "hello");
        d.store().integrity_check().unwrap();
    }

    #[test]
    fn test_untracked_origin_is_not_recorded() {
        let mut d = doc(1);
        let list = d.get_array("list");
        let undo = UndoManager::new(&mut d, &list);
        {
            let mut txn = d.transact_mut_with("importer");
            list.push_back(&mut txn, 1).unwrap();
        }
        assert!(!undo.can_undo());

        undo.add_tracked_origin("importer");
        {
            let mut txn = d.transact_mut_with("importer");
            list.push_back(&mut txn, 2).unwrap();
        }
        assert!(undo.can_undo());
    }

    #[test]
    fn test_changes_outside_scope_are_ignored() {
        let mut d = doc(1);
        let tracked = d.get_array("tracked");
        let other = d.get_array("other");
        let undo = UndoManager::new(&mut d, &tracked);
        {
            let mut txn = d.transact_mut();
            other.push_back(&mut txn, 1).unwrap();
        }
        assert!(!undo.can_undo());
        undo.expand_scope(&other);
        {
            let mut txn = d.transact_mut();
            other.push_back(&mut txn, 2).unwrap();
        }
        assert!(undo.undo(&mut d));
        assert_eq!(other.to_vec(&d), vec![Value::from(1)]);
    }

    #[test]
    fn test_undo_leaves_remote_changes() {
        let mut a = doc(1);
        let mut b = doc(2);
        let text_a = a.get_text("t");
        let text_b = b.get_text("t");
        let undo = UndoManager::new(&mut a, &text_a);
        {
            let mut txn = a.transact_mut();
            text_a.insert(&mut txn, 0, "local").unwrap();
        }
        b.apply_update_v2(&a.encode_state_as_update_v2(&b.state_vector()))
            .unwrap();
        {
            let mut txn = b.transact_mut();
            text_b.push(&mut txn, " remote").unwrap();
        }
        a.apply_update_v2(&b.encode_state_as_update_v2(&a.state_vector()))
            .unwrap();
        assert_eq!(undo.undo_stack_size(), 1);

        undo.undo(&mut a);
        assert_eq!(text_a.get_string(&a), " remote");

        b.apply_update_v2(&a.encode_state_as_update_v2(&b.state_vector()))
            .unwrap();
        assert_eq!(text_b.get_string(&b), " remote");
    }

    #[test]
    fn test_undo_map_overwrite() {
        let mut d = doc(1);
        let map = d.get_map("m");
        let undo = UndoManager::with_options(&mut d, &map, separate_steps());
        {
            let mut txn = d.transact_mut();
            map.insert(&mut txn, "k", 1);
        }
        {
            let mut txn = d.transact_mut();
            map.insert(&mut txn, "k", 2);
        }
        undo.undo(&mut d);
        assert_eq!(map.get(&d, "k"), Some(Value::from(1)));
        undo.undo(&mut d);
        assert_eq!(map.get(&d, "k"), None);
        undo.redo(&mut d);
        assert_eq!(map.get(&d, "k"), Some(Value::from(1)));
    }

    #[test]
    fn test_undo_restores_nested_type() {
        let mut d = doc(1);
        let map = d.get_map("m");
        let undo = UndoManager::with_options(&mut d, &map, separate_steps());
        {
            let mut txn = d.transact_mut();
            map.insert(&mut txn, "list", In::Array(vec![In::from(1), In::from(2)]));
        }
        {
            let mut txn = d.transact_mut();
            map.remove(&mut txn, "list");
        }
        assert!(!map.contains_key(&d, "list"));

        undo.undo(&mut d);
        let restored = map.get(&d, "list").and_then(Value::into_array).unwrap();
        assert_eq!(restored.to_vec(&d), vec![Value::from(1), Value::from(2)]);
    }

    #[test]
    fn test_deleted_items_survive_gc_until_cleared() {
        let mut d = doc(1);
        let text = d.get_text("t");
        let undo = UndoManager::with_options(&mut d, &text, separate_steps());
        {
            let mut txn = d.transact_mut();
            text.insert(&mut txn, 0, "abc").unwrap();
        }
        {
            let mut txn = d.transact_mut();
            text.remove_range(&mut txn, 0, 3).unwrap();
        }
        let ptr = d.store().blocks_of(1)[0];
        assert!(d.store().item(ptr).is_keep());

        undo.clear(&mut d);
        assert!(!undo.can_undo());
        assert!(!d.store().item(ptr).is_keep());
    }

    #[test]
    fn test_delete_filter_blocks_removal() {
        let mut d = doc(1);
        let list = d.get_array("list");
        let undo = UndoManager::with_options(
            &mut d,
            &list,
            UndoOptions {
                delete_filter: Some(Arc::new(|_| false)),
                ..separate_steps()
            },
        );
        {
            let mut txn = d.transact_mut();
            list.push_back(&mut txn, 1).unwrap();
        }
        assert!(!undo.undo(&mut d));
        assert_eq!(list.len(&d), 1);
    }

    #[test]
    fn test_destroy_unregisters_hook() {
        let mut d = doc(1);
        let list = d.get_array("list");
        let undo = UndoManager::new(&mut d, &list);
        let state = undo.state.clone();
        undo.destroy(&mut d);
        {
            let mut txn = d.transact_mut();
            list.push_back(&mut txn, 1).unwrap();
        }
        assert!(state.lock().undo_stack.is_empty());
    }
}
