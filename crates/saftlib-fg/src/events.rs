use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Handler lists keyed by event kind. Handlers run synchronously, in the
/// order they subscribed; a handler may subscribe further handlers, which
/// take effect from the next emission.
pub(crate) struct Subscribers<K, E: ?Sized> {
    lists: RefCell<BTreeMap<K, Vec<Rc<dyn Fn(&E)>>>>,
}

impl<K: Ord, E: ?Sized> Default for Subscribers<K, E> {
    fn default() -> Self {
        Self {
            lists: RefCell::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord, E: ?Sized> Subscribers<K, E> {
    pub(crate) fn subscribe(&self, kind: K, handler: Rc<dyn Fn(&E)>) {
        self.lists.borrow_mut().entry(kind).or_default().push(handler);
    }

    pub(crate) fn emit(&self, kind: &K, event: &E) {
        let handlers = match self.lists.borrow().get(kind) {
            Some(list) => list.clone(),
            None => return,
        };
        for handler in handlers {
            handler(event);
        }
    }
}
