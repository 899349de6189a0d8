use std::any::{type_name, Any, TypeId};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};
use rustc_hash::FxHashMap;
use tracing::trace;

/// Application state attached to a channel. `on_detach()` is called when the attachment is
///  replaced, removed, or when the channel closes.
pub trait Attachment: Any + Send + Sync {
    fn on_detach(&self) {}
}

struct Entry {
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
    detach: Box<dyn Fn() + Send + Sync>,
}

/// At most one attachment per type
#[derive(Default)]
pub struct Attachments {
    entries: Mutex<FxHashMap<TypeId, Entry>>,
}

impl Debug for Attachments {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().unwrap();
        f.debug_list()
            .entries(entries.values().map(|e| e.name))
            .finish()
    }
}

impl Attachments {
    /// Attaches a value, detaching and returning a previous attachment of the same type
    pub fn attach<T: Attachment>(&self, value: T) -> Option<Arc<T>> {
        let value = Arc::new(value);
        let for_detach = value.clone();
        let entry = Entry {
            name: type_name::<T>(),
            value: value.clone(),
            detach: Box::new(move || for_detach.on_detach()),
        };

        let previous = self.entries.lock().unwrap()
            .insert(TypeId::of::<T>(), entry);
        trace!(attachment = type_name::<T>(), "attached");
        previous.and_then(Self::detached)
    }

    pub fn get<T: Attachment>(&self) -> Option<Arc<T>> {
        self.entries.lock().unwrap()
            .get(&TypeId::of::<T>())
            .and_then(|e| e.value.clone().downcast::<T>().ok())
    }

    pub fn detach<T: Attachment>(&self) -> Option<Arc<T>> {
        let entry = self.entries.lock().unwrap()
            .remove(&TypeId::of::<T>())?;
        Self::detached(entry)
    }

    /// Detaches everything
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock().unwrap());
        for (_, entry) in entries {
            (entry.detach)();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // called outside the lock, so on_detach() may touch the attachments
    fn detached<T: Attachment>(entry: Entry) -> Option<Arc<T>> {
        (entry.detach)();
        entry.value.downcast::<T>().ok()
    }
}
