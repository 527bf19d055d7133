use std::fmt;

pub type ObserverId = u64;

type Callback<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Explicit subscriber list for component state changes.
///
/// Notification is synchronous: every observer has seen the event before the
/// mutating call returns. Callbacks must not call back into the component
/// that owns the list.
pub struct Observers<E> {
    next_id: ObserverId,
    callbacks: Vec<(ObserverId, Callback<E>)>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            callbacks: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, callback: impl Fn(&E) + Send + Sync + 'static) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(candidate, _)| *candidate != id);
        before != self.callbacks.len()
    }

    pub fn notify(&self, event: &E) {
        for (_, callback) in &self.callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.callbacks.len())
            .finish()
    }
}
