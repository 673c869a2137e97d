use crate::core::{FieldMap, Result, RowId, SubscriberId, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Kinds of events an entity can announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DataChanged,
    IdChanged,
    Deleted,
    Committed,
    Rollback,
    Destroyed,
}

/// An announced event together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    DataChanged {
        field: String,
        new: Value,
        old: Value,
    },
    IdChanged {
        new: Value,
        old: Value,
    },
    Deleted {
        row_id: Option<RowId>,
    },
    Committed(FieldMap),
    Rollback(FieldMap),
    Destroyed,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::DataChanged { .. } => EventKind::DataChanged,
            Self::IdChanged { .. } => EventKind::IdChanged,
            Self::Deleted { .. } => EventKind::Deleted,
            Self::Committed(_) => EventKind::Committed,
            Self::Rollback(_) => EventKind::Rollback,
            Self::Destroyed => EventKind::Destroyed,
        }
    }
}

/// Callback invoked on announcement. Extra arguments are captured by the closure.
pub type Handler = Rc<dyn Fn(&Event) -> Result<()>>;

struct Subscription {
    kind: EventKind,
    subscriber: SubscriberId,
    handler: Handler,
}

/// Subscription list of a single announceable instance.
#[derive(Default)]
pub struct Announcer {
    subscriptions: RefCell<Vec<Subscription>>,
}

impl Announcer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind` on behalf of `subscriber`.
    ///
    /// A second registration for the same `(kind, subscriber)` pair replaces
    /// the first one and keeps its position in the dispatch order.
    pub fn subscribe(&self, kind: EventKind, subscriber: SubscriberId, handler: Handler) {
        let mut subscriptions = self.subscriptions.borrow_mut();
        match subscriptions
            .iter_mut()
            .find(|s| s.kind == kind && s.subscriber == subscriber)
        {
            Some(existing) => existing.handler = handler,
            None => subscriptions.push(Subscription {
                kind,
                subscriber,
                handler,
            }),
        }
    }

    /// Returns `true` if a registration was removed.
    pub fn unsubscribe(&self, kind: EventKind, subscriber: SubscriberId) -> bool {
        let mut subscriptions = self.subscriptions.borrow_mut();
        let before = subscriptions.len();
        subscriptions.retain(|s| !(s.kind == kind && s.subscriber == subscriber));
        subscriptions.len() != before
    }

    /// Drops every registration held by `subscriber`, whatever its kind.
    pub fn unsubscribe_all(&self, subscriber: SubscriberId) {
        self.subscriptions
            .borrow_mut()
            .retain(|s| s.subscriber != subscriber);
    }

    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        self.subscriptions.borrow().iter().any(|s| s.kind == kind)
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .borrow()
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Dispatches `event` to every subscriber of its kind.
    ///
    /// The subscription list is not borrowed while a handler runs, so handlers
    /// are free to (un)subscribe and to trigger nested announcements. A
    /// subscriber removed mid-dispatch is skipped; one added mid-dispatch is
    /// not called for this event. The first handler error stops dispatch and
    /// is returned.
    pub fn announce(&self, event: &Event) -> Result<()> {
        let kind = event.kind();
        let subscribers: Vec<SubscriberId> = self
            .subscriptions
            .borrow()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.subscriber)
            .collect();

        for subscriber in subscribers {
            let handler = self
                .subscriptions
                .borrow()
                .iter()
                .find(|s| s.kind == kind && s.subscriber == subscriber)
                .map(|s| Rc::clone(&s.handler));

            if let Some(handler) = handler {
                handler(event)?;
            }
        }
        Ok(())
    }
}

/// Anything that owns an [`Announcer`] can be subscribed to.
pub trait Announceable {
    fn announcer(&self) -> &Announcer;

    fn subscribe(&self, kind: EventKind, subscriber: SubscriberId, handler: Handler) {
        self.announcer().subscribe(kind, subscriber, handler);
    }

    fn unsubscribe(&self, kind: EventKind, subscriber: SubscriberId) -> bool {
        self.announcer().unsubscribe(kind, subscriber)
    }

    fn announce(&self, event: &Event) -> Result<()> {
        self.announcer().announce(event)
    }

    fn has_subscribers(&self, kind: EventKind) -> bool {
        self.announcer().has_subscribers(kind)
    }
}

impl Announceable for Announcer {
    fn announcer(&self) -> &Announcer {
        self
    }
}
