// ============================================================================
// Event Announcer Module
// ============================================================================
//
// Per-instance synchronous publish/subscribe.
//
// An object owns an `Announcer`; other objects subscribe to event kinds on
// that specific instance. `announce` is a plain nested call: every matching
// handler runs, in subscription order, before it returns. Handlers may
// announce further events, which complete depth-first.
//
// ============================================================================

pub mod announcer;

pub use announcer::{Announceable, Announcer, Event, EventKind, Handler};
