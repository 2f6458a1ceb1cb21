//! # inkpad-tabsync — cross-tab coordination for inkpad
//!
//! Lets independent tabs of the same origin keep their local query caches
//! coherent without a shared process and without a server round trip.
//!
//! ```text
//! Tab A                        Tab B                      Tab C
//! ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐
//! │BroadcastRegistry│   │BroadcastRegistry│   │BroadcastRegistry│
//! │ "doc-1" → inval │   │ "doc-1" → inval │   │ "doc-7" → inval │
//! └────────┬────────┘   └────────▲────────┘   └────────▲────────┘
//!          │ trigger("doc-1")    │ invoked             │ ignored
//!          └──────────────► SignalBus ─────────────────┘
//! ```
//!
//! A tab that mutates a shared resource calls `trigger(key)`; every other
//! tab holding a task under the same key runs its handler (typically: drop
//! the cached read so the next access refetches). The triggering tab is
//! never notified of its own trigger. Keys are the only coupling between
//! tabs — there is no cross-tab object sharing, so per-tab state stays
//! crash-isolated.
//!
//! Live coherence only: signals are not logged or replayed, so a tab opened
//! after a trigger will not retroactively receive it.

pub mod registry;
pub mod signal;

// Re-exports for convenience
pub use registry::{BroadcastRegistry, RegistryStats, TaskHandler};
pub use signal::{Signal, SignalBus};
