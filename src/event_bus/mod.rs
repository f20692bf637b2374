//! Event bus utilities providing fan-out, sinks, and subscriber APIs.
//!
//! The module is organised around a broadcast-based [`EventHub`] and helpers for
//! configuring sinks (`EventBus`) and consuming the resulting [`EventStream`].
//! Every control-plane service (hierarchy, state machine, session registry,
//! task manager, rate limiter, dashboard, ...) publishes through one shared
//! hub, so a listener subscribes once and observes every component.

pub mod bus;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod sink;

pub use bus::EventBus;
pub use emitter::{EmitterError, EventEmitter};
pub use event::{
    ComplexityEvent, ConflictEvent, DashboardEvent, DelegationEvent, Event, FeatureFlagEvent,
    HierarchyEvent, PlanEvent, RateLimitEvent, SessionEvent, StateMachineEvent, TaskEvent,
    TimestampedEvent,
};
pub use hub::{BlockingEventIter, EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};
