//! Core trait for state machines.

use std::time::Duration;

/// A state machine that processes events.
///
/// This is the core abstraction for both the notary commit protocol and the
/// flow transition engine. All protocol logic is implemented as state
/// machines that are:
///
/// - **Synchronous**: No async, no `.await`
/// - **Deterministic**: Same state + event = same actions
/// - **Pure-ish**: Mutates self, but performs no I/O
///
/// The notary and flow machines have different event and action vocabularies,
/// so the types are associated rather than fixed.
///
/// # Example
///
/// ```ignore
/// impl StateMachine for NotaryProtocol {
///     type Event = NotaryEvent;
///     type Action = NotaryAction;
///
///     fn handle(&mut self, event: NotaryEvent) -> Vec<NotaryAction> {
///         match event {
///             NotaryEvent::RequestReceived { request_id, request } => {
///                 self.on_request(request_id, request)
///             }
///             // ... etc
///         }
///     }
///
///     fn set_time(&mut self, now: Duration) {
///         self.now = now;
///     }
/// }
/// ```
pub trait StateMachine {
    /// Events this machine consumes.
    type Event;
    /// Actions this machine emits for the runner to execute.
    type Action;

    /// Process an event, returning actions to perform.
    ///
    /// # Guarantees
    ///
    /// - **Synchronous**: This method never blocks or awaits
    /// - **Deterministic**: Given the same state and event, always returns the same actions
    /// - **No I/O**: All I/O is performed by the runner via the returned actions
    /// - **Ordered**: Actions must be executed in the order returned; in
    ///   particular, a checkpoint-persistence action always precedes any
    ///   action with an externally observable side effect derived from the
    ///   same transition
    fn handle(&mut self, event: Self::Event) -> Vec<Self::Action>;

    /// Set the current time.
    ///
    /// Called by the runner before each `handle()` call to provide the
    /// current wall-clock (or simulated) time as a duration since the Unix
    /// epoch.
    fn set_time(&mut self, now: Duration);

    /// Get the current time.
    ///
    /// Returns the time that was last set via `set_time()`.
    fn now(&self) -> Duration;
}
