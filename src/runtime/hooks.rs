/// Outcome of an awaited step that can be interrupted by shutdown signals.
pub(crate) enum HookDecision<T> {
    Finished(T),
    Cancelled,
}
