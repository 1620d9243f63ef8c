/// Why an `enqueue` call is happening: a brand-new message, a
/// bookkeeping-updating requeue, or a bookkeeping-preserving silent
/// requeue. Adapters dispatch on this rather than inheriting from a
/// common base type; see spec.md §9's note that the systems-language
/// equivalent of the source's inheritance hierarchy is "a small
/// embedded helper struct rather than an abstract parent".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueKind {
    New,
    Requeue,
    RequeueSilent,
}

/// Shared ephemeral-storage policy embedded by value in every
/// reliability-offering adapter.
#[derive(Debug, Clone, Copy)]
pub struct EphemeralPolicy {
    pub disabled: bool,
    pub max_size: Option<usize>,
}

impl EphemeralPolicy {
    pub fn new(disabled: bool, max_size: Option<usize>) -> Self {
        Self { disabled, max_size }
    }

    pub fn enabled() -> Self {
        Self::new(false, None)
    }

    pub fn disabled() -> Self {
        Self::new(true, None)
    }

    /// When ephemeral storage is disabled, every enqueue collapses to
    /// the new-message path regardless of the caller's stated reason
    /// (spec.md §4.6).
    pub fn resolve_kind(&self, requested: EnqueueKind) -> EnqueueKind {
        if self.disabled {
            EnqueueKind::New
        } else {
            requested
        }
    }

    /// True if `take` should short-circuit to "queue empty" because
    /// the ephemeral cap has been reached (spec.md §4.1 backpressure).
    pub fn is_at_capacity(&self, current_ephemeral_size: usize) -> bool {
        !self.disabled
            && self
                .max_size
                .is_some_and(|cap| cap > 0 && current_ephemeral_size >= cap)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_policy_collapses_to_new() {
        let policy = EphemeralPolicy::disabled();
        assert_eq!(policy.resolve_kind(EnqueueKind::Requeue), EnqueueKind::New);
        assert_eq!(
            policy.resolve_kind(EnqueueKind::RequeueSilent),
            EnqueueKind::New
        );
    }

    #[test]
    fn enabled_policy_passes_kind_through() {
        let policy = EphemeralPolicy::enabled();
        assert_eq!(policy.resolve_kind(EnqueueKind::Requeue), EnqueueKind::Requeue);
    }

    #[test]
    fn capacity_enforced_only_when_positive_and_enabled() {
        let unbounded = EphemeralPolicy::new(false, None);
        assert!(!unbounded.is_at_capacity(1_000_000));

        let capped = EphemeralPolicy::new(false, Some(2));
        assert!(!capped.is_at_capacity(1));
        assert!(capped.is_at_capacity(2));
        assert!(capped.is_at_capacity(3));

        let disabled = EphemeralPolicy::new(true, Some(2));
        assert!(!disabled.is_at_capacity(5));
    }
}
