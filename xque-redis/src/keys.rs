//! Key layout. All queues share one job table; every queue has its own orderings and sequence.

/// Prefix of every key written by this crate.
pub const NAMESPACE: &str = "xque";

/// Job id to serialized job, shared by all queues.
pub fn jobs() -> String {
    format!("{NAMESPACE}:jobs")
}

/// Ready ordering, scored by priority and sequence.
pub fn ready(queue: &str) -> String {
    format!("{NAMESPACE}:queue:{queue}")
}

/// Pending ordering, scored by visibility deadline.
pub fn pending(queue: &str) -> String {
    format!("{NAMESPACE}:pending:{queue}")
}

pub fn sequence(queue: &str) -> String {
    format!("{NAMESPACE}:seq:{queue}")
}

#[cfg(test)]
mod tests {
    #[test]
    fn layout() {
        assert_eq!(super::jobs(), "xque:jobs");
        assert_eq!(super::ready("mail"), "xque:queue:mail");
        assert_eq!(super::pending("mail"), "xque:pending:mail");
        assert_eq!(super::sequence("mail"), "xque:seq:mail");
    }
}
