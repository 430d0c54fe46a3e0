//! Deny-list policy for commands.
//!
//! A heuristic filter applied before spawning, not an isolation boundary.
//! The predicates are pure so audits can call them without executing anything.

/// Literal substrings that are always rejected (matched case-insensitively).
pub const DENY_LIST: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "dd if=/dev/zero",
    "mkfs",
    "> /dev/sda",
    ":(){ :|:& };:",
    "chmod -r 777 /",
    "mv /* /dev/null",
    "wget -o- | sh",
    "curl | sh",
    "sudo rm",
    "sudo mv",
    "sudo dd",
    "sudo mkfs",
];

/// Verbs that make a privileged invocation destructive.
const DESTRUCTIVE_VERBS: &[&str] = &["rm", "mv", "dd", "mkfs"];

/// Rule names reported for the heuristic matches.
pub const RULE_RECURSIVE_REMOVE: &str = "recursive force-remove with root or glob target";
pub const RULE_PRIVILEGED_DESTRUCTIVE: &str = "privileged invocation of a destructive verb";

/// Returns the rule a command violates, if any.
pub fn check(command: &str) -> Option<&'static str> {
    let lowered = command.to_lowercase();

    if let Some(entry) = DENY_LIST.iter().copied().find(|entry| lowered.contains(entry)) {
        return Some(entry);
    }

    if lowered.contains("rm -rf") && (lowered.contains('/') || lowered.contains('*')) {
        return Some(RULE_RECURSIVE_REMOVE);
    }

    if lowered.contains("sudo") && DESTRUCTIVE_VERBS.iter().any(|verb| lowered.contains(verb)) {
        return Some(RULE_PRIVILEGED_DESTRUCTIVE);
    }

    None
}

/// Whether the command matches the deny-list.
pub fn is_dangerous(command: &str) -> bool {
    check(command).is_some()
}
