//! Protected-agent access control.
//!
//! Pure decision functions over caller → target agent pairs. Certain
//! agents only respond to the chief-of-staff (or the root user, who
//! arrives as an empty caller name); everyone else gets a denial with a
//! delegation suggestion. No side effects here; callers log and enforce.

/// The privileged caller identity.
const CHIEF_OF_STAFF: &str = "chief-of-staff";

/// Agents that only respond to chief-of-staff.
pub const DEFAULT_PROTECTED_AGENTS: &[&str] = &[
    "planner",
    "executor",
    "validator",
    "oracle",
    "librarian",
    "explore",
    "interviewer",
    "spec-writer",
    "memory-catcher",
    "workflow-architect",
    "frontend-ui-ux-engineer",
];

/// Outcome of an access-control check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallDecision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Why it was denied.
    pub reason: Option<String>,
    /// What the caller should do instead.
    pub suggestion: Option<String>,
}

impl CallDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            suggestion: None,
        }
    }

    fn deny(target: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(format!(
                "The {target} agent only responds to chief-of-staff."
            )),
            suggestion: Some(format!(
                "Delegate through chief-of-staff instead of calling {target} directly."
            )),
        }
    }
}

/// Whether the caller carries chief-of-staff privilege.
///
/// The empty caller is the root user and is always privileged.
pub fn is_chief_of_staff(caller: &str) -> bool {
    caller.is_empty() || caller == CHIEF_OF_STAFF || caller.contains("chief-of-staff/")
}

/// Whether `name` is on the default protected list, directly or as a
/// hierarchy leaf (`anything/oracle` matches `oracle`).
pub fn is_protected_agent(name: &str) -> bool {
    DEFAULT_PROTECTED_AGENTS
        .iter()
        .any(|p| name == *p || name.ends_with(&format!("/{p}")))
}

/// [`is_protected_agent`] against a configured list.
pub fn is_protected_agent_in(name: &str, protected: &[String]) -> bool {
    protected
        .iter()
        .any(|p| name == p.as_str() || name.ends_with(&format!("/{p}")))
}

/// Whether `name` lives under the internal chief-of-staff hierarchy.
pub fn is_internal_hierarchy(name: &str) -> bool {
    name.contains("chief-of-staff/")
}

/// Decide whether `caller` may invoke `target`.
///
/// Chief-of-staff (and the root user) may call anything. Otherwise a
/// protected target is denied when reached through a custom skill or the
/// internal hierarchy.
pub fn can_call_agent(caller: &str, target: &str, is_custom_skill: bool) -> CallDecision {
    if is_chief_of_staff(caller) {
        return CallDecision::allow();
    }
    if (is_custom_skill || is_internal_hierarchy(target)) && is_protected_agent(target) {
        return CallDecision::deny(target);
    }
    CallDecision::allow()
}

/// [`can_call_agent`] against a configured protected list.
pub fn can_call_agent_with(
    caller: &str,
    target: &str,
    is_custom_skill: bool,
    protected: &[String],
) -> CallDecision {
    if is_chief_of_staff(caller) {
        return CallDecision::allow();
    }
    if (is_custom_skill || is_internal_hierarchy(target))
        && is_protected_agent_in(target, protected)
    {
        return CallDecision::deny(target);
    }
    CallDecision::allow()
}

/// Resolve a requested agent name against the known set.
///
/// Candidate priority: an explicit skill name wins, then an exact match,
/// then the chief-of-staff-hierarchy form of the request.
pub fn resolve_agent(
    requested: &str,
    known_agents: &[String],
    skill_name: Option<&str>,
) -> Option<String> {
    let mut candidates: Vec<String> = Vec::new();
    if let Some(skill) = skill_name {
        candidates.push(skill.to_owned());
    }
    candidates.push(requested.to_owned());
    candidates.push(format!("chief-of-staff/{requested}"));

    candidates
        .into_iter()
        .find(|candidate| known_agents.iter().any(|known| known == candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Identity checks ──

    #[test]
    fn test_chief_of_staff_identities() {
        assert!(is_chief_of_staff("chief-of-staff"));
        assert!(is_chief_of_staff("chief-of-staff/oracle"));
        assert!(is_chief_of_staff(""), "root user is privileged");
        assert!(!is_chief_of_staff("random-worker"));
    }

    #[test]
    fn test_protected_agent_matching() {
        assert!(is_protected_agent("oracle"));
        assert!(is_protected_agent("chief-of-staff/oracle"));
        assert!(is_protected_agent("team/planner"));
        assert!(!is_protected_agent("Code"));
        assert!(!is_protected_agent("oracle-helper"), "suffix must be a path leaf");
    }

    // ── Call decisions ──

    #[test]
    fn test_custom_skill_call_to_protected_denied() {
        let decision = can_call_agent("random-worker", "oracle", true);
        assert!(!decision.allowed);
        assert_eq!(
            decision.reason.as_deref(),
            Some("The oracle agent only responds to chief-of-staff.")
        );
        assert!(decision
            .suggestion
            .as_deref()
            .is_some_and(|s| s.contains("chief-of-staff")));
    }

    #[test]
    fn test_user_calls_native_agent() {
        let decision = can_call_agent("", "Code", false);
        assert!(decision.allowed);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn test_chief_of_staff_bypasses_protection() {
        assert!(can_call_agent("chief-of-staff", "oracle", true).allowed);
        assert!(can_call_agent("chief-of-staff/planner", "executor", true).allowed);
    }

    #[test]
    fn test_internal_hierarchy_target_denied() {
        let decision = can_call_agent("random-worker", "chief-of-staff/oracle", false);
        assert!(!decision.allowed);
    }

    #[test]
    fn test_plain_call_to_protected_without_skill_allowed() {
        // Not a custom skill, not an internal-hierarchy target: allowed.
        let decision = can_call_agent("random-worker", "oracle", false);
        assert!(decision.allowed);
    }

    #[test]
    fn test_decision_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(
                can_call_agent("random-worker", "oracle", true),
                can_call_agent("random-worker", "oracle", true)
            );
        }
    }

    // ── Resolution ──

    #[test]
    fn test_resolve_agent_priority() {
        let known = vec![
            "oracle".to_owned(),
            "chief-of-staff/oracle".to_owned(),
            "special-skill".to_owned(),
        ];

        // Explicit skill outranks everything.
        assert_eq!(
            resolve_agent("oracle", &known, Some("special-skill")).as_deref(),
            Some("special-skill")
        );
        // Exact match beats the hierarchy form.
        assert_eq!(
            resolve_agent("oracle", &known, None).as_deref(),
            Some("oracle")
        );
        // Hierarchy form is the fallback.
        let hierarchy_only = vec!["chief-of-staff/planner".to_owned()];
        assert_eq!(
            resolve_agent("planner", &hierarchy_only, None).as_deref(),
            Some("chief-of-staff/planner")
        );
        assert_eq!(resolve_agent("nobody", &known, None), None);
    }
}
