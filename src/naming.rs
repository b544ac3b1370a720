//! Pure, deterministic naming/namespace derivation (§4.B). No I/O.

use sha2::{Digest, Sha256};

const NAMESPACE_PREFIX: &str = "platform--";
const MAX_NAMESPACE_LEN: usize = 63;
const HASH_LEN: usize = 24;

/// `platform--<org>--<project>--<hash24>` where `hash24` is the first 24
/// hex chars of SHA-256(`<org>--<project>`), with `org`/`project` truncated
/// proportionally (each keeping >= 1 char) if the full name would exceed 63
/// chars.
pub fn generate_namespace_name(org: &str, project: &str) -> String {
    let full_key = format!("{org}--{project}");
    let hash_hex = hex::encode(Sha256::digest(full_key.as_bytes()));
    let hash_suffix = &hash_hex[..HASH_LEN];

    // "platform--" + org + "--" + project + "--" + hash24
    let fixed_len = NAMESPACE_PREFIX.len() + "--".len() * 2 + HASH_LEN;
    let budget = MAX_NAMESPACE_LEN.saturating_sub(fixed_len);

    let (org, project) = if org.len() + project.len() > budget && budget >= 2 {
        truncate_proportionally(org, project, budget)
    } else {
        (org.to_string(), project.to_string())
    };

    format!("{NAMESPACE_PREFIX}{org}--{project}--{hash_suffix}")
}

/// Split `budget` characters between `org` and `project` proportionally to
/// their original lengths, keeping at least 1 char each.
fn truncate_proportionally(org: &str, project: &str, budget: usize) -> (String, String) {
    let total = (org.len() + project.len()).max(1);
    let mut org_budget = (budget * org.len() / total).max(1);
    let mut project_budget = budget.saturating_sub(org_budget).max(1);
    // Rounding can overshoot by one char when both lengths are tiny; clamp.
    while org_budget + project_budget > budget && (org_budget > 1 || project_budget > 1) {
        if org_budget > 1 {
            org_budget -= 1;
        } else {
            project_budget -= 1;
        }
    }
    (
        truncate_chars(org, org_budget),
        truncate_chars(project, project_budget),
    )
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max.max(1)).collect()
}

/// `<disk_name>--<org>--<project>`
pub fn get_disk_naming_name(disk_name: &str, org: &str, project: &str) -> String {
    format!("{disk_name}--{org}--{project}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_and_shaped() {
        let a = generate_namespace_name("acme", "web");
        let b = generate_namespace_name("acme", "web");
        assert_eq!(a, b);
        assert!(a.starts_with("platform--"));
        assert!(a.len() <= 63);
        let hash_part = &a[a.len() - 24..];
        assert!(hash_part.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn differs_for_different_inputs() {
        let a = generate_namespace_name("acme", "web");
        let b = generate_namespace_name("acme", "mobile");
        assert_ne!(a, b);
    }

    #[test]
    fn truncates_long_org_and_project() {
        let org = "a".repeat(80);
        let project = "b".repeat(80);
        let ns = generate_namespace_name(&org, &project);
        assert!(ns.len() <= 63, "namespace too long: {} chars", ns.len());
        assert!(ns.starts_with("platform--"));
    }

    #[test]
    fn disk_naming_name_format() {
        assert_eq!(get_disk_naming_name("db", "acme", "web"), "db--acme--web");
    }
}
