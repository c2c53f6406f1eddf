//! # Deterministic Resume Identifiers
//!
//! Agents keep long-lived session state keyed by a resume identifier. The
//! identifier must survive engine restarts without any persisted mapping, so
//! it is a pure function of workflow and agent name: the SHA-256 of
//! `"{workflow}-{agent}"`, with the first 32 hex characters shaped into
//! UUID form (version nibble forced to 4, variant nibble to 8..b) for
//! compatibility with transports that expect UUID-looking session ids.

use sha2::{Digest, Sha256};

/// Derive the resume identifier for an agent within a workflow. Same inputs,
/// same output, on every machine and every run.
pub fn derive_resume_id(workflow: &str, agent: &str) -> String {
    let digest = Sha256::digest(format!("{workflow}-{agent}").as_bytes());
    let hex = hex::encode(digest);
    let h = hex.as_bytes();

    // 8-4-4-4-12 layout over the first 32 hex chars. Position 12 is replaced
    // by the version nibble and position 16 by the variant nibble.
    let variant_digit = (h[16] as char).to_digit(16).unwrap_or(0) as u8;
    let variant = char::from_digit(u32::from((variant_digit & 0x3) | 0x8), 16).unwrap_or('8');

    format!(
        "{}-{}-4{}-{}{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[13..16],
        variant,
        &hex[17..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_across_calls() {
        let a = derive_resume_id("release", "builder");
        let b = derive_resume_id("release", "builder");
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_per_workflow_and_agent() {
        let base = derive_resume_id("release", "builder");
        assert_ne!(base, derive_resume_id("release", "tester"));
        assert_ne!(base, derive_resume_id("hotfix", "builder"));
    }

    #[test]
    fn test_uuid_shape() {
        let id = derive_resume_id("any-workflow", "any-agent");
        let groups: Vec<&str> = id.split('-').collect();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups[0].len(), 8);
        assert_eq!(groups[1].len(), 4);
        assert_eq!(groups[2].len(), 4);
        assert_eq!(groups[3].len(), 4);
        assert_eq!(groups[4].len(), 12);

        assert!(groups[2].starts_with('4'));
        let variant = groups[3].chars().next().unwrap();
        assert!(matches!(variant, '8' | '9' | 'a' | 'b'));
        assert!(id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn test_known_digest_prefix() {
        // First 32 hex chars of sha256("wf-agent") drive the layout; the
        // shape transform must keep every untouched position intact.
        let id = derive_resume_id("wf", "agent");
        let digest = hex::encode(Sha256::digest(b"wf-agent"));
        assert_eq!(&id[0..8], &digest[0..8]);
        assert_eq!(&id[9..13], &digest[8..12]);
        assert_eq!(&id[15..18], &digest[13..16]);
        assert_eq!(&id[20..23], &digest[17..20]);
        assert_eq!(&id[24..36], &digest[20..32]);
    }
}
