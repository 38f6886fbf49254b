//! Version lineage invariant checks.

use crate::core::types::VersionStatus;

/// Validate a block's version lineage.
///
/// Invariants:
/// - at most one version has status `active`;
/// - version numbers are unique and strictly increasing.
///
/// Returns human-readable violations; empty means the lineage is valid.
pub fn validate_lineage(versions: &[(u32, VersionStatus)]) -> Vec<String> {
    let mut errors = Vec::new();

    let active: Vec<u32> = versions
        .iter()
        .filter(|(_, status)| *status == VersionStatus::Active)
        .map(|(version, _)| *version)
        .collect();
    if active.len() > 1 {
        errors.push(format!(
            "multiple active versions: {}",
            active
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }

    for window in versions.windows(2) {
        let (prev, _) = window[0];
        let (next, _) = window[1];
        if next <= prev {
            errors.push(format!(
                "version numbers not strictly increasing: v{prev} followed by v{next}"
            ));
        }
    }

    errors
}
