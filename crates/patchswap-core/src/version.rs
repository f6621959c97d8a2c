use std::cmp::Ordering;

use semver::Version;

/// Returns true when `update_version` is strictly older than the installed
/// `app_version`. A literal `null` update version is never older.
pub fn is_older_version(update_version: &str, app_version: &str) -> bool {
    let update_version = update_version.trim();
    if update_version.is_empty() || update_version == "null" {
        return false;
    }

    compare_versions(app_version.trim(), update_version) == Ordering::Greater
}

fn compare_versions(left: &str, right: &str) -> Ordering {
    if let (Ok(left), Ok(right)) = (Version::parse(left), Version::parse(right)) {
        return left.cmp(&right);
    }

    // Application versions are often dotted numbers with fewer than three
    // parts ("12.0") or an alpha suffix ("12.0a1"); compare part by part.
    let left_parts = split_version(left);
    let right_parts = split_version(right);
    let len = left_parts.len().max(right_parts.len());
    for index in 0..len {
        let left_part = left_parts.get(index).cloned().unwrap_or((0, String::new()));
        let right_part = right_parts.get(index).cloned().unwrap_or((0, String::new()));
        let ordering = left_part.0.cmp(&right_part.0).then_with(|| {
            // a part without suffix sorts after one with a pre-release suffix
            match (left_part.1.is_empty(), right_part.1.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => left_part.1.cmp(&right_part.1),
            }
        });
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn split_version(raw: &str) -> Vec<(u64, String)> {
    raw.split('.')
        .map(|part| {
            let digits_end = part
                .char_indices()
                .find(|(_, ch)| !ch.is_ascii_digit())
                .map(|(index, _)| index)
                .unwrap_or(part.len());
            let number = part[..digits_end].parse::<u64>().unwrap_or(0);
            (number, part[digits_end..].to_string())
        })
        .collect()
}
