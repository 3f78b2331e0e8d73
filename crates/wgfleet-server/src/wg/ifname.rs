//! Interface and config-file naming.
//!
//! Group display names are free-form; the OS restricts interface names to 15
//! bytes of `[a-z0-9-]` (we additionally require an alphanumeric first
//! character). The sanitizer is total: any input, including the empty string,
//! maps to a legal name.

/// IFNAMSIZ minus the trailing NUL.
const MAX_LEN: usize = 15;

const PREFIX: &str = "wg-";

/// Lowercase, map everything outside `[a-z0-9-]` to `-`, collapse runs of
/// hyphens, strip leading/trailing hyphens.
fn clean_stem(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

fn truncate_clean(name: &str, max: usize) -> String {
    let cut: String = name.chars().take(max).collect();
    cut.trim_end_matches('-').to_string()
}

fn compose(display_name: &str, id: i64, suffix: &str) -> String {
    let mut stem = clean_stem(display_name);
    if stem.is_empty() {
        stem = format!("group{id}");
    }

    let budget = (MAX_LEN - PREFIX.len()).saturating_sub(suffix.len());
    if budget == 0 {
        // A "-{id}" suffix stops fitting once ids reach 12 digits. Keep the
        // low digits instead, which differ between neighboring ids; the
        // unique index still rejects the rare clash of ids 10^7 apart.
        let digits = id.to_string();
        let keep = MAX_LEN - PREFIX.len() - "group".len();
        let tail = &digits[digits.len().saturating_sub(keep)..];
        return format!("{PREFIX}group{tail}");
    }

    let mut name = format!("{PREFIX}{}{suffix}", truncate_clean(&stem, budget));
    if name.len() > MAX_LEN {
        name = truncate_clean(&name, MAX_LEN);
    }
    name
}

/// Map a group display name to a legal interface name, e.g.
/// `"Production VPN"` becomes `wg-production-v`.
pub fn sanitize_interface_name(display_name: &str, id: i64) -> String {
    compose(display_name, id, "")
}

/// Variant that folds the group id into the name, used when the plain form
/// collides with another group's interface name.
pub fn sanitize_interface_name_with_id(display_name: &str, id: i64) -> String {
    compose(display_name, id, &format!("-{id}"))
}

/// File stem for a client's rendered config inside the group's directory.
/// The id keeps two same-named clients from clobbering each other's file.
pub fn client_config_stem(name: &str, id: i64) -> String {
    let stem = clean_stem(name);
    if stem.is_empty() {
        format!("client{id}")
    } else {
        format!("{}-{id}", truncate_clean(&stem, 48))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn assert_legal(name: &str) {
        assert!(!name.is_empty());
        assert!(name.len() <= MAX_LEN, "{name} exceeds {MAX_LEN} chars");
        let mut chars = name.chars();
        let first = chars.next().unwrap();
        assert!(first.is_ascii_lowercase() || first.is_ascii_digit(), "{name}");
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "{name}"
        );
    }

    #[test_case("Production VPN", 1, "wg-production-v")]
    #[test_case("office", 2, "wg-office")]
    #[test_case("My  --  Net", 3, "wg-my-net")]
    #[test_case("Büro München", 4, "wg-b-ro-m-nchen")]
    #[test_case("wg0", 5, "wg-wg0")]
    fn sanitizes_typical_names(input: &str, id: i64, expected: &str) {
        let name = sanitize_interface_name(input, id);
        assert_eq!(name, expected);
        assert_legal(&name);
    }

    #[test_case("" ; "empty string")]
    #[test_case("!!!***###" ; "all symbols")]
    #[test_case("---" ; "only hyphens")]
    #[test_case("   " ; "only spaces")]
    fn falls_back_to_group_id(input: &str) {
        let name = sanitize_interface_name(input, 7);
        assert_eq!(name, "wg-group7");
        assert_legal(&name);
    }

    #[test]
    fn long_names_are_truncated_without_trailing_hyphen() {
        let input = "a".repeat(200);
        let name = sanitize_interface_name(&input, 1);
        assert_eq!(name.len(), MAX_LEN);
        assert_legal(&name);

        // A hyphen falling exactly on the cut must be stripped.
        let name = sanitize_interface_name("abcdefghijk lmnop", 1);
        assert!(!name.ends_with('-'));
        assert_legal(&name);
    }

    #[test]
    fn totality_over_hostile_inputs() {
        let inputs = ["", "!", "\n\t", "ÿÿÿÿ", &"x".repeat(200), "-a-", "0"];
        for input in inputs {
            assert_legal(&sanitize_interface_name(input, 42));
            assert_legal(&sanitize_interface_name_with_id(input, 42));
        }
    }

    #[test]
    fn twelve_digit_ids_still_disambiguate() {
        // The suffix no longer fits, so the name falls back to the id's
        // low digits. Neighboring ids must still map to distinct names.
        let a = sanitize_interface_name_with_id("office", 1_000_000_000_000);
        let b = sanitize_interface_name_with_id("office", 1_000_000_000_001);
        assert_ne!(a, b);
        assert_legal(&a);
        assert_legal(&b);
    }

    #[test]
    fn id_suffix_disambiguates_identical_stems() {
        let a = sanitize_interface_name("production", 10);
        let b = sanitize_interface_name("production", 11);
        assert_eq!(a, b);

        let a = sanitize_interface_name_with_id("production", 10);
        let b = sanitize_interface_name_with_id("production", 11);
        assert_ne!(a, b);
        assert!(a.ends_with("-10"));
        assert!(b.ends_with("-11"));
        assert_legal(&a);
        assert_legal(&b);
    }

    #[test]
    fn client_stems_embed_the_id() {
        assert_eq!(client_config_stem("Phone", 12), "phone-12");
        assert_eq!(client_config_stem("Phone", 13), "phone-13");
        assert_eq!(client_config_stem("", 9), "client9");
        assert_eq!(client_config_stem("!!!", 9), "client9");
    }
}
