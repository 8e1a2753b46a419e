// OpenDirectory, the pluggable directory management backend of the Musikverein Leopoldsdorf.
// Copyright (C) 2023  Richard Stöckl
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA.

//! Helpers for distinguished names.
//!
//! Dns are treated as opaque, case-insensitive strings, split only at commas
//! which are not escaped with a backslash.

/// Expand an identifier into a full dn.
///
/// A bare identifier without `=` becomes `<main_attribute>=<id>,<base>`,
/// a single rdn without a comma gets the base appended.
pub fn normalize(input: &str, main_attribute: &str, base: &str) -> String {
    if !input.contains('=') {
        return format!("{}={},{}", main_attribute, ldap3::dn_escape(input), base);
    }
    if !input.contains(',') && !input.eq_ignore_ascii_case(base) {
        return format!("{},{}", input, base);
    }
    input.to_string()
}

/// Split a dn at its first unescaped comma.
fn split_first(dn: &str) -> (&str, Option<&str>) {
    let bytes = dn.as_bytes();
    let mut escaped = false;
    for (index, byte) in bytes.iter().enumerate() {
        match byte {
            b'\\' => escaped = !escaped,
            b',' if !escaped => return (&dn[..index], Some(&dn[index + 1..])),
            _ => escaped = false,
        }
    }
    (dn, None)
}

/// The leftmost component of the dn.
pub fn rdn(dn: &str) -> &str {
    split_first(dn).0
}

/// The dn without its leftmost component.
pub fn parent(dn: &str) -> Option<&str> {
    split_first(dn).1
}

/// All components of the dn from left to right.
pub fn components(dn: &str) -> Vec<&str> {
    let mut remaining = dn;
    let mut parts = Vec::new();
    loop {
        let (head, tail) = split_first(remaining);
        if !head.is_empty() {
            parts.push(head);
        }
        match tail {
            Some(rest) => remaining = rest,
            None => return parts,
        }
    }
}

/// The value part of an rdn such as `ou=members`.
pub fn rdn_value(rdn: &str) -> &str {
    rdn.split_once('=').map(|(_, value)| value).unwrap_or(rdn)
}

/// Whether the dn lies under the branch, or is the branch itself.
/// The comparison is case-insensitive and respects component boundaries.
pub fn is_under(dn: &str, branch: &str) -> bool {
    let dn = dn.to_ascii_lowercase();
    let branch = branch.to_ascii_lowercase();
    if dn == branch {
        return true;
    }
    dn.ends_with(&format!(",{}", branch))
}

/// Substitute the suffix `old` of the dn with `new`, `None` when it does not apply.
pub fn replace_suffix(dn: &str, old: &str, new: &str) -> Option<String> {
    if dn.eq_ignore_ascii_case(old) {
        return Some(new.to_string());
    }
    if !is_under(dn, old) {
        return None;
    }
    let prefix = &dn[..dn.len() - old.len()];
    Some(format!("{}{}", prefix, new))
}

/// The amount of components of the dn, used to process parents before their descendants.
pub fn depth(dn: &str) -> usize {
    components(dn).len()
}

/// The human readable, slash separated path of an organization dn below the base,
/// derived from its nesting: `ou=B,ou=A,dc=ex` below `dc=ex` becomes `/A/B`.
pub fn path_below(dn: &str, base: &str) -> String {
    if dn.eq_ignore_ascii_case(base) {
        return "/".to_string();
    }
    let relative = if is_under(dn, base) {
        &dn[..dn.len() - base.len() - 1]
    } else {
        dn
    };
    let mut labels: Vec<&str> = components(relative)
        .into_iter()
        .map(rdn_value)
        .collect();
    labels.reverse();
    format!("/{}", labels.join("/"))
}

/// Escape a value for use inside a search filter.
pub fn filter_escape(value: &str) -> String {
    ldap3::ldap_escape(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_expands_bare_identifiers() {
        assert_eq!(
            normalize("karli", "uid", "ou=members,dc=mvl,dc=at"),
            "uid=karli,ou=members,dc=mvl,dc=at"
        );
    }

    #[test]
    fn normalize_appends_the_base_to_single_rdns() {
        assert_eq!(
            normalize("uid=karli", "uid", "ou=members,dc=mvl,dc=at"),
            "uid=karli,ou=members,dc=mvl,dc=at"
        );
    }

    #[test]
    fn normalize_keeps_full_dns() {
        assert_eq!(
            normalize("uid=karli,ou=members,dc=mvl,dc=at", "uid", "dc=mvl,dc=at"),
            "uid=karli,ou=members,dc=mvl,dc=at"
        );
    }

    #[test]
    fn rdn_and_parent_respect_escapes() {
        let dn = "cn=Doe\\, John,ou=members,dc=ex";
        assert_eq!(rdn(dn), "cn=Doe\\, John");
        assert_eq!(parent(dn), Some("ou=members,dc=ex"));
    }

    #[test]
    fn is_under_matches_component_boundaries_only() {
        assert!(is_under("uid=a,ou=b,dc=ex", "ou=b,dc=ex"));
        assert!(is_under("OU=B,DC=EX", "ou=b,dc=ex"));
        assert!(!is_under("uid=a,ou=bb,dc=ex", "ou=b,dc=ex"));
        assert!(is_under("ou=b,dc=ex", "ou=b,dc=ex"));
    }

    #[test]
    fn replace_suffix_rewrites_descendants() {
        assert_eq!(
            replace_suffix("ou=c,ou=a,dc=ex", "ou=a,dc=ex", "ou=b,dc=ex"),
            Some("ou=c,ou=b,dc=ex".to_string())
        );
        assert_eq!(
            replace_suffix("ou=a,dc=ex", "ou=a,dc=ex", "ou=b,dc=ex"),
            Some("ou=b,dc=ex".to_string())
        );
        assert_eq!(replace_suffix("ou=c,dc=other", "ou=a,dc=ex", "ou=b,dc=ex"), None);
    }

    #[test]
    fn path_below_reverses_the_nesting() {
        assert_eq!(path_below("ou=B,ou=A,dc=ex", "dc=ex"), "/A/B");
        assert_eq!(path_below("ou=A,dc=ex", "dc=ex"), "/A");
        assert_eq!(path_below("dc=ex", "dc=ex"), "/");
    }

    #[test]
    fn filter_escape_neutralizes_special_characters() {
        assert_eq!(filter_escape("a*b"), "a\\2ab");
        assert_eq!(filter_escape("plain"), "plain");
    }
}
