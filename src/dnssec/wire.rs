//! Name and bitmap encoding helpers shared by the signer and denial chains.

use std::cmp::Ordering;

/// Normalize a domain name to lowercase fully-qualified form (`example.com.`)
pub fn fqdn(name: &str) -> String {
    let name = name.trim().to_lowercase();
    if name.is_empty() || name == "." {
        return ".".to_string();
    }
    if name.ends_with('.') {
        name
    } else {
        format!("{}.", name)
    }
}

/// Check that a name is a syntactically valid domain name
pub fn is_valid_name(name: &str) -> bool {
    let name = fqdn(name);
    if name == "." {
        return true;
    }
    if name.len() > 254 {
        return false;
    }
    name.trim_end_matches('.')
        .split('.')
        .all(|label| !label.is_empty() && label.len() <= 63 && !label.contains(' '))
}

fn labels(name: &str) -> impl DoubleEndedIterator<Item = &str> {
    name.split('.').filter(|label| !label.is_empty())
}

/// Encode a name in canonical (lowercase, uncompressed) wire format
pub fn name_to_wire(name: &str) -> Vec<u8> {
    let mut wire = Vec::with_capacity(name.len() + 2);
    for label in labels(name) {
        wire.push(label.len() as u8);
        wire.extend_from_slice(label.to_lowercase().as_bytes());
    }
    wire.push(0);
    wire
}

/// RRSIG Labels field: label count excluding the root and a leading wildcard
pub fn label_count(name: &str) -> u8 {
    let mut count = labels(name).count();
    if name.starts_with("*.") {
        count -= 1;
    }
    count as u8
}

/// Check whether `name` is at or below `origin`
pub fn is_in_zone(name: &str, origin: &str) -> bool {
    let name = fqdn(name);
    let origin = fqdn(origin);
    origin == "." || name == origin || name.ends_with(&format!(".{}", origin))
}

/// Canonical DNS name ordering (RFC 4034 Section 6.1)
pub fn canonical_cmp(a: &str, b: &str) -> Ordering {
    let a = fqdn(a);
    let b = fqdn(b);
    let mut left = labels(&a).rev();
    let mut right = labels(&b).rev();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match l.as_bytes().cmp(r.as_bytes()) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Build an NSEC/NSEC3 type bitmap (RFC 4034 Section 4.1.2)
pub fn type_bitmap(types: &[u16]) -> Vec<u8> {
    let mut sorted = types.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out = Vec::new();
    let mut window: Option<u8> = None;
    let mut bits = [0u8; 32];
    let mut used = 0usize;

    for rtype in sorted {
        let this_window = (rtype >> 8) as u8;
        if window != Some(this_window) {
            if let Some(w) = window {
                out.push(w);
                out.push(used as u8);
                out.extend_from_slice(&bits[..used]);
            }
            window = Some(this_window);
            bits = [0u8; 32];
            used = 0;
        }
        let low = (rtype & 0xFF) as usize;
        bits[low / 8] |= 0x80 >> (low % 8);
        used = used.max(low / 8 + 1);
    }

    if let Some(w) = window {
        out.push(w);
        out.push(used as u8);
        out.extend_from_slice(&bits[..used]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn() {
        assert_eq!(fqdn("Example.COM"), "example.com.");
        assert_eq!(fqdn("example.com."), "example.com.");
        assert_eq!(fqdn(""), ".");
    }

    #[test]
    fn test_name_to_wire() {
        assert_eq!(
            name_to_wire("WWW.example.com."),
            b"\x03www\x07example\x03com\x00".to_vec()
        );
        assert_eq!(name_to_wire("."), vec![0]);
    }

    #[test]
    fn test_label_count() {
        assert_eq!(label_count("example.com."), 2);
        assert_eq!(label_count("*.example.com."), 2);
        assert_eq!(label_count("."), 0);
    }

    #[test]
    fn test_canonical_order() {
        // RFC 4034 Section 6.1 example ordering
        let mut names = vec![
            "z.example.",
            "a.example.",
            "example.",
            "yljkjljk.a.example.",
            "Z.a.example.",
            "zABC.a.EXAMPLE.",
        ];
        names.sort_by(|a, b| canonical_cmp(a, b));
        assert_eq!(
            names,
            vec![
                "example.",
                "a.example.",
                "yljkjljk.a.example.",
                "Z.a.example.",
                "zABC.a.EXAMPLE.",
                "z.example.",
            ]
        );
    }

    #[test]
    fn test_type_bitmap() {
        // A, MX, RRSIG, NSEC from RFC 4034 Section 4.3
        let bitmap = type_bitmap(&[1, 15, 46, 47]);
        assert_eq!(bitmap, vec![0x00, 0x06, 0x40, 0x01, 0x00, 0x00, 0x00, 0x03]);
    }

    #[test]
    fn test_is_in_zone() {
        assert!(is_in_zone("www.example.com", "example.com."));
        assert!(is_in_zone("example.com.", "example.com"));
        assert!(!is_in_zone("badexample.com.", "example.com."));
    }
}
