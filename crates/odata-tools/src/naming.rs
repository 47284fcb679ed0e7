//! Operation name rendering.

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// Upper bound for MCP tool names. Longer names keep a hash suffix of the full name.
pub const MAX_NAME_LEN: usize = 64;

const HASH_SUFFIX_HEX: usize = 8;

/// Casing convention for generated operation names.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NamingConvention {
    /// `GetOrder_Details` (names as declared)
    #[default]
    Pascal,
    /// `getOrder_Details`
    Camel,
    /// `Get_Order_Details`
    Snake,
    /// `Get-Order_Details`
    Kebab,
}

/// Form an operation name: the parts are concatenated as written, then transformed by
/// `convention`.
#[must_use]
pub fn format_name(
    convention: NamingConvention,
    operation_word: &str,
    entity_name: &str,
    navigation_name: Option<&str>,
) -> String {
    let mut joined = format!("{operation_word}{entity_name}");
    if let Some(nav) = navigation_name {
        joined.push_str(nav);
    }
    cap_length(transform(convention, &joined))
}

/// Apply a casing convention to an already concatenated name.
///
/// Pascal is the identity and camel lower-cases the first character. Snake and kebab insert
/// their separator before each interior capital unless one already precedes it. No other
/// character changes.
#[must_use]
pub fn transform(convention: NamingConvention, name: &str) -> String {
    match convention {
        NamingConvention::Pascal => name.to_string(),
        NamingConvention::Camel => {
            let mut chars = name.chars();
            match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => String::new(),
            }
        }
        NamingConvention::Snake => separate(name, '_'),
        NamingConvention::Kebab => separate(name, '-'),
    }
}

fn separate(name: &str, sep: char) -> String {
    let mut out = String::with_capacity(name.len() + 8);
    let mut prev: Option<char> = None;
    for c in name.chars() {
        if c.is_uppercase() && prev.is_some_and(|p| p != '_' && p != '-') {
            out.push(sep);
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

/// Names over [`MAX_NAME_LEN`] are cut and suffixed with `_` and a short hash of the full name,
/// so distinct long names stay distinct.
fn cap_length(name: String) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let digest = hex::encode(sha2::Sha256::digest(name.as_bytes()));
    let mut cut = MAX_NAME_LEN - HASH_SUFFIX_HEX - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{}", &name[..cut], &digest[..HASH_SUFFIX_HEX])
}
