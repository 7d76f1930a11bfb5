//! Helpers for the tagged fields of INF payloads: space-separated tokens,
//! each a two-letter tag followed by an escaped value (`NIalice VE1.0`).

use crate::escape::unescape;

/// Iterates over the `(tag, raw value)` pairs of a field payload.
///
/// Tokens shorter than a tag are skipped; values are not unescaped.
pub fn fields(payload: &str) -> impl Iterator<Item = (&str, &str)>
{
    payload
        .split(' ')
        .filter(|t| t.len() >= 2 && t.is_ascii())
        .map(|t| t.split_at(2))
}

/// Finds the first field with the given tag and returns its unescaped value.
pub fn field_value(payload: &str, tag: &str) -> Option<String>
{
    fields(payload)
        .find(|(t, _)| *t == tag)
        .map(|(_, v)| unescape(v))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn finds_tagged_fields()
    {
        let payload = "IDABCD NIalice VEclient\\s1.0 SUTCP4,NAT0";
        assert_eq!(field_value(payload, "NI").as_deref(), Some("alice"));
        assert_eq!(field_value(payload, "ID").as_deref(), Some("ABCD"));
        assert_eq!(field_value(payload, "VE").as_deref(), Some("client 1.0"));
        assert_eq!(field_value(payload, "SU").as_deref(), Some("TCP4,NAT0"));
        assert_eq!(field_value(payload, "PD"), None);
    }

    #[test]
    fn empty_value_is_legal()
    {
        assert_eq!(field_value("NI DE", "NI").as_deref(), Some(""));
    }

    #[test]
    fn first_match_wins()
    {
        assert_eq!(field_value("NIone NItwo", "NI").as_deref(), Some("one"));
    }
}
