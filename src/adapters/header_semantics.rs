//! Default header parsing and content negotiation.
//!
//! Negotiation follows the usual quality-value rules: candidates are ranked
//! by `q`, ties keep the client's order, `q=0` excludes a candidate and
//! wildcards match anything in their range. When a header is absent the
//! first supported value wins.
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::ports::header_semantics::{ContentType, EntityTag, ForwardedElement, HeaderSemantics};

/// IMF-fixdate, the preferred HTTP date format.
pub const IMF_FIXDATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Clone, Copy, Default)]
pub struct StandardHeaderSemantics;

struct Preference<'a> {
    value: &'a str,
    quality: f32,
}

/// Split a `value;q=0.5, other` list into preferences, best first.
fn preferences(header: &str) -> Vec<Preference<'_>> {
    let mut list: Vec<Preference<'_>> = header
        .split(',')
        .filter_map(|item| {
            let mut parts = item.split(';').map(str::trim);
            let value = parts.next().filter(|v| !v.is_empty())?;
            let quality = parts
                .filter_map(|p| p.split_once('='))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("q"))
                .map(|(_, q)| q.trim().parse::<f32>().unwrap_or(0.0))
                .unwrap_or(1.0);
            Some(Preference { value, quality })
        })
        .collect();
    // stable: equal qualities keep the client's order
    list.sort_by(|a, b| b.quality.total_cmp(&a.quality));
    list
}

fn select(
    header: Option<&str>,
    supported: &[String],
    matches: impl Fn(&str, &str) -> bool,
) -> Option<String> {
    let Some(header) = header else {
        return supported.first().cloned();
    };

    let prefs = preferences(header);
    let excluded = |candidate: &str| {
        prefs
            .iter()
            .any(|p| p.quality <= 0.0 && p.value.eq_ignore_ascii_case(candidate))
    };

    prefs
        .iter()
        .filter(|p| p.quality > 0.0)
        .find_map(|p| {
            supported
                .iter()
                .find(|s| matches(p.value, s.as_str()) && !excluded(s.as_str()))
        })
        .cloned()
}

fn media_range_matches(range: &str, media_type: &str) -> bool {
    let range = range.to_ascii_lowercase();
    let media_type = media_type.to_ascii_lowercase();
    if range == "*/*" || range == media_type {
        return true;
    }
    match (range.strip_suffix("/*"), media_type.split_once('/')) {
        (Some(kind), Some((media_kind, _))) => kind == media_kind,
        _ => false,
    }
}

fn language_range_matches(range: &str, tag: &str) -> bool {
    if range == "*" || range.eq_ignore_ascii_case(tag) {
        return true;
    }
    // basic filtering: "en" matches "en-US"
    tag.get(..range.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(range))
        && tag.as_bytes().get(range.len()) == Some(&b'-')
}

// Strips the quotes of a quoted-string and resolves its `\` escapes.
fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.extend(chars.next()),
            c => out.push(c),
        }
    }
    out
}

// Splits on `separator` outside of quoted-strings.
fn split_unquoted(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == separator && !quoted => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

fn parse_entity_tag(item: &str) -> Option<EntityTag> {
    let item = item.trim();
    if item == "*" {
        return Some(EntityTag::any());
    }
    let (weak, quoted) = match item.strip_prefix("W/") {
        Some(rest) => (true, rest),
        None => (false, item),
    };
    let opaque = quoted.strip_prefix('"')?.strip_suffix('"')?;
    if opaque.contains('"') {
        return None;
    }
    Some(EntityTag {
        weak,
        opaque: opaque.to_string(),
    })
}

impl HeaderSemantics for StandardHeaderSemantics {
    fn select_media_type(&self, accept: Option<&str>, supported: &[String]) -> Option<String> {
        select(accept, supported, media_range_matches)
    }

    fn select_encoding(
        &self,
        accept_encoding: Option<&str>,
        supported: &[String],
    ) -> Option<String> {
        select(accept_encoding, supported, |range, coding| {
            range == "*" || range.eq_ignore_ascii_case(coding)
        })
    }

    fn select_language(
        &self,
        accept_language: Option<&str>,
        supported: &[String],
    ) -> Option<String> {
        select(accept_language, supported, language_range_matches)
    }

    fn parse_etag_list(&self, value: Option<&str>) -> Vec<EntityTag> {
        value
            .map(|v| v.split(',').filter_map(parse_entity_tag).collect())
            .unwrap_or_default()
    }

    fn parse_etag(&self, value: Option<&str>) -> Option<EntityTag> {
        value.and_then(parse_entity_tag).filter(|tag| !tag.is_any())
    }

    fn parse_fix_date(&self, value: Option<&str>) -> Option<DateTime<Utc>> {
        let value = value?.trim();
        NaiveDateTime::parse_from_str(value, IMF_FIXDATE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn parse_forwarded(
        &self,
        value: Option<&str>,
        accepted_keys: &[&str],
    ) -> Vec<ForwardedElement> {
        let Some(value) = value else {
            return Vec::new();
        };

        split_unquoted(value, ',')
            .into_iter()
            .map(|element| {
                let pairs = split_unquoted(element, ';')
                    .into_iter()
                    .filter_map(|pair| pair.split_once('='))
                    .map(|(k, v)| (k.trim().to_ascii_lowercase(), unquote(v.trim())))
                    .filter(|(k, _)| accepted_keys.contains(&k.as_str()))
                    .collect();
                ForwardedElement::new(pairs)
            })
            .filter(|element| !element.is_empty())
            .collect()
    }

    fn parse_content_type(&self, value: Option<&str>) -> Option<ContentType> {
        let mut parts = split_unquoted(value?, ';').into_iter().map(str::trim);
        let mime_type = parts.next()?.to_ascii_lowercase();
        if !mime_type.contains('/') {
            return None;
        }

        let mut charset = None;
        let mut parameters = Vec::new();
        for (name, raw) in parts.filter_map(|p| p.split_once('=')) {
            let name = name.trim().to_ascii_lowercase();
            let raw = unquote(raw.trim());
            if name == "charset" {
                charset = Some(raw.to_ascii_lowercase());
            } else {
                parameters.push((name, raw));
            }
        }

        Some(ContentType {
            mime_type,
            charset,
            parameters,
        })
    }
}

/// Render a timestamp as IMF-fixdate.
pub fn format_fix_date(date: &DateTime<Utc>) -> String {
    date.format(IMF_FIXDATE_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_media_type() {
        let supported = list(&["application/json", "text/plain", "message/http"]);
        let h = StandardHeaderSemantics;

        assert_eq!(h.select_media_type(None, &supported).as_deref(), Some("application/json"));
        assert_eq!(
            h.select_media_type(Some("text/plain;q=0.5, application/json"), &supported).as_deref(),
            Some("application/json")
        );
        assert_eq!(
            h.select_media_type(Some("text/*"), &supported).as_deref(),
            Some("text/plain")
        );
        assert_eq!(
            h.select_media_type(Some("*/*;q=0.1, message/http"), &supported).as_deref(),
            Some("message/http")
        );
        assert_eq!(h.select_media_type(Some("image/png"), &supported), None);
        assert_eq!(
            h.select_media_type(Some("application/json;q=0"), &supported),
            None
        );
    }

    #[test]
    fn test_select_encoding_and_language() {
        let h = StandardHeaderSemantics;
        let encodings = list(&["identity"]);
        assert_eq!(
            h.select_encoding(Some("gzip, br"), &encodings),
            None
        );
        assert_eq!(
            h.select_encoding(Some("gzip, *;q=0.1"), &encodings).as_deref(),
            Some("identity")
        );

        let languages = list(&["en-US", "en"]);
        assert_eq!(
            h.select_language(Some("fr, en;q=0.8"), &languages).as_deref(),
            Some("en-US")
        );
        assert_eq!(
            h.select_language(Some("EN-us"), &languages).as_deref(),
            Some("en-US")
        );
        assert_eq!(h.select_language(Some("de"), &languages), None);
    }

    #[test]
    fn test_etags() {
        let h = StandardHeaderSemantics;
        assert_eq!(
            h.parse_etag_list(Some("\"a\", W/\"b\", junk")),
            vec![EntityTag::strong("a"), EntityTag::weak("b")]
        );
        assert_eq!(h.parse_etag_list(Some("*")), vec![EntityTag::any()]);
        assert_eq!(h.parse_etag(Some("W/\"x\"")), Some(EntityTag::weak("x")));
        assert_eq!(h.parse_etag(Some("*")), None);
        assert_eq!(EntityTag::weak("x").to_string(), "W/\"x\"");
    }

    #[test]
    fn test_fix_date() {
        let h = StandardHeaderSemantics;
        let date = h.parse_fix_date(Some("Sun, 06 Nov 1994 08:49:37 GMT")).unwrap();
        assert_eq!(date, Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap());
        assert_eq!(format_fix_date(&date), "Sun, 06 Nov 1994 08:49:37 GMT");
        assert_eq!(h.parse_fix_date(Some("\"etag\"")), None);
        assert_eq!(h.parse_fix_date(None), None);
    }

    #[test]
    fn test_forwarded() {
        let h = StandardHeaderSemantics;
        let hops = h.parse_forwarded(
            Some("for=192.0.2.60;proto=http;by=203.0.113.43, For=\"[2001:db8::1]\";x=y"),
            &["by", "for", "host", "proto", "secret"],
        );
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].get("proto"), Some("http"));
        assert_eq!(hops[1].get("for"), Some("[2001:db8::1]"));
        assert_eq!(hops[1].get("x"), None);
        assert!(h.parse_forwarded(None, &["for"]).is_empty());
    }

    #[test]
    fn test_forwarded_quoted_strings_keep_separators() {
        let h = StandardHeaderSemantics;
        let hops = h.parse_forwarded(
            Some(r#"for=198.51.100.7;secret="a,b;c", for=192.0.2.1;secret="x\"y""#),
            &["for", "secret"],
        );
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0].get("for"), Some("198.51.100.7"));
        assert_eq!(hops[0].get("secret"), Some("a,b;c"));
        assert_eq!(hops[1].get("secret"), Some("x\"y"));
    }

    #[test]
    fn test_content_type() {
        let h = StandardHeaderSemantics;
        let ct = h
            .parse_content_type(Some("Application/JSON; charset=\"UTF-8\"; profile=x"))
            .unwrap();
        assert_eq!(ct.mime_type, "application/json");
        assert_eq!(ct.charset.as_deref(), Some("utf-8"));
        assert_eq!(ct.parameters, vec![("profile".to_string(), "x".to_string())]);
        assert_eq!(h.parse_content_type(Some("nonsense")), None);
    }
}
