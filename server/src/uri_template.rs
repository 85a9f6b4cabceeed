//! Minimal RFC-6570-style URI templates: `{var}` expressions embedded in an
//! otherwise literal URI. One variable per path or query component; scheme
//! and authority must match literally.
//!
//! Matching parses both sides as [`url::Url`], so host and port compare
//! with the URL standard's semantics (`http://example.com:80/x` equals
//! `http://example.com/x`). The url parser percent-encodes the `{`/`}` of a
//! template's path expressions, so template components are percent-decoded
//! before the variable syntax is interpreted.

use std::borrow::Cow;
use toolbus_protocol::JsonObject;
use url::Url;

/// Names of every `{var}` expression in the template, in order.
pub fn template_variables(template: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        vars.push(rest[open + 1..open + close].to_string());
        rest = &rest[open + close + 1..];
    }
    vars
}

/// Match `uri` against `template`, returning the captured variables
/// (percent-decoded, as JSON strings) on success.
pub fn match_uri(template: &str, uri: &str) -> Option<JsonObject> {
    let template = Url::parse(template).ok()?;
    let uri = Url::parse(uri).ok()?;

    if template.scheme() != uri.scheme()
        || template.host_str() != uri.host_str()
        || template.port_or_known_default() != uri.port_or_known_default()
    {
        return None;
    }

    let mut vars = JsonObject::new();

    match (template.path_segments(), uri.path_segments()) {
        (Some(t_segments), Some(u_segments)) => {
            let t_segments: Vec<String> =
                t_segments.map(decode_component).collect::<Option<_>>()?;
            let u_segments: Vec<String> =
                u_segments.map(decode_component).collect::<Option<_>>()?;
            if t_segments.len() != u_segments.len() {
                return None;
            }
            for (t_segment, u_segment) in t_segments.iter().zip(&u_segments) {
                match_component(t_segment, u_segment, &mut vars)?;
            }
        }
        // Cannot-be-a-base URLs carry an opaque path; only a literal match
        // is meaningful there.
        (None, None) => {
            if template.path() != uri.path() {
                return None;
            }
        }
        _ => return None,
    }

    // Query pairs arrive percent-decoded; extra pairs on the URI are
    // ignored for forward compatibility.
    for (key, t_value) in template.query_pairs() {
        let u_value = uri
            .query_pairs()
            .find(|(u_key, _)| *u_key == key)
            .map(|(_, value)| value)?;
        match_component(&t_value, &u_value, &mut vars)?;
    }

    Some(vars)
}

/// Substitute `vars` into `template`, percent-encoding each value. The raw
/// template is not a parseable URL until its expressions are substituted,
/// so expansion is textual; the result parses with [`Url`] and matches the
/// template it came from.
pub fn expand(template: &str, vars: &JsonObject) -> String {
    let mut out = String::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = &rest[open + 1..open + close];
        let value = vars
            .get(name)
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();
        out.push_str(&urlencoding::encode(&value));
        rest = &rest[open + close + 1..];
    }
    out.push_str(rest);
    out
}

/// Match one decoded literal-or-templated component. Supports a single
/// `{var}` with optional literal prefix/suffix, e.g. `report-{year}.txt`.
fn match_component(template: &str, actual: &str, vars: &mut JsonObject) -> Option<()> {
    let Some(open) = template.find('{') else {
        return (template == actual).then_some(());
    };
    let close = template.find('}')?;
    let prefix = &template[..open];
    let suffix = &template[close + 1..];
    let name = &template[open + 1..close];

    let value = actual.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if value.is_empty() {
        return None;
    }
    vars.insert(name.to_string(), value.into());
    Some(())
}

fn decode_component(segment: &str) -> Option<String> {
    urlencoding::decode(segment).ok().map(Cow::into_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn literal_templates_match_exactly() {
        assert_eq!(
            match_uri("app://files/readme.txt", "app://files/readme.txt"),
            Some(JsonObject::new())
        );
        assert_eq!(match_uri("app://files/readme.txt", "app://files/other.txt"), None);
        assert_eq!(match_uri("app://files/readme.txt", "ftp://files/readme.txt"), None);
    }

    #[test]
    fn path_variables_capture_decoded_segments() {
        let vars = match_uri("app://users/{id}/posts/{post}", "app://users/42/posts/hello%20world")
            .expect("should match");
        assert_eq!(vars.get("id"), Some(&json!("42")));
        assert_eq!(vars.get("post"), Some(&json!("hello world")));
    }

    #[test]
    fn segment_counts_must_align() {
        assert_eq!(match_uri("app://users/{id}", "app://users/42/extra"), None);
        assert_eq!(match_uri("app://users/{id}/posts", "app://users/42"), None);
    }

    #[test]
    fn hosts_and_ports_compare_as_urls_not_strings() {
        // An explicit default port equals its absence.
        let vars = match_uri(
            "http://example.com:80/files/{name}",
            "http://example.com/files/a",
        )
        .expect("default port should normalize");
        assert_eq!(vars.get("name"), Some(&json!("a")));

        assert_eq!(
            match_uri("http://example.com:8080/files/{name}", "http://example.com/files/a"),
            None
        );
        assert_eq!(
            match_uri("http://example.com/files/{name}", "http://other.example/files/a"),
            None
        );
    }

    #[test]
    fn query_variables_match_by_key() {
        let vars = match_uri(
            "search://find?q={query}&limit=10",
            "search://find?limit=10&q=rust",
        )
        .expect("should match");
        assert_eq!(vars.get("query"), Some(&json!("rust")));
        assert_eq!(match_uri("search://find?q={query}&limit=10", "search://find?q=rust"), None);
    }

    #[test]
    fn affixed_variables_capture_the_middle() {
        let vars = match_uri("app://reports/report-{year}.txt", "app://reports/report-2024.txt")
            .expect("should match");
        assert_eq!(vars.get("year"), Some(&json!("2024")));
    }

    #[test]
    fn expand_then_match_recovers_variables() {
        let template = "app://users/{id}/files/{name}";
        let mut vars = JsonObject::new();
        vars.insert("id".into(), json!("7"));
        vars.insert("name".into(), json!("notes & drafts"));

        let uri = expand(template, &vars);
        assert_eq!(uri, "app://users/7/files/notes%20%26%20drafts");
        assert_eq!(match_uri(template, &uri), Some(vars));
    }

    #[test]
    fn variables_collected_in_order() {
        assert_eq!(
            template_variables("app://{a}/x/{b}?k={c}"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}
