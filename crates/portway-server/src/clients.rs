//! Client model and list filtering
//!
//! A [`Client`] is the server-side record of an agent: identity, system
//! facts, running tunnels and group grants. The JSON rendering of this
//! struct is what the API returns and what the persistence layer stores in
//! the `details` column, so field names here are the wire contract.

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use portway_proto::{ConnectionRequest, Remote, UpdatesStatus};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Client {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_arch: String,
    #[serde(default)]
    pub os_family: String,
    #[serde(default)]
    pub os_kernel: String,
    #[serde(default)]
    pub os_full_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub os_virtualization_system: String,
    #[serde(default)]
    pub os_virtualization_role: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub cpu_family: String,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default)]
    pub cpu_model_name: String,
    #[serde(default)]
    pub cpu_vendor: String,
    #[serde(default)]
    pub num_cpus: u32,
    #[serde(default)]
    pub mem_total: u64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: String,
    /// Remote peer address of the control link, `ip:port`.
    #[serde(default)]
    pub address: String,
    /// Specs of the tunnels currently running for this client.
    #[serde(default)]
    pub tunnels: Vec<Remote>,
    /// `None` while the control link is up.
    pub disconnected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub client_auth_id: String,
    #[serde(default)]
    pub allowed_user_groups: Vec<String>,
    pub updates_status: Option<UpdatesStatus>,
}

impl Client {
    /// Build the record for a fresh handshake.
    pub fn from_connection_request(
        req: &ConnectionRequest,
        id: String,
        client_auth_id: String,
        address: String,
    ) -> Self {
        Self {
            id,
            name: req.name.clone(),
            os: req.os.clone(),
            os_arch: req.os_arch.clone(),
            os_family: req.os_family.clone(),
            os_kernel: req.os_kernel.clone(),
            os_full_name: req.os_full_name.clone(),
            os_version: req.os_version.clone(),
            os_virtualization_system: req.os_virtualization_system.clone(),
            os_virtualization_role: req.os_virtualization_role.clone(),
            hostname: req.hostname.clone(),
            cpu_family: req.cpu_family.clone(),
            cpu_model: req.cpu_model.clone(),
            cpu_model_name: req.cpu_model_name.clone(),
            cpu_vendor: req.cpu_vendor.clone(),
            num_cpus: req.num_cpus,
            mem_total: req.mem_total,
            timezone: req.timezone.clone(),
            ipv4: req.ipv4.clone(),
            ipv6: req.ipv6.clone(),
            tags: req.tags.clone(),
            version: req.version.clone(),
            address,
            tunnels: Vec::new(),
            disconnected_at: None,
            client_auth_id,
            allowed_user_groups: Vec::new(),
            updates_status: None,
        }
    }

    /// Disconnected longer than `keep_lost` ago. Clients never expire when
    /// `keep_lost` is unset.
    pub fn obsolete(&self, keep_lost: Option<Duration>) -> bool {
        match (self.disconnected_at, keep_lost) {
            (Some(at), Some(keep)) => at + keep < Utc::now(),
            _ => false,
        }
    }

    /// Whether a user holding `groups` may see this client.
    pub fn has_access(&self, groups: &[String]) -> bool {
        self.allowed_user_groups
            .iter()
            .any(|allowed| groups.contains(allowed))
    }
}

/// An API caller, for listing authorization. Admins see every client.
pub trait User {
    fn is_admin(&self) -> bool;
    fn groups(&self) -> Vec<String>;
}

/// One field filter from the API query string.
#[derive(Debug, Clone)]
pub struct FilterOption {
    pub column: String,
    pub values: Vec<String>,
}

enum Matcher {
    Exact(String),
    Wildcard(Regex),
}

/// A filter compiled once per request batch.
pub struct CompiledFilter {
    column: String,
    matchers: Vec<Matcher>,
}

/// True when the value contains a `*` that is not escaped by a backslash.
/// A leading `*` counts.
fn has_unescaped_wildcard(value: &str) -> bool {
    let mut escaped = false;
    for c in value.chars() {
        match c {
            '\\' if !escaped => escaped = true,
            '*' if !escaped => return true,
            _ => escaped = false,
        }
    }
    false
}

/// Anchored regex with `*` as `.*`; `\*` stays a literal star.
fn wildcard_regex(value: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(value.len() + 4);
    pattern.push('^');
    let mut escaped = false;
    for c in value.chars() {
        match c {
            '\\' if !escaped => escaped = true,
            '*' if !escaped => pattern.push_str(".*"),
            c => {
                if escaped && c != '*' {
                    // Unknown escape: keep the backslash as a literal.
                    pattern.push_str(&regex::escape("\\"));
                }
                pattern.push_str(&regex::escape(&c.to_string()));
                escaped = false;
            }
        }
    }
    if escaped {
        pattern.push_str(&regex::escape("\\"));
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| Error::Validation(format!("invalid filter value: {e}")))
}

/// Compile filters once; matching then runs regex-free per exact value.
pub fn compile_filters(filters: &[FilterOption]) -> Result<Vec<CompiledFilter>> {
    filters
        .iter()
        .map(|f| {
            let matchers = f
                .values
                .iter()
                .map(|v| {
                    if has_unescaped_wildcard(v) {
                        Ok(Matcher::Wildcard(wildcard_regex(v)?))
                    } else {
                        Ok(Matcher::Exact(v.replace("\\*", "*")))
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(CompiledFilter {
                column: f.column.clone(),
                matchers,
            })
        })
        .collect()
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_matches(matcher: &Matcher, rendered: &str) -> bool {
    match matcher {
        Matcher::Exact(expected) => expected == rendered,
        Matcher::Wildcard(re) => re.is_match(rendered),
    }
}

/// Whether the client satisfies every filter. Array fields match when any
/// element matches.
pub fn client_matches(client: &Client, filters: &[CompiledFilter]) -> Result<bool> {
    if filters.is_empty() {
        return Ok(true);
    }

    let doc = serde_json::to_value(client)
        .map_err(|e| Error::Internal(format!("failed to render client: {e}")))?;
    let map = match &doc {
        Value::Object(map) => map,
        _ => return Err(Error::Internal("client did not render as object".to_string())),
    };

    for filter in filters {
        let field = map
            .get(&filter.column)
            .ok_or_else(|| Error::Validation(format!("unsupported filter column: {}", filter.column)))?;

        let candidates: Vec<String> = match field {
            Value::Array(items) => items.iter().map(render).collect(),
            other => vec![render(other)],
        };

        let any = filter.matchers.iter().any(|m| {
            candidates
                .iter()
                .any(|candidate| value_matches(m, candidate))
        });
        if !any {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Client {
        Client {
            id: "client-1".to_string(),
            name: "web-01".to_string(),
            os_family: "debian".to_string(),
            tags: vec!["prod".to_string(), "frankfurt".to_string()],
            ..Default::default()
        }
    }

    fn filter(column: &str, values: &[&str]) -> FilterOption {
        FilterOption {
            column: column.to_string(),
            values: values.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn obsolete_depends_on_keep_lost() {
        let mut client = sample();
        assert!(!client.obsolete(Some(Duration::hours(1))));

        client.disconnected_at = Some(Utc::now() - Duration::hours(2));
        assert!(client.obsolete(Some(Duration::hours(1))));
        assert!(!client.obsolete(Some(Duration::hours(3))));
        assert!(!client.obsolete(None));
    }

    #[test]
    fn access_requires_shared_group() {
        let mut client = sample();
        client.allowed_user_groups = vec!["ops".to_string()];

        assert!(client.has_access(&["ops".to_string(), "dev".to_string()]));
        assert!(!client.has_access(&["dev".to_string()]));
        assert!(!client.has_access(&[]));
    }

    #[test]
    fn exact_match() {
        let filters = compile_filters(&[filter("name", &["web-01"])]).unwrap();
        assert!(client_matches(&sample(), &filters).unwrap());

        let filters = compile_filters(&[filter("name", &["web-02"])]).unwrap();
        assert!(!client_matches(&sample(), &filters).unwrap());
    }

    #[test]
    fn wildcard_match_is_anchored() {
        let filters = compile_filters(&[filter("name", &["web*"])]).unwrap();
        assert!(client_matches(&sample(), &filters).unwrap());

        // Anchoring: "eb*" must not match "web-01".
        let filters = compile_filters(&[filter("name", &["eb*"])]).unwrap();
        assert!(!client_matches(&sample(), &filters).unwrap());
    }

    #[test]
    fn leading_wildcard_enables_regex_mode() {
        let filters = compile_filters(&[filter("name", &["*-01"])]).unwrap();
        assert!(client_matches(&sample(), &filters).unwrap());

        let filters = compile_filters(&[filter("name", &["*-02"])]).unwrap();
        assert!(!client_matches(&sample(), &filters).unwrap());
    }

    #[test]
    fn escaped_star_is_literal() {
        let mut client = sample();
        client.name = "literal*name".to_string();

        let filters = compile_filters(&[filter("name", &[r"literal\*name"])]).unwrap();
        assert!(client_matches(&client, &filters).unwrap());

        // The escaped form must not behave as a wildcard.
        let mut other = sample();
        other.name = "literalXname".to_string();
        assert!(!client_matches(&other, &filters).unwrap());
    }

    #[test]
    fn array_fields_match_any_element() {
        let filters = compile_filters(&[filter("tags", &["prod"])]).unwrap();
        assert!(client_matches(&sample(), &filters).unwrap());

        let filters = compile_filters(&[filter("tags", &["frank*"])]).unwrap();
        assert!(client_matches(&sample(), &filters).unwrap());

        let filters = compile_filters(&[filter("tags", &["staging"])]).unwrap();
        assert!(!client_matches(&sample(), &filters).unwrap());
    }

    #[test]
    fn multiple_filters_all_must_hold() {
        let filters = compile_filters(&[
            filter("name", &["web*"]),
            filter("os_family", &["debian"]),
        ])
        .unwrap();
        assert!(client_matches(&sample(), &filters).unwrap());

        let filters = compile_filters(&[
            filter("name", &["web*"]),
            filter("os_family", &["rhel"]),
        ])
        .unwrap();
        assert!(!client_matches(&sample(), &filters).unwrap());
    }

    #[test]
    fn unknown_column_is_a_validation_error() {
        let filters = compile_filters(&[filter("nope", &["x"])]).unwrap();
        let err = client_matches(&sample(), &filters).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn empty_arrays_serialize_as_arrays() {
        let client = Client {
            id: "c".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&client).unwrap();
        assert_eq!(json["tunnels"], serde_json::json!([]));
        assert_eq!(json["ipv4"], serde_json::json!([]));
        assert_eq!(json["disconnected_at"], Value::Null);
    }
}
