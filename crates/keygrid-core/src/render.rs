//! Role configuration renderer.
//!
//! Turns a role's boot script template into the [`BootPayload`] a node
//! consumes on first start. Rendering is pure: the same role, tag, and
//! parameters always produce a byte-identical payload.
//!
//! Placeholders use `{{ name }}`. Names resolve against, in increasing
//! precedence: the caller's parameters, the role's own parameters, and the
//! built-ins `role`, `cluster_tag_key`, `cluster_tag_value`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use thiserror::Error;
use tracing::debug;

use crate::types::{BootPayload, DiscoveryTag, Role};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_.-]*)\s*\}\}").expect("placeholder pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("role {role}: missing template parameter(s): {}", .names.join(", "))]
    MissingParameter { role: String, names: Vec<String> },

    #[error("role {role}: discovery tag must have a non-empty key and value (got {tag})")]
    InvalidTag { role: String, tag: String },
}

/// Render the boot payload for `role`, discoverable under `tag`.
pub fn render(
    role: &Role,
    tag: &DiscoveryTag,
    params: &BTreeMap<String, String>,
) -> Result<BootPayload, RenderError> {
    if tag.is_empty() {
        return Err(RenderError::InvalidTag {
            role: role.name.clone(),
            tag: tag.to_string(),
        });
    }

    let mut bindings: BTreeMap<&str, &str> = BTreeMap::new();
    for (k, v) in params.iter().chain(role.params.iter()) {
        bindings.insert(k, v);
    }
    bindings.insert("role", &role.name);
    bindings.insert("cluster_tag_key", &tag.key);
    bindings.insert("cluster_tag_value", &tag.value);

    let missing = unbound_names(&role.payload_template, &bindings);
    if !missing.is_empty() {
        return Err(RenderError::MissingParameter {
            role: role.name.clone(),
            names: missing,
        });
    }

    let script = PLACEHOLDER
        .replace_all(&role.payload_template, |caps: &Captures<'_>| {
            bindings.get(&caps[1]).copied().unwrap_or_default().to_string()
        })
        .into_owned();

    let payload = BootPayload::new(
        &role.name,
        tag,
        role.boot_policy,
        role.discovery_retry,
        script,
    );
    debug!(role = %role.name, %tag, digest = %payload.digest, "boot payload rendered");
    Ok(payload)
}

/// Placeholder names used by a template, in order of first appearance.
pub fn template_names(template: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in PLACEHOLDER.captures_iter(template) {
        let name = &caps[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

fn unbound_names(template: &str, bindings: &BTreeMap<&str, &str>) -> Vec<String> {
    template_names(template)
        .into_iter()
        .filter(|name| !bindings.contains_key(name.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::types::{BootPolicy, RoleKind};

    fn test_role(template: &str) -> Role {
        Role {
            name: "consul".to_string(),
            cluster: "prod".to_string(),
            kind: RoleKind::Coordination,
            desired_size: 3,
            instance_class: "t3.small".to_string(),
            image_id: "ami-1".to_string(),
            zones: vec!["a".to_string()],
            discovery_tag: DiscoveryTag::new("consul-cluster", "prod"),
            payload_template: template.to_string(),
            params: BTreeMap::new(),
            boot_policy: BootPolicy::ProceedEmpty,
            discovery_retry: RetryPolicy::default(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_builtins_and_params() {
        let role = test_role(
            "run-consul --server --cluster-tag-key {{cluster_tag_key}} --cluster-tag-value {{ cluster_tag_value }} --dc {{datacenter}}",
        );
        let tag = role.discovery_tag.clone();
        let payload = render(&role, &tag, &params(&[("datacenter", "dc1")])).unwrap();
        assert_eq!(
            payload.script,
            "run-consul --server --cluster-tag-key consul-cluster --cluster-tag-value prod --dc dc1"
        );
        assert_eq!(payload.cluster_tag_key, "consul-cluster");
        assert_eq!(payload.cluster_tag_value, "prod");
        assert_eq!(payload.role, "consul");
    }

    #[test]
    fn rendering_is_deterministic() {
        let role = test_role("{{role}} {{a}} {{b}} {{a}}");
        let tag = role.discovery_tag.clone();
        let p = params(&[("b", "2"), ("a", "1")]);

        let first = render(&role, &tag, &p).unwrap();
        for _ in 0..10 {
            let again = render(&role, &tag, &p).unwrap();
            assert_eq!(again.script.as_bytes(), first.script.as_bytes());
            assert_eq!(again.to_json().unwrap(), first.to_json().unwrap());
        }
    }

    #[test]
    fn missing_parameters_are_all_reported_in_order() {
        let role = test_role("{{zeta}} {{role}} {{alpha}} {{zeta}}");
        let tag = role.discovery_tag.clone();
        let err = render(&role, &tag, &BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            RenderError::MissingParameter {
                role: "consul".to_string(),
                names: vec!["zeta".to_string(), "alpha".to_string()],
            }
        );
    }

    #[test]
    fn role_params_override_caller_params() {
        let mut role = test_role("{{region}}");
        role.params.insert("region".to_string(), "eu-west-1".to_string());
        let tag = role.discovery_tag.clone();
        let payload = render(&role, &tag, &params(&[("region", "us-east-1")])).unwrap();
        assert_eq!(payload.script, "eu-west-1");
    }

    #[test]
    fn builtins_cannot_be_shadowed() {
        let role = test_role("{{cluster_tag_value}}");
        let tag = role.discovery_tag.clone();
        let payload = render(&role, &tag, &params(&[("cluster_tag_value", "evil")])).unwrap();
        assert_eq!(payload.script, "prod");
    }

    #[test]
    fn empty_tag_is_rejected() {
        let role = test_role("x");
        let err = render(&role, &DiscoveryTag::new("consul-cluster", ""), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, RenderError::InvalidTag { .. }));
    }

    #[test]
    fn template_names_dedupes() {
        assert_eq!(
            template_names("{{a}} {{ b }} {{a}} {not} {{c.d}}"),
            vec!["a".to_string(), "b".to_string(), "c.d".to_string()]
        );
    }

    #[test]
    fn tag_argument_drives_payload_not_role_tag() {
        let role = test_role("{{cluster_tag_value}}");
        let tag = DiscoveryTag::new("consul-cluster", "blue");
        let payload = render(&role, &tag, &BTreeMap::new()).unwrap();
        assert_eq!(payload.script, "blue");
        assert_eq!(payload.tag(), tag);
    }
}
