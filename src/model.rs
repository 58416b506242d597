use std::collections::BTreeMap;
use std::fmt;

use indexmap::IndexMap;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};

/// Infrastructure object classes understood by the synthesizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    SecurityGroup,
    Role,
    Policy,
    InstanceProfile,
    Instance,
    Volume,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::Role => "role",
            ResourceKind::Policy => "policy",
            ResourceKind::InstanceProfile => "instance_profile",
            ResourceKind::Instance => "instance",
            ResourceKind::Volume => "volume",
        }
    }

    /// Known properties for the kind. Properties outside the schema are passed
    /// through to the renderer untouched.
    pub fn schema(&self) -> &'static [PropertySpec] {
        match self {
            ResourceKind::Network => NETWORK_SCHEMA,
            ResourceKind::SecurityGroup => SECURITY_GROUP_SCHEMA,
            ResourceKind::Role => ROLE_SCHEMA,
            ResourceKind::Policy => POLICY_SCHEMA,
            ResourceKind::InstanceProfile => INSTANCE_PROFILE_SCHEMA,
            ResourceKind::Instance => INSTANCE_SCHEMA,
            ResourceKind::Volume => VOLUME_SCHEMA,
        }
    }
}

const NETWORK_SCHEMA: &[PropertySpec] = &[
    PropertySpec::optional("existing", ValueType::Bool),
    PropertySpec::optional("network_id", ValueType::String),
    PropertySpec::optional("cidr_block", ValueType::String),
];

const SECURITY_GROUP_SCHEMA: &[PropertySpec] = &[
    PropertySpec::required("group_name", ValueType::String),
    PropertySpec::required("network", ValueType::Ref),
    PropertySpec::optional("description", ValueType::String),
    PropertySpec::optional("allow_all_outbound", ValueType::Bool),
];

const ROLE_SCHEMA: &[PropertySpec] = &[
    PropertySpec::required("role_name", ValueType::String),
    PropertySpec::required("assumed_by", ValueType::String),
    PropertySpec::optional("description", ValueType::String),
    PropertySpec::optional("managed_policy_arns", ValueType::List),
];

const POLICY_SCHEMA: &[PropertySpec] = &[
    PropertySpec::required("policy_name", ValueType::String),
    PropertySpec::required("statements", ValueType::List),
    PropertySpec::required("roles", ValueType::List),
];

const INSTANCE_PROFILE_SCHEMA: &[PropertySpec] =
    &[PropertySpec::required("roles", ValueType::List)];

const INSTANCE_SCHEMA: &[PropertySpec] = &[
    PropertySpec::required("instance_type", ValueType::String),
    PropertySpec::required("machine_image", ValueType::String),
    PropertySpec::optional("instance_name", ValueType::String),
    PropertySpec::optional("key_name", ValueType::String),
    PropertySpec::optional("security_groups", ValueType::List),
    PropertySpec::optional("instance_profile", ValueType::Ref),
    PropertySpec::optional("launch_template", ValueType::Ref),
    PropertySpec::optional("user_data", ValueType::String),
];

const VOLUME_SCHEMA: &[PropertySpec] = &[
    PropertySpec::required("device_name", ValueType::String),
    PropertySpec::required("size_gib", ValueType::Number),
    PropertySpec::optional("volume_type", ValueType::String),
    PropertySpec::optional("delete_on_termination", ValueType::Bool),
];

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Bool,
    Ref,
    List,
    Map,
}

impl ValueType {
    fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Bool => "boolean",
            ValueType::Ref => "reference",
            ValueType::List => "list",
            ValueType::Map => "map",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
    pub name: &'static str,
    pub value_type: ValueType,
    pub required: bool,
}

impl PropertySpec {
    const fn required(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            required: true,
        }
    }

    const fn optional(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            required: false,
        }
    }
}

/// Edge from a property to another resource. `attribute` selects a named
/// output of the target; `None` means the provider's default identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum PropertyValue {
    String(String),
    Number(i64),
    Bool(bool),
    Ref(Reference),
    /// Placeholder resolved from the stack configuration during synthesis.
    Parameter(String),
    List(Vec<PropertyValue>),
    Map(IndexMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn reference(target: impl Into<String>) -> Self {
        PropertyValue::Ref(Reference {
            target: target.into(),
            attribute: None,
        })
    }

    pub fn attribute(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        PropertyValue::Ref(Reference {
            target: target.into(),
            attribute: Some(attribute.into()),
        })
    }

    pub fn parameter(name: impl Into<String>) -> Self {
        PropertyValue::Parameter(name.into())
    }

    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<PropertyValue>,
    {
        PropertyValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, PropertyValue)>,
        K: Into<String>,
    {
        PropertyValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Parameters are typed by whatever the configuration yields, so they
    /// satisfy any scalar slot.
    fn matches(&self, expected: ValueType) -> bool {
        match (self, expected) {
            (PropertyValue::Parameter(_), ValueType::String | ValueType::Number | ValueType::Bool) => {
                true
            }
            (PropertyValue::String(_), ValueType::String)
            | (PropertyValue::Number(_), ValueType::Number)
            | (PropertyValue::Bool(_), ValueType::Bool)
            | (PropertyValue::Ref(_), ValueType::Ref)
            | (PropertyValue::List(_), ValueType::List)
            | (PropertyValue::Map(_), ValueType::Map) => true,
            _ => false,
        }
    }

    /// Every reference nested anywhere inside this value, in document order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            PropertyValue::Ref(reference) => found.push(reference),
            PropertyValue::List(items) => {
                for item in items {
                    item.collect_references(found);
                }
            }
            PropertyValue::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(found);
                }
            }
            _ => {}
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

pub type Properties = IndexMap<String, PropertyValue>;

/// Build a property map from literal pairs, keeping declaration order.
pub fn props<const N: usize>(entries: [(&str, PropertyValue); N]) -> Properties {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub port: u16,
    pub protocol: Protocol,
    pub source: IpNet,
    pub description: String,
}

impl IngressRule {
    pub fn tcp(port: u16, source: IpNet, description: impl Into<String>) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
            source,
            description: description.into(),
        }
    }

    fn key(&self) -> (u16, Protocol, IpNet) {
        (self.port, self.protocol, self.source)
    }
}

/// Ingress rules keyed by (port, protocol, source). The first description
/// registered for a key wins; iteration order is the key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressRules {
    rules: BTreeMap<(u16, Protocol, IpNet), IngressRule>,
}

impl IngressRules {
    /// Returns false when an equivalent rule is already present.
    pub fn insert(&mut self, rule: IngressRule) -> bool {
        let key = rule.key();
        if self.rules.contains_key(&key) {
            return false;
        }
        self.rules.insert(key, rule);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &IngressRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Serialize for IngressRules {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.rules.values())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceNode {
    pub id: String,
    pub kind: ResourceKind,
    pub properties: Properties,
    #[serde(skip_serializing_if = "IngressRules::is_empty")]
    pub ingress: IngressRules,
}

impl ResourceNode {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// (property name, reference) pairs in declaration order.
    pub fn references(&self) -> Vec<(&str, &Reference)> {
        self.properties
            .iter()
            .flat_map(|(name, value)| {
                value
                    .references()
                    .into_iter()
                    .map(move |reference| (name.as_str(), reference))
            })
            .collect()
    }
}

/// The set of resources synthesized together as one deployable unit.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    name: String,
    nodes: IndexMap<String, ResourceNode>,
}

impl Stack {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and register a resource. References may point forward; they
    /// are checked once the whole stack is declared, when the graph is built.
    pub fn define_resource(
        &mut self,
        id: impl Into<String>,
        kind: ResourceKind,
        properties: Properties,
    ) -> Result<&ResourceNode> {
        let id = id.into();
        validate_id(&id)?;
        if self.nodes.contains_key(&id) {
            return Err(SynthError::DuplicateId(id));
        }
        validate_properties(&id, kind, &properties)?;

        let node = ResourceNode {
            id: id.clone(),
            kind,
            properties,
            ingress: IngressRules::default(),
        };
        let (index, _) = self.nodes.insert_full(id, node);
        Ok(&self.nodes[index])
    }

    /// Attach an ingress rule to a security group. Returns false when the
    /// rule collapsed into an existing one.
    pub fn add_ingress_rule(&mut self, id: &str, rule: IngressRule) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| SynthError::validation(id, "ingress rule targets unknown resource"))?;
        if node.kind != ResourceKind::SecurityGroup {
            return Err(SynthError::validation(
                id,
                format!("ingress rules require a security_group, found {}", node.kind),
            ));
        }
        Ok(node.ingress.insert(rule))
    }

    pub fn get(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    pub fn get_index(&self, index: usize) -> Option<&ResourceNode> {
        self.nodes.get_index(index).map(|(_, node)| node)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.nodes.get_index_of(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn validate_id(id: &str) -> Result<()> {
    let mut chars = id.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_with_letter || !chars.all(|c| c.is_ascii_alphanumeric()) || id.len() > 255 {
        return Err(SynthError::validation(
            id,
            "ids must start with a letter and contain only ASCII letters and digits",
        ));
    }
    Ok(())
}

fn validate_properties(id: &str, kind: ResourceKind, properties: &Properties) -> Result<()> {
    for spec in kind.schema() {
        match properties.get(spec.name) {
            None if spec.required => {
                return Err(SynthError::validation(
                    id,
                    format!("{kind} requires property '{}'", spec.name),
                ));
            }
            Some(value) if !value.matches(spec.value_type) => {
                return Err(SynthError::validation(
                    id,
                    format!(
                        "property '{}' must be a {}",
                        spec.name,
                        spec.value_type.as_str()
                    ),
                ));
            }
            _ => {}
        }
    }

    if kind == ResourceKind::Network {
        let existing = properties
            .get("existing")
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false);
        if !existing && !properties.contains_key("cidr_block") {
            return Err(SynthError::validation(
                id,
                "network requires either existing = true or a cidr_block",
            ));
        }
    }

    Ok(())
}
