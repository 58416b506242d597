use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{ArtifactFormat, StackConfiguration};
use crate::error::{Result, SynthError};
use crate::model::{PropertyValue, ResourceKind, ResourceNode};

pub mod cloudformation;
pub mod terraform;

pub use cloudformation::CloudFormationRenderer;
pub use terraform::TerraformRenderer;

/// Where a rendered declaration lands in the document.
#[derive(Debug, Clone)]
pub enum DeclarationBody {
    /// CloudFormation top-level section (`Parameters`, `Resources`) plus body.
    Json {
        section: &'static str,
        value: serde_json::Value,
    },
    Hcl(String),
}

/// One node rendered into provider syntax.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub logical_id: String,
    pub kind: ResourceKind,
    pub provider_type: String,
    pub physical_name: Option<String>,
    pub body: DeclarationBody,
}

impl Declaration {
    /// sha256 over the rendered fragment; changes whenever the declaration does.
    pub fn fingerprint(&self) -> Result<String> {
        let text = match &self.body {
            DeclarationBody::Json { section, value } => {
                format!("{section}:{}", serde_json::to_string(value)?)
            }
            DeclarationBody::Hcl(text) => text.clone(),
        };
        Ok(sha256_hex(text.as_bytes()))
    }
}

/// Mapping entry recorded in the artifact manifest for diffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMapping {
    pub kind: ResourceKind,
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub physical_name: Option<String>,
    pub fingerprint: String,
}

/// What later declarations may know about a node rendered earlier.
#[derive(Debug, Clone)]
pub struct RenderedNode {
    pub kind: ResourceKind,
    pub provider_type: String,
}

/// Declarations produced so far in the run, keyed by logical id.
#[derive(Debug, Default)]
pub struct RenderContext {
    rendered: IndexMap<String, RenderedNode>,
}

impl RenderContext {
    pub fn get(&self, id: &str) -> Option<&RenderedNode> {
        self.rendered.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rendered.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RenderedNode)> {
        self.rendered
            .iter()
            .map(|(id, rendered)| (id.as_str(), rendered))
    }

    pub fn record(&mut self, declaration: &Declaration) {
        self.rendered.insert(
            declaration.logical_id.clone(),
            RenderedNode {
                kind: declaration.kind,
                provider_type: declaration.provider_type.clone(),
            },
        );
    }
}

/// Provider-specific rendering. Nodes arrive in dependency order with every
/// parameter already substituted, so each referenced node is in the context.
pub trait ProviderRenderer {
    fn format(&self) -> ArtifactFormat;
    fn render(&self, node: &ResourceNode, context: &RenderContext) -> Result<Declaration>;
    fn assemble(
        &self,
        stack_name: &str,
        config: &StackConfiguration,
        declarations: &[Declaration],
    ) -> Result<String>;
}

pub fn renderer_for(format: ArtifactFormat) -> Box<dyn ProviderRenderer> {
    match format {
        ArtifactFormat::Cloudformation => Box::new(CloudFormationRenderer::json()),
        ArtifactFormat::CloudformationYaml => Box::new(CloudFormationRenderer::yaml()),
        ArtifactFormat::Terraform => Box::new(TerraformRenderer),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{:x}", hasher.finalize())
}

/// Name the provider will give the resource, when the stack pins one.
pub fn physical_name(node: &ResourceNode) -> Option<String> {
    ["instance_name", "group_name", "role_name", "policy_name"]
        .iter()
        .find_map(|name| node.property(name).and_then(PropertyValue::as_str))
        .map(str::to_string)
}

pub(crate) fn required_str<'a>(node: &'a ResourceNode, name: &str) -> Result<&'a str> {
    node.property(name)
        .and_then(PropertyValue::as_str)
        .ok_or_else(|| SynthError::validation(&node.id, format!("property '{name}' must be a string")))
}

pub(crate) fn required_number(node: &ResourceNode, name: &str) -> Result<i64> {
    match node.property(name) {
        Some(PropertyValue::Number(value)) => Ok(*value),
        _ => Err(SynthError::validation(
            &node.id,
            format!("property '{name}' must be a number"),
        )),
    }
}

pub(crate) fn list<'a>(node: &'a ResourceNode, name: &str) -> &'a [PropertyValue] {
    match node.property(name) {
        Some(PropertyValue::List(items)) => items,
        _ => &[],
    }
}

/// `snake_case` property name to CloudFormation `PascalCase`.
pub(crate) fn pascal_case(name: &str) -> String {
    name.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// Logical id (`OllamaSecurityGroup`) to Terraform name (`ollama_security_group`).
pub(crate) fn snake_case(id: &str) -> String {
    let mut out = String::with_capacity(id.len() + 4);
    let mut previous: Option<char> = None;
    for c in id.chars() {
        if c.is_ascii_uppercase() {
            if previous.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit()) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
        previous = Some(c);
    }
    out
}
