use std::fmt::Write;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};

use crate::config::{ArtifactFormat, StackConfiguration};
use crate::error::{Result, SynthError};
use crate::model::{IngressRule, PropertyValue, Reference, ResourceKind, ResourceNode};
use crate::providers::{
    Declaration, DeclarationBody, ProviderRenderer, RenderContext, list, pascal_case,
    physical_name, required_number, required_str, snake_case,
};

const POLICY_VERSION: &str = "2012-10-17";
const EXISTING_VPC_TYPE: &str = "data.aws_vpc";

/// Terraform / OpenTofu HCL renderer for the AWS provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerraformRenderer;

impl ProviderRenderer for TerraformRenderer {
    fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Terraform
    }

    fn render(&self, node: &ResourceNode, context: &RenderContext) -> Result<Declaration> {
        let writer = NodeWriter { node, context };
        let (provider_type, block) = match node.kind {
            ResourceKind::Network => writer.network()?,
            ResourceKind::SecurityGroup => ("aws_security_group", writer.security_group()?),
            ResourceKind::Role => ("aws_iam_role", writer.role()?),
            ResourceKind::Policy => ("aws_iam_role_policy", writer.policy()?),
            ResourceKind::InstanceProfile => {
                ("aws_iam_instance_profile", writer.instance_profile()?)
            }
            ResourceKind::Instance => ("aws_instance", writer.instance()?),
            ResourceKind::Volume => ("aws_launch_template", writer.volume()?),
        };
        let name = writer.name();
        if let Some((other, _)) = context.iter().find(|(other, rendered)| {
            rendered.provider_type == provider_type && snake_case(other) == name
        }) {
            return Err(SynthError::validation(
                &node.id,
                format!("address {provider_type}.{name} is already taken by {other}"),
            ));
        }
        Ok(Declaration {
            logical_id: node.id.clone(),
            kind: node.kind,
            provider_type: provider_type.to_string(),
            physical_name: physical_name(node),
            body: DeclarationBody::Hcl(block),
        })
    }

    fn assemble(
        &self,
        stack_name: &str,
        config: &StackConfiguration,
        declarations: &[Declaration],
    ) -> Result<String> {
        let mut buffer = String::new();
        writeln!(
            &mut buffer,
            "# Terraform for stack `{}` ({} variant), synthesized by stack-synth",
            stack_name,
            if config.use_gpu { "gpu" } else { "cpu" }
        )
        .ok();
        writeln!(
            &mut buffer,
            "terraform {{\n  required_providers {{\n    aws = {{\n      source = \"hashicorp/aws\"\n    }}\n  }}\n}}\n"
        )
        .ok();
        writeln!(
            &mut buffer,
            "provider \"aws\" {{\n  region = {}\n}}",
            quote(&config.region)
        )
        .ok();

        for declaration in declarations {
            let DeclarationBody::Hcl(block) = &declaration.body else {
                return Err(SynthError::Other(format!(
                    "{} was not rendered as HCL",
                    declaration.logical_id
                )));
            };
            buffer.push('\n');
            buffer.push_str(block);
        }

        for declaration in declarations
            .iter()
            .filter(|declaration| declaration.kind == ResourceKind::Instance)
        {
            let name = snake_case(&declaration.logical_id);
            writeln!(
                &mut buffer,
                "\noutput \"{name}_id\" {{\n  value = aws_instance.{name}.id\n}}"
            )
            .ok();
            writeln!(
                &mut buffer,
                "\noutput \"{name}_public_ip\" {{\n  value = aws_instance.{name}.public_ip\n}}"
            )
            .ok();
        }

        Ok(buffer)
    }
}

struct NodeWriter<'a> {
    node: &'a ResourceNode,
    context: &'a RenderContext,
}

impl NodeWriter<'_> {
    fn name(&self) -> String {
        snake_case(&self.node.id)
    }

    fn flag(&self, property: &str, default: bool) -> bool {
        self.node
            .property(property)
            .and_then(PropertyValue::as_bool)
            .unwrap_or(default)
    }

    fn network(&self) -> Result<(&'static str, String)> {
        let name = self.name();
        let mut block = String::new();
        if self.flag("existing", false) {
            writeln!(&mut block, "data \"aws_vpc\" \"{name}\" {{").ok();
            match self.node.property("network_id").and_then(PropertyValue::as_str) {
                Some(id) => writeln!(&mut block, "  id = {}", quote(id)).ok(),
                None => writeln!(&mut block, "  default = true").ok(),
            };
            writeln!(&mut block, "}}").ok();
            return Ok((EXISTING_VPC_TYPE, block));
        }

        writeln!(&mut block, "resource \"aws_vpc\" \"{name}\" {{").ok();
        writeln!(
            &mut block,
            "  cidr_block = {}",
            quote(required_str(self.node, "cidr_block")?)
        )
        .ok();
        writeln!(&mut block, "  enable_dns_support = true").ok();
        writeln!(&mut block, "  enable_dns_hostnames = true").ok();
        self.extra_attributes(&mut block)?;
        writeln!(&mut block, "}}").ok();
        Ok(("aws_vpc", block))
    }

    fn security_group(&self) -> Result<String> {
        let node = self.node;
        let group_name = required_str(node, "group_name")?;
        let description = node
            .property("description")
            .and_then(PropertyValue::as_str)
            .unwrap_or(group_name);
        let network = node
            .property("network")
            .ok_or_else(|| SynthError::validation(&node.id, "missing property 'network'"))?;

        let mut block = String::new();
        writeln!(&mut block, "resource \"aws_security_group\" \"{}\" {{", self.name()).ok();
        writeln!(&mut block, "  name = {}", quote(group_name)).ok();
        writeln!(&mut block, "  description = {}", quote(description)).ok();
        writeln!(&mut block, "  vpc_id = {}", self.value(network)?).ok();
        for rule in node.ingress.iter() {
            block.push_str(&ingress_block(rule));
        }
        if self.flag("allow_all_outbound", false) {
            writeln!(&mut block, "\n  egress {{").ok();
            writeln!(&mut block, "    from_port = 0\n    to_port = 0\n    protocol = \"-1\"").ok();
            writeln!(&mut block, "    cidr_blocks = [\"0.0.0.0/0\"]").ok();
            writeln!(&mut block, "  }}").ok();
        }
        self.extra_attributes(&mut block)?;
        writeln!(&mut block, "}}").ok();
        Ok(block)
    }

    fn role(&self) -> Result<String> {
        let node = self.node;
        let assume = json!({
            "Version": POLICY_VERSION,
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": escape_templates(required_str(node, "assumed_by")?) },
                "Action": "sts:AssumeRole",
            }],
        });

        let mut block = String::new();
        writeln!(&mut block, "resource \"aws_iam_role\" \"{}\" {{", self.name()).ok();
        writeln!(&mut block, "  name = {}", quote(required_str(node, "role_name")?)).ok();
        if let Some(description) = node.property("description") {
            writeln!(&mut block, "  description = {}", self.value(description)?).ok();
        }
        writeln!(
            &mut block,
            "  assume_role_policy = {}",
            heredoc(&serde_json::to_string_pretty(&assume)?)
        )
        .ok();
        let managed = list(node, "managed_policy_arns");
        if !managed.is_empty() {
            writeln!(&mut block, "  managed_policy_arns = {}", self.values(managed)?).ok();
        }
        self.extra_attributes(&mut block)?;
        writeln!(&mut block, "}}").ok();
        Ok(block)
    }

    /// Inline role policy; one block per attached role.
    fn policy(&self) -> Result<String> {
        let node = self.node;
        let statements = list(node, "statements")
            .iter()
            .map(|statement| self.statement(statement))
            .collect::<Result<Vec<_>>>()?;
        if statements.is_empty() {
            return Err(SynthError::validation(&node.id, "policy has no statements"));
        }
        let roles = list(node, "roles");
        if roles.is_empty() {
            return Err(SynthError::validation(
                &node.id,
                "policy must attach to at least one role",
            ));
        }
        let document = serde_json::to_string_pretty(
            &json!({ "Version": POLICY_VERSION, "Statement": statements }),
        )?;
        let policy_name = required_str(node, "policy_name")?;

        let base = self.name();
        let mut block = String::new();
        for (index, role) in roles.iter().enumerate() {
            let name = if roles.len() == 1 {
                base.clone()
            } else {
                format!("{base}_{index}")
            };
            if index > 0 {
                block.push('\n');
            }
            writeln!(&mut block, "resource \"aws_iam_role_policy\" \"{name}\" {{").ok();
            writeln!(&mut block, "  name = {}", quote(policy_name)).ok();
            writeln!(&mut block, "  role = {}", self.value(role)?).ok();
            writeln!(&mut block, "  policy = {}", heredoc(&document)).ok();
            writeln!(&mut block, "}}").ok();
        }
        Ok(block)
    }

    fn instance_profile(&self) -> Result<String> {
        let [role] = list(self.node, "roles") else {
            return Err(SynthError::validation(
                &self.node.id,
                "terraform instance profiles take exactly one role",
            ));
        };
        let mut block = String::new();
        writeln!(&mut block, "resource \"aws_iam_instance_profile\" \"{}\" {{", self.name()).ok();
        writeln!(&mut block, "  role = {}", self.value(role)?).ok();
        self.extra_attributes(&mut block)?;
        writeln!(&mut block, "}}").ok();
        Ok(block)
    }

    fn volume(&self) -> Result<String> {
        let node = self.node;
        let mut block = String::new();
        writeln!(&mut block, "resource \"aws_launch_template\" \"{}\" {{", self.name()).ok();
        writeln!(&mut block, "  block_device_mappings {{").ok();
        writeln!(
            &mut block,
            "    device_name = {}",
            quote(required_str(node, "device_name")?)
        )
        .ok();
        writeln!(&mut block, "    ebs {{").ok();
        writeln!(&mut block, "      volume_size = {}", required_number(node, "size_gib")?).ok();
        if let Some(volume_type) = node.property("volume_type") {
            writeln!(&mut block, "      volume_type = {}", self.value(volume_type)?).ok();
        }
        writeln!(
            &mut block,
            "      delete_on_termination = {}",
            self.flag("delete_on_termination", true)
        )
        .ok();
        writeln!(&mut block, "    }}\n  }}").ok();
        self.extra_attributes(&mut block)?;
        writeln!(&mut block, "}}").ok();
        Ok(block)
    }

    fn instance(&self) -> Result<String> {
        let node = self.node;
        let mut block = String::new();
        writeln!(&mut block, "resource \"aws_instance\" \"{}\" {{", self.name()).ok();
        writeln!(&mut block, "  ami = {}", quote(required_str(node, "machine_image")?)).ok();
        writeln!(
            &mut block,
            "  instance_type = {}",
            quote(required_str(node, "instance_type")?)
        )
        .ok();
        if let Some(key) = node.property("key_name") {
            writeln!(&mut block, "  key_name = {}", self.value(key)?).ok();
        }
        let groups = list(node, "security_groups");
        if !groups.is_empty() {
            writeln!(&mut block, "  vpc_security_group_ids = {}", self.values(groups)?).ok();
        }
        if let Some(profile) = node.property("instance_profile") {
            writeln!(&mut block, "  iam_instance_profile = {}", self.value(profile)?).ok();
        }
        if let Some(template) = node.property("launch_template") {
            writeln!(&mut block, "\n  launch_template {{").ok();
            writeln!(&mut block, "    id = {}", self.value(template)?).ok();
            writeln!(&mut block, "    version = \"$Latest\"").ok();
            writeln!(&mut block, "  }}\n").ok();
        }
        if let Some(script) = node.property("user_data").and_then(PropertyValue::as_str) {
            writeln!(
                &mut block,
                "  user_data_base64 = {}",
                quote(&STANDARD.encode(script))
            )
            .ok();
        }
        if let Some(name) = node.property("instance_name").and_then(PropertyValue::as_str) {
            writeln!(&mut block, "  tags = {{\n    Name = {}\n  }}", quote(name)).ok();
        }
        self.extra_attributes(&mut block)?;
        writeln!(&mut block, "}}").ok();
        Ok(block)
    }

    /// Properties outside the kind's schema pass through as attributes.
    fn extra_attributes(&self, block: &mut String) -> Result<()> {
        for (name, value) in &self.node.properties {
            if self.node.kind.schema().iter().any(|spec| spec.name == name) {
                continue;
            }
            writeln!(block, "  {name} = {}", self.value(value)?).ok();
        }
        Ok(())
    }

    /// Address of an already-rendered node plus the attribute read from it.
    fn reference(&self, reference: &Reference) -> Result<String> {
        let target = self.context.get(&reference.target).ok_or_else(|| {
            SynthError::Other(format!(
                "{} references {} before it was rendered",
                self.node.id, reference.target
            ))
        })?;
        let attribute = match &reference.attribute {
            Some(attribute) => snake_case(attribute),
            None => default_attribute(target.kind).to_string(),
        };
        Ok(format!(
            "{}.{}.{}",
            target.provider_type,
            snake_case(&reference.target),
            attribute
        ))
    }

    fn value(&self, value: &PropertyValue) -> Result<String> {
        Ok(match value {
            PropertyValue::String(text) => quote(text),
            PropertyValue::Number(number) => number.to_string(),
            PropertyValue::Bool(flag) => flag.to_string(),
            PropertyValue::Ref(reference) => self.reference(reference)?,
            PropertyValue::Parameter(name) => return Err(self.unresolved(name)),
            PropertyValue::List(items) => self.values(items)?,
            PropertyValue::Map(entries) => {
                let rendered = entries
                    .iter()
                    .map(|(key, value)| Ok(format!("{key} = {}", self.value(value)?)))
                    .collect::<Result<Vec<_>>>()?;
                format!("{{ {} }}", rendered.join(", "))
            }
        })
    }

    fn values(&self, items: &[PropertyValue]) -> Result<String> {
        let rendered = items
            .iter()
            .map(|item| self.value(item))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!("[{}]", rendered.join(", ")))
    }

    /// Policy JSON for heredocs; references become `${...}` interpolations,
    /// literal strings keep their template sequences escaped.
    fn json(&self, value: &PropertyValue) -> Result<Value> {
        Ok(match value {
            PropertyValue::String(text) => json!(escape_templates(text)),
            PropertyValue::Number(number) => json!(number),
            PropertyValue::Bool(flag) => json!(flag),
            PropertyValue::Ref(reference) => json!(format!("${{{}}}", self.reference(reference)?)),
            PropertyValue::Parameter(name) => return Err(self.unresolved(name)),
            PropertyValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.json(item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            PropertyValue::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(pascal_case(key), self.json(value)?);
                }
                Value::Object(map)
            }
        })
    }

    fn statement(&self, statement: &PropertyValue) -> Result<Value> {
        let PropertyValue::Map(entries) = statement else {
            return Err(SynthError::validation(
                &self.node.id,
                "policy statements must be maps",
            ));
        };
        let mut map = Map::new();
        map.insert("Effect".into(), json!("Allow"));
        for (key, value) in entries {
            let key = match key.as_str() {
                "effect" => "Effect".to_string(),
                "actions" => "Action".to_string(),
                "resources" => "Resource".to_string(),
                other => pascal_case(other),
            };
            map.insert(key, self.json(value)?);
        }
        Ok(Value::Object(map))
    }

    fn unresolved(&self, name: &str) -> SynthError {
        SynthError::UnknownParameter {
            resource: self.node.id.clone(),
            parameter: name.to_string(),
        }
    }
}

/// Attribute a bare reference resolves to: IAM consumers want names,
/// everything else wants ids.
fn default_attribute(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Role | ResourceKind::InstanceProfile | ResourceKind::Policy => "name",
        _ => "id",
    }
}

fn ingress_block(rule: &IngressRule) -> String {
    let cidr_attr = match rule.source {
        ipnet::IpNet::V4(_) => "cidr_blocks",
        ipnet::IpNet::V6(_) => "ipv6_cidr_blocks",
    };
    format!(
        "\n  ingress {{\n    description = {}\n    from_port = {port}\n    to_port = {port}\n    protocol = \"{}\"\n    {cidr_attr} = [{}]\n  }}\n",
        quote(&rule.description),
        rule.protocol.as_str(),
        quote(&rule.source.to_string()),
        port = rule.port,
    )
}

/// HCL string literal; template sequences are escaped so values stay literal.
fn quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n");
    format!("\"{}\"", escape_templates(&escaped))
}

/// `${` and `%{` open interpolations and directives in both quoted strings
/// and heredocs.
fn escape_templates(value: &str) -> String {
    value.replace("${", "$${").replace("%{", "%%{")
}

fn heredoc(body: &str) -> String {
    format!("<<EOT\n{body}\nEOT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stack, props};

    fn render_all(stack: &Stack) -> Vec<Declaration> {
        let mut context = RenderContext::default();
        let mut out = Vec::new();
        for node in stack.nodes() {
            let declaration = TerraformRenderer.render(node, &context).unwrap();
            context.record(&declaration);
            out.push(declaration);
        }
        out
    }

    fn hcl(declaration: &Declaration) -> &str {
        match &declaration.body {
            DeclarationBody::Hcl(text) => text,
            DeclarationBody::Json { .. } => panic!("expected hcl"),
        }
    }

    #[test]
    fn references_resolve_to_rendered_addresses() {
        let mut stack = Stack::new("Test");
        stack
            .define_resource("DefaultVpc", ResourceKind::Network, props([("existing", true.into())]))
            .unwrap();
        stack
            .define_resource(
                "WebRole",
                ResourceKind::Role,
                props([
                    ("role_name", "web".into()),
                    ("assumed_by", "ec2.amazonaws.com".into()),
                ]),
            )
            .unwrap();
        stack
            .define_resource(
                "WebProfile",
                ResourceKind::InstanceProfile,
                props([("roles", PropertyValue::list([PropertyValue::reference("WebRole")]))]),
            )
            .unwrap();
        stack
            .define_resource(
                "WebSg",
                ResourceKind::SecurityGroup,
                props([
                    ("group_name", "web".into()),
                    ("network", PropertyValue::reference("DefaultVpc")),
                ]),
            )
            .unwrap();

        let declarations = render_all(&stack);
        assert!(hcl(&declarations[0]).contains("data \"aws_vpc\" \"default_vpc\""));
        assert!(hcl(&declarations[0]).contains("default = true"));
        assert!(hcl(&declarations[2]).contains("role = aws_iam_role.web_role.name"));
        assert!(hcl(&declarations[3]).contains("vpc_id = data.aws_vpc.default_vpc.id"));
    }

    #[test]
    fn reference_to_unrendered_node_fails() {
        let mut stack = Stack::new("Test");
        stack
            .define_resource(
                "WebProfile",
                ResourceKind::InstanceProfile,
                props([("roles", PropertyValue::list([PropertyValue::reference("WebRole")]))]),
            )
            .unwrap();
        let err = TerraformRenderer
            .render(stack.get("WebProfile").unwrap(), &RenderContext::default())
            .unwrap_err();
        assert!(err.to_string().contains("before it was rendered"), "{err}");
    }

    #[test]
    fn quoting_neutralizes_template_sequences() {
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("${var.x}"), "\"$${var.x}\"");
        assert_eq!(quote("line\nbreak"), "\"line\\nbreak\"");
    }

    fn vpc(stack: &mut Stack, id: &str) {
        stack
            .define_resource(id, ResourceKind::Network, props([("cidr_block", "10.0.0.0/16".into())]))
            .unwrap();
    }

    #[test]
    fn policy_variables_stay_literal_in_heredocs() {
        let mut stack = Stack::new("Test");
        stack
            .define_resource(
                "WebRole",
                ResourceKind::Role,
                props([
                    ("role_name", "web".into()),
                    ("assumed_by", "ec2.amazonaws.com".into()),
                ]),
            )
            .unwrap();
        stack
            .define_resource(
                "WeightsPolicy",
                ResourceKind::Policy,
                props([
                    ("policy_name", "weights".into()),
                    (
                        "statements",
                        PropertyValue::list([PropertyValue::map([
                            ("actions", PropertyValue::list(["s3:GetObject"])),
                            (
                                "resources",
                                PropertyValue::list([
                                    PropertyValue::from("arn:aws:s3:::weights/${aws:username}/*"),
                                    PropertyValue::attribute("WebRole", "Arn"),
                                ]),
                            ),
                        ])]),
                    ),
                    ("roles", PropertyValue::list([PropertyValue::reference("WebRole")])),
                ]),
            )
            .unwrap();

        let declarations = render_all(&stack);
        let policy = hcl(&declarations[1]);
        assert!(policy.contains("\"arn:aws:s3:::weights/$${aws:username}/*\""), "{policy}");
        assert!(!policy.contains("/${aws:username}"), "{policy}");
        assert!(policy.contains("\"${aws_iam_role.web_role.arn}\""), "{policy}");
    }

    #[test]
    fn ids_sharing_an_address_are_rejected() {
        let mut stack = Stack::new("Test");
        vpc(&mut stack, "AppVPC");
        vpc(&mut stack, "AppVpc");

        let mut context = RenderContext::default();
        let first = TerraformRenderer
            .render(stack.get("AppVPC").unwrap(), &context)
            .unwrap();
        context.record(&first);
        let err = TerraformRenderer
            .render(stack.get("AppVpc").unwrap(), &context)
            .unwrap_err();
        assert!(matches!(err, SynthError::Validation { .. }), "{err}");
        assert!(err.to_string().contains("aws_vpc.app_vpc"), "{err}");
    }

    #[test]
    fn attribute_names_are_snake_cased() {
        let mut stack = Stack::new("Test");
        vpc(&mut stack, "AppVpc");
        stack
            .define_resource(
                "WebSg",
                ResourceKind::SecurityGroup,
                props([
                    ("group_name", "web".into()),
                    (
                        "network",
                        PropertyValue::attribute("AppVpc", "DefaultSecurityGroup"),
                    ),
                ]),
            )
            .unwrap();

        let declarations = render_all(&stack);
        assert!(
            hcl(&declarations[1]).contains("vpc_id = aws_vpc.app_vpc.default_security_group"),
            "{}",
            hcl(&declarations[1])
        );
    }
}
