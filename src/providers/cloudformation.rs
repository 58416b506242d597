use serde_json::{Map, Value, json};

use crate::config::{ArtifactFormat, StackConfiguration};
use crate::error::{Result, SynthError};
use crate::model::{PropertyValue, Reference, ResourceKind, ResourceNode};
use crate::providers::{
    Declaration, DeclarationBody, ProviderRenderer, RenderContext, list, pascal_case, physical_name,
    required_number, required_str,
};

const TEMPLATE_VERSION: &str = "2010-09-09";
const POLICY_VERSION: &str = "2012-10-17";

/// AWS CloudFormation template renderer (JSON or YAML).
#[derive(Debug, Clone, Copy)]
pub struct CloudFormationRenderer {
    yaml: bool,
}

impl CloudFormationRenderer {
    pub fn json() -> Self {
        Self { yaml: false }
    }

    pub fn yaml() -> Self {
        Self { yaml: true }
    }

    fn network(&self, node: &ResourceNode) -> Result<Declaration> {
        let existing = node
            .property("existing")
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false);
        if existing {
            let mut body = Map::new();
            body.insert("Type".into(), json!("AWS::EC2::VPC::Id"));
            body.insert(
                "Description".into(),
                json!(format!("Existing VPC used by {}", node.id)),
            );
            if let Some(id) = node.property("network_id").and_then(PropertyValue::as_str) {
                body.insert("Default".into(), json!(id));
            }
            return Ok(self.declaration(node, "Parameters", "AWS::EC2::VPC::Id", Value::Object(body)));
        }

        let mut props = Map::new();
        props.insert("CidrBlock".into(), json!(required_str(node, "cidr_block")?));
        props.insert("EnableDnsSupport".into(), json!(true));
        props.insert("EnableDnsHostnames".into(), json!(true));
        self.resource(node, "AWS::EC2::VPC", props)
    }

    fn security_group(&self, node: &ResourceNode) -> Result<Declaration> {
        let group_name = required_str(node, "group_name")?;
        let description = node
            .property("description")
            .and_then(PropertyValue::as_str)
            .unwrap_or(group_name);

        let ingress: Vec<Value> = node
            .ingress
            .iter()
            .map(|rule| {
                let cidr_key = match rule.source {
                    ipnet::IpNet::V4(_) => "CidrIp",
                    ipnet::IpNet::V6(_) => "CidrIpv6",
                };
                json!({
                    "IpProtocol": rule.protocol.as_str(),
                    "FromPort": rule.port,
                    "ToPort": rule.port,
                    cidr_key: rule.source.to_string(),
                    "Description": rule.description,
                })
            })
            .collect();

        let mut props = Map::new();
        props.insert("GroupName".into(), json!(group_name));
        props.insert("GroupDescription".into(), json!(description));
        props.insert("VpcId".into(), value_json(node, required(node, "network")?)?);
        if !ingress.is_empty() {
            props.insert("SecurityGroupIngress".into(), Value::Array(ingress));
        }
        if node
            .property("allow_all_outbound")
            .and_then(PropertyValue::as_bool)
            .unwrap_or(false)
        {
            props.insert(
                "SecurityGroupEgress".into(),
                json!([{ "IpProtocol": "-1", "CidrIp": "0.0.0.0/0", "Description": "Allow all outbound traffic" }]),
            );
        }
        self.resource(node, "AWS::EC2::SecurityGroup", props)
    }

    fn role(&self, node: &ResourceNode) -> Result<Declaration> {
        let mut props = Map::new();
        props.insert("RoleName".into(), json!(required_str(node, "role_name")?));
        props.insert(
            "AssumeRolePolicyDocument".into(),
            json!({
                "Version": POLICY_VERSION,
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": required_str(node, "assumed_by")? },
                    "Action": "sts:AssumeRole",
                }],
            }),
        );
        if let Some(description) = node.property("description") {
            props.insert("Description".into(), value_json(node, description)?);
        }
        let managed = list(node, "managed_policy_arns");
        if !managed.is_empty() {
            props.insert("ManagedPolicyArns".into(), list_json(node, managed)?);
        }
        self.resource(node, "AWS::IAM::Role", props)
    }

    fn policy(&self, node: &ResourceNode) -> Result<Declaration> {
        let statements = list(node, "statements")
            .iter()
            .map(|statement| statement_json(node, statement))
            .collect::<Result<Vec<_>>>()?;
        if statements.is_empty() {
            return Err(SynthError::validation(&node.id, "policy has no statements"));
        }

        let mut props = Map::new();
        props.insert("PolicyName".into(), json!(required_str(node, "policy_name")?));
        props.insert(
            "PolicyDocument".into(),
            json!({ "Version": POLICY_VERSION, "Statement": statements }),
        );
        props.insert("Roles".into(), list_json(node, list(node, "roles"))?);
        self.resource(node, "AWS::IAM::Policy", props)
    }

    fn instance_profile(&self, node: &ResourceNode) -> Result<Declaration> {
        let mut props = Map::new();
        props.insert("Roles".into(), list_json(node, list(node, "roles"))?);
        self.resource(node, "AWS::IAM::InstanceProfile", props)
    }

    /// Block devices live in a launch template the instance points at.
    fn volume(&self, node: &ResourceNode) -> Result<Declaration> {
        let mut ebs = Map::new();
        ebs.insert("VolumeSize".into(), json!(required_number(node, "size_gib")?));
        if let Some(volume_type) = node.property("volume_type") {
            ebs.insert("VolumeType".into(), value_json(node, volume_type)?);
        }
        ebs.insert(
            "DeleteOnTermination".into(),
            json!(
                node.property("delete_on_termination")
                    .and_then(PropertyValue::as_bool)
                    .unwrap_or(true)
            ),
        );

        let mut props = Map::new();
        props.insert(
            "LaunchTemplateData".into(),
            json!({
                "BlockDeviceMappings": [{
                    "DeviceName": required_str(node, "device_name")?,
                    "Ebs": Value::Object(ebs),
                }],
            }),
        );
        self.resource(node, "AWS::EC2::LaunchTemplate", props)
    }

    fn instance(&self, node: &ResourceNode) -> Result<Declaration> {
        let mut props = Map::new();
        props.insert("InstanceType".into(), json!(required_str(node, "instance_type")?));
        props.insert("ImageId".into(), json!(required_str(node, "machine_image")?));
        if let Some(key) = node.property("key_name") {
            props.insert("KeyName".into(), value_json(node, key)?);
        }
        let groups = list(node, "security_groups");
        if !groups.is_empty() {
            props.insert("SecurityGroupIds".into(), list_json(node, groups)?);
        }
        if let Some(profile) = node.property("instance_profile") {
            props.insert("IamInstanceProfile".into(), value_json(node, profile)?);
        }
        if let Some(PropertyValue::Ref(template)) = node.property("launch_template") {
            props.insert(
                "LaunchTemplate".into(),
                json!({
                    "LaunchTemplateId": reference_json(template),
                    "Version": { "Fn::GetAtt": [template.target, "LatestVersionNumber"] },
                }),
            );
        }
        if let Some(script) = node.property("user_data").and_then(PropertyValue::as_str) {
            props.insert("UserData".into(), json!({ "Fn::Base64": script }));
        }
        if let Some(name) = node.property("instance_name").and_then(PropertyValue::as_str) {
            props.insert("Tags".into(), json!([{ "Key": "Name", "Value": name }]));
        }
        self.resource(node, "AWS::EC2::Instance", props)
    }

    fn resource(
        &self,
        node: &ResourceNode,
        provider_type: &str,
        mut props: Map<String, Value>,
    ) -> Result<Declaration> {
        for (name, value) in &node.properties {
            if node.kind.schema().iter().any(|spec| spec.name == name) {
                continue;
            }
            props.insert(pascal_case(name), value_json(node, value)?);
        }
        let body = json!({ "Type": provider_type, "Properties": Value::Object(props) });
        Ok(self.declaration(node, "Resources", provider_type, body))
    }

    fn declaration(
        &self,
        node: &ResourceNode,
        section: &'static str,
        provider_type: &str,
        value: Value,
    ) -> Declaration {
        Declaration {
            logical_id: node.id.clone(),
            kind: node.kind,
            provider_type: provider_type.to_string(),
            physical_name: physical_name(node),
            body: DeclarationBody::Json { section, value },
        }
    }
}

impl ProviderRenderer for CloudFormationRenderer {
    fn format(&self) -> ArtifactFormat {
        if self.yaml {
            ArtifactFormat::CloudformationYaml
        } else {
            ArtifactFormat::Cloudformation
        }
    }

    fn render(&self, node: &ResourceNode, _context: &RenderContext) -> Result<Declaration> {
        match node.kind {
            ResourceKind::Network => self.network(node),
            ResourceKind::SecurityGroup => self.security_group(node),
            ResourceKind::Role => self.role(node),
            ResourceKind::Policy => self.policy(node),
            ResourceKind::InstanceProfile => self.instance_profile(node),
            ResourceKind::Instance => self.instance(node),
            ResourceKind::Volume => self.volume(node),
        }
    }

    fn assemble(
        &self,
        stack_name: &str,
        config: &StackConfiguration,
        declarations: &[Declaration],
    ) -> Result<String> {
        let mut parameters = Map::new();
        let mut resources = Map::new();
        let mut outputs = Map::new();

        for declaration in declarations {
            let DeclarationBody::Json { section, value } = &declaration.body else {
                return Err(SynthError::Other(format!(
                    "{} was not rendered as CloudFormation",
                    declaration.logical_id
                )));
            };
            let target = if *section == "Parameters" {
                &mut parameters
            } else {
                &mut resources
            };
            target.insert(declaration.logical_id.clone(), value.clone());

            if declaration.kind == ResourceKind::Instance {
                let id = &declaration.logical_id;
                outputs.insert(
                    format!("{id}Id"),
                    json!({ "Value": { "Ref": id } }),
                );
                outputs.insert(
                    format!("{id}PublicIp"),
                    json!({ "Value": { "Fn::GetAtt": [id, "PublicIp"] } }),
                );
            }
        }

        let mut metadata = Map::new();
        metadata.insert("Stack".into(), json!(stack_name));
        metadata.insert("Variant".into(), json!(if config.use_gpu { "gpu" } else { "cpu" }));
        metadata.insert("Region".into(), json!(config.region));
        if let Some(account) = &config.account {
            metadata.insert("Account".into(), json!(account));
        }

        let mut document = Map::new();
        document.insert("AWSTemplateFormatVersion".into(), json!(TEMPLATE_VERSION));
        document.insert(
            "Description".into(),
            json!(format!("{stack_name} synthesized by stack-synth")),
        );
        document.insert("Metadata".into(), json!({ "StackSynth": Value::Object(metadata) }));
        if !parameters.is_empty() {
            document.insert("Parameters".into(), Value::Object(parameters));
        }
        document.insert("Resources".into(), Value::Object(resources));
        if !outputs.is_empty() {
            document.insert("Outputs".into(), Value::Object(outputs));
        }
        let document = Value::Object(document);

        if self.yaml {
            serde_yaml_bw::to_string(&document).map_err(|err| SynthError::Yaml(err.to_string()))
        } else {
            let mut text = serde_json::to_string_pretty(&document)?;
            text.push('\n');
            Ok(text)
        }
    }
}

fn required<'a>(node: &'a ResourceNode, name: &str) -> Result<&'a PropertyValue> {
    node.property(name)
        .ok_or_else(|| SynthError::validation(&node.id, format!("missing property '{name}'")))
}

fn reference_json(reference: &Reference) -> Value {
    match &reference.attribute {
        Some(attribute) => json!({ "Fn::GetAtt": [reference.target, attribute] }),
        None => json!({ "Ref": reference.target }),
    }
}

fn list_json(node: &ResourceNode, items: &[PropertyValue]) -> Result<Value> {
    items
        .iter()
        .map(|item| value_json(node, item))
        .collect::<Result<Vec<_>>>()
        .map(Value::Array)
}

fn value_json(node: &ResourceNode, value: &PropertyValue) -> Result<Value> {
    Ok(match value {
        PropertyValue::String(text) => json!(text),
        PropertyValue::Number(number) => json!(number),
        PropertyValue::Bool(flag) => json!(flag),
        PropertyValue::Ref(reference) => reference_json(reference),
        PropertyValue::Parameter(name) => {
            return Err(SynthError::UnknownParameter {
                resource: node.id.clone(),
                parameter: name.clone(),
            });
        }
        PropertyValue::List(items) => list_json(node, items)?,
        PropertyValue::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(pascal_case(key), value_json(node, value)?);
            }
            Value::Object(map)
        }
    })
}

/// Policy statements use IAM's singular key names and default to Allow.
fn statement_json(node: &ResourceNode, statement: &PropertyValue) -> Result<Value> {
    let PropertyValue::Map(entries) = statement else {
        return Err(SynthError::validation(&node.id, "policy statements must be maps"));
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
        map.insert(key, value_json(node, value)?);
    }
    Ok(Value::Object(map))
}
