use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{ArtifactFormat, StackConfiguration};
use crate::error::{Result, SynthError};
use crate::graph::DependencyGraph;
use crate::model::{PropertyValue, ResourceNode};
use crate::providers::{ProviderRenderer, RenderContext, ResourceMapping, renderer_for, sha256_hex};

/// Logical id to provider mapping recorded next to every emitted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub stack_name: String,
    pub format: ArtifactFormat,
    /// Bumped by the artifact store whenever the digest changes.
    pub version: u64,
    pub digest: String,
    pub resources: IndexMap<String, ResourceMapping>,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub document: String,
    pub manifest: ArtifactManifest,
}

/// Render every node of the graph in dependency order. The result depends only
/// on the stack and the configuration, so identical inputs give identical bytes.
pub fn synthesize(
    graph: &DependencyGraph<'_>,
    config: &StackConfiguration,
    format: ArtifactFormat,
) -> Result<Artifact> {
    synthesize_with(graph, config, renderer_for(format).as_ref())
}

pub fn synthesize_with(
    graph: &DependencyGraph<'_>,
    config: &StackConfiguration,
    renderer: &dyn ProviderRenderer,
) -> Result<Artifact> {
    let stack_name = graph.stack().name();
    let mut context = RenderContext::default();
    let mut declarations = Vec::with_capacity(graph.stack().len());
    let mut resources = IndexMap::new();

    for node in graph.ordered() {
        for (property, reference) in node.references() {
            if !context.contains(&reference.target) {
                return Err(SynthError::Other(format!(
                    "{}.{property} references {} which has not been rendered",
                    node.id, reference.target
                )));
            }
        }
        let resolved = resolve_parameters(node, config)?;
        let declaration = renderer.render(&resolved, &context)?;
        let fingerprint = declaration.fingerprint()?;
        debug!(resource = %node.id, provider_type = %declaration.provider_type, %fingerprint, "rendered");

        context.record(&declaration);
        resources.insert(
            declaration.logical_id.clone(),
            ResourceMapping {
                kind: declaration.kind,
                provider_type: declaration.provider_type.clone(),
                physical_name: declaration.physical_name.clone(),
                fingerprint,
            },
        );
        declarations.push(declaration);
    }

    let document = renderer.assemble(stack_name, config, &declarations)?;
    let digest = sha256_hex(document.as_bytes());
    info!(
        stack = stack_name,
        format = renderer.format().as_str(),
        resources = resources.len(),
        %digest,
        "synthesized artifact"
    );

    Ok(Artifact {
        document,
        manifest: ArtifactManifest {
            stack_name: stack_name.to_string(),
            format: renderer.format(),
            version: 1,
            digest,
            resources,
        },
    })
}

/// Copy of `node` with every parameter placeholder replaced by its value.
fn resolve_parameters(node: &ResourceNode, config: &StackConfiguration) -> Result<ResourceNode> {
    let mut resolved = node.clone();
    for value in resolved.properties.values_mut() {
        substitute(&node.id, value, config)?;
    }
    Ok(resolved)
}

fn substitute(resource: &str, value: &mut PropertyValue, config: &StackConfiguration) -> Result<()> {
    match value {
        PropertyValue::Parameter(name) => {
            *value = config
                .parameter(name)
                .ok_or_else(|| SynthError::UnknownParameter {
                    resource: resource.to_string(),
                    parameter: name.clone(),
                })?;
        }
        PropertyValue::List(items) => {
            for item in items {
                substitute(resource, item, config)?;
            }
        }
        PropertyValue::Map(entries) => {
            for item in entries.values_mut() {
                substitute(resource, item, config)?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerScope;
    use crate::graph::build_graph;
    use crate::model::{IngressRule, ResourceKind, Stack, props};

    fn config() -> StackConfiguration {
        StackConfiguration {
            stack_name: "Test".into(),
            use_gpu: false,
            instance_type: "m5.2xlarge".into(),
            machine_image: "ami-123".into(),
            key_pair_name: "key".into(),
            peer_cidr: "10.0.0.1/32".parse().unwrap(),
            peer_scope: PeerScope::Explicit,
            bucket: None,
            network_id: None,
            region: "us-east-1".into(),
            account: None,
            models: vec!["m".into()],
            volume_size_gib: 100,
            warmup_secs: 15,
        }
    }

    fn stack() -> Stack {
        let mut stack = Stack::new("Test");
        stack
            .define_resource("Vpc", ResourceKind::Network, props([("existing", true.into())]))
            .unwrap();
        stack
            .define_resource(
                "Sg",
                ResourceKind::SecurityGroup,
                props([
                    ("group_name", "sg".into()),
                    ("network", PropertyValue::reference("Vpc")),
                ]),
            )
            .unwrap();
        stack
            .add_ingress_rule("Sg", IngressRule::tcp(22, "10.0.0.1/32".parse().unwrap(), "ssh"))
            .unwrap();
        stack
            .define_resource(
                "Server",
                ResourceKind::Instance,
                props([
                    ("instance_type", PropertyValue::parameter("instance_type")),
                    ("machine_image", PropertyValue::parameter("machine_image")),
                    (
                        "security_groups",
                        PropertyValue::list([PropertyValue::reference("Sg")]),
                    ),
                ]),
            )
            .unwrap();
        stack
    }

    #[test]
    fn parameters_are_substituted() {
        let stack = stack();
        let graph = build_graph(&stack).unwrap();
        let artifact = synthesize(&graph, &config(), ArtifactFormat::Cloudformation).unwrap();
        assert!(artifact.document.contains("\"InstanceType\": \"m5.2xlarge\""));
        assert!(artifact.document.contains("\"ImageId\": \"ami-123\""));
        assert_eq!(
            artifact.manifest.resources.keys().collect::<Vec<_>>(),
            ["Vpc", "Sg", "Server"]
        );
        assert_eq!(artifact.manifest.resources["Vpc"].provider_type, "AWS::EC2::VPC::Id");
    }

    #[test]
    fn repeated_runs_are_byte_identical() {
        for format in [
            ArtifactFormat::Cloudformation,
            ArtifactFormat::CloudformationYaml,
            ArtifactFormat::Terraform,
        ] {
            let first_stack = stack();
            let second_stack = stack();
            let first = synthesize(&build_graph(&first_stack).unwrap(), &config(), format).unwrap();
            let second =
                synthesize(&build_graph(&second_stack).unwrap(), &config(), format).unwrap();
            assert_eq!(first.document, second.document);
            assert_eq!(first.manifest, second.manifest);
        }
    }

    #[test]
    fn unknown_parameter_is_reported() {
        let mut stack = Stack::new("Test");
        stack
            .define_resource(
                "Server",
                ResourceKind::Instance,
                props([
                    ("instance_type", PropertyValue::parameter("nope")),
                    ("machine_image", "ami-1".into()),
                ]),
            )
            .unwrap();
        let graph = build_graph(&stack).unwrap();
        let err = synthesize(&graph, &config(), ArtifactFormat::Terraform).unwrap_err();
        assert!(
            matches!(err, SynthError::UnknownParameter { ref parameter, .. } if parameter == "nope"),
            "{err}"
        );
    }

    #[test]
    fn digest_tracks_configuration() {
        let stack = stack();
        let graph = build_graph(&stack).unwrap();
        let cpu = synthesize(&graph, &config(), ArtifactFormat::Terraform).unwrap();
        let other = StackConfiguration {
            instance_type: "m5.xlarge".into(),
            ..config()
        };
        let changed = synthesize(&graph, &other, ArtifactFormat::Terraform).unwrap();
        assert_ne!(cpu.manifest.digest, changed.manifest.digest);
        assert_eq!(
            cpu.manifest.resources["Sg"].fingerprint,
            changed.manifest.resources["Sg"].fingerprint
        );
        assert_ne!(
            cpu.manifest.resources["Server"].fingerprint,
            changed.manifest.resources["Server"].fingerprint
        );
    }
}
