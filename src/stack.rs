use tracing::debug;

use crate::config::StackConfiguration;
use crate::error::Result;
use crate::model::{IngressRule, PropertyValue, ResourceKind, Stack, props};
use crate::script::{BootStep, compose_script, gpu_or_cpu};

pub const MODEL_SERVER_PORT: u16 = 11434;
pub const SSH_PORT: u16 = 10022;
pub const WEB_UI_PORT: u16 = 8080;

const MODEL_SERVER_IMAGE: &str = "ollama/ollama:latest";
const WEB_UI_IMAGE: &str = "ghcr.io/ollama-webui/ollama-webui:main";

/// Build the model-server stack: default network, security group, role with an
/// optional bucket policy, instance profile, root volume and the instance.
pub fn ollama_stack(config: &StackConfiguration) -> Result<Stack> {
    let mut stack = Stack::new(&config.stack_name);

    let mut network = props([("existing", true.into())]);
    if config.network_id.is_some() {
        network.insert("network_id".into(), PropertyValue::parameter("network_id"));
    }
    stack.define_resource("DefaultVpc", ResourceKind::Network, network)?;

    stack.define_resource(
        "OllamaSecurityGroup",
        ResourceKind::SecurityGroup,
        props([
            ("group_name", "ollama-sg".into()),
            ("description", "Security group for Ollama server".into()),
            ("network", PropertyValue::reference("DefaultVpc")),
            ("allow_all_outbound", true.into()),
        ]),
    )?;
    for (port, description) in [
        (MODEL_SERVER_PORT, "Ollama server port"),
        (SSH_PORT, "SSH port"),
        (WEB_UI_PORT, "Web UI port"),
    ] {
        stack.add_ingress_rule(
            "OllamaSecurityGroup",
            IngressRule::tcp(port, config.peer_cidr, description),
        )?;
    }

    stack.define_resource(
        "OllamaRole",
        ResourceKind::Role,
        props([
            ("role_name", "ollama-role".into()),
            ("assumed_by", "ec2.amazonaws.com".into()),
            ("description", "EC2 instance role for Ollama server".into()),
        ]),
    )?;

    if config.bucket.is_some() {
        let statement = PropertyValue::map([
            (
                "actions",
                PropertyValue::list(["s3:GetObject", "s3:ListBucket"]),
            ),
            (
                "resources",
                PropertyValue::list([
                    PropertyValue::parameter("bucket_arn"),
                    PropertyValue::parameter("bucket_arn_wildcard"),
                ]),
            ),
        ]);
        stack.define_resource(
            "S3AccessPolicy",
            ResourceKind::Policy,
            props([
                ("policy_name", "s3-access-policy".into()),
                ("statements", PropertyValue::list([statement])),
                ("roles", PropertyValue::list([PropertyValue::reference("OllamaRole")])),
            ]),
        )?;
    } else {
        debug!("no bucket configured; skipping S3 access policy");
    }

    stack.define_resource(
        "OllamaInstanceProfile",
        ResourceKind::InstanceProfile,
        props([("roles", PropertyValue::list([PropertyValue::reference("OllamaRole")]))]),
    )?;

    stack.define_resource(
        "OllamaRootVolume",
        ResourceKind::Volume,
        props([
            ("device_name", "/dev/xvda".into()),
            ("size_gib", PropertyValue::parameter("volume_size_gib")),
            ("volume_type", "gp3".into()),
        ]),
    )?;

    stack.define_resource(
        "OllamaInstance",
        ResourceKind::Instance,
        props([
            ("instance_name", "ollama-server".into()),
            ("instance_type", PropertyValue::parameter("instance_type")),
            ("machine_image", PropertyValue::parameter("machine_image")),
            ("key_name", PropertyValue::parameter("key_pair_name")),
            (
                "security_groups",
                PropertyValue::list([PropertyValue::reference("OllamaSecurityGroup")]),
            ),
            ("instance_profile", PropertyValue::reference("OllamaInstanceProfile")),
            ("launch_template", PropertyValue::reference("OllamaRootVolume")),
            ("user_data", compose_script(&ollama_boot_steps(config), config).into()),
        ]),
    )?;

    Ok(stack)
}

/// First-boot steps: docker, SSH on the alternate port, the model server,
/// the models and the web UI. Order matters; later steps need earlier ones.
pub fn ollama_boot_steps(config: &StackConfiguration) -> Vec<BootStep> {
    let server = |gpu_flag: &str| {
        format!(
            "docker run -d {gpu_flag}-v ollama:/root/.ollama -p {MODEL_SERVER_PORT}:{MODEL_SERVER_PORT} --name ollama --restart always {MODEL_SERVER_IMAGE}"
        )
    };

    let mut steps = vec![
        BootStep::comment("Update packages"),
        BootStep::line("sudo apt update -y"),
        BootStep::line("sudo apt upgrade -y"),
        BootStep::blank(),
        BootStep::comment("Install and start docker"),
        BootStep::line("sudo apt install -y docker.io"),
        BootStep::line("sudo systemctl start docker"),
        BootStep::line("sudo systemctl enable docker"),
        BootStep::line("sudo usermod -aG docker ubuntu"),
        BootStep::blank(),
        BootStep::comment(format!("Move SSH to port {SSH_PORT}")),
        BootStep::line(format!(
            "sudo sed -i 's/^#Port 22/Port {SSH_PORT}/' /etc/ssh/sshd_config"
        )),
        BootStep::line(format!(
            "sudo sed -i 's/^Port 22/Port {SSH_PORT}/' /etc/ssh/sshd_config"
        )),
        BootStep::line("sudo systemctl restart ssh"),
        BootStep::blank(),
        BootStep::comment("Start the model server"),
    ];
    steps.extend(gpu_or_cpu(server("--gpus all "), server("")));
    steps.extend([
        BootStep::blank(),
        BootStep::comment("Wait for the model server to come up"),
        BootStep::line(format!("sleep {}", config.warmup_secs)),
        BootStep::blank(),
        BootStep::comment("Start each model"),
    ]);
    steps.extend(
        config
            .models
            .iter()
            .map(|model| BootStep::line(format!("docker exec ollama ollama run {model}"))),
    );
    steps.extend([
        BootStep::blank(),
        BootStep::comment("Start the web UI"),
        BootStep::line(format!(
            "docker run -d -p {WEB_UI_PORT}:8080 --env WEBUI_AUTH=False --add-host=host.docker.internal:host-gateway -v ollama-webui:/app/backend/data --name ollama-webui --restart always {WEB_UI_IMAGE}"
        )),
    ]);
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BucketAccess, PeerScope};
    use crate::graph::build_graph;

    fn config(use_gpu: bool) -> StackConfiguration {
        StackConfiguration {
            stack_name: "OllamaServerStack".into(),
            use_gpu,
            instance_type: "m5.2xlarge".into(),
            machine_image: "ami-123".into(),
            key_pair_name: "default-key-pair".into(),
            peer_cidr: "203.0.113.7/32".parse().unwrap(),
            peer_scope: PeerScope::Explicit,
            bucket: None,
            network_id: None,
            region: "us-east-1".into(),
            account: None,
            models: vec!["deepseek-r1:8b".into(), "qwen2.5-coder:1.5b".into()],
            volume_size_gib: 100,
            warmup_secs: 15,
        }
    }

    #[test]
    fn instance_comes_last_in_creation_order() {
        let stack = ollama_stack(&config(false)).unwrap();
        let graph = build_graph(&stack).unwrap();
        assert_eq!(
            graph.order_ids(),
            [
                "DefaultVpc",
                "OllamaSecurityGroup",
                "OllamaRole",
                "OllamaInstanceProfile",
                "OllamaRootVolume",
                "OllamaInstance",
            ]
        );
    }

    #[test]
    fn bucket_adds_policy_on_the_role() {
        let mut config = config(false);
        config.bucket = Some(BucketAccess {
            name: Some("models".into()),
            arn: "arn:aws:s3:::models".into(),
            arn_wildcard: "arn:aws:s3:::models/*".into(),
        });
        let stack = ollama_stack(&config).unwrap();
        let graph = build_graph(&stack).unwrap();
        assert_eq!(graph.dependencies_of("S3AccessPolicy"), ["OllamaRole"]);
    }

    #[test]
    fn three_ingress_rules_scoped_to_peer() {
        let stack = ollama_stack(&config(false)).unwrap();
        let group = stack.get("OllamaSecurityGroup").unwrap();
        let ports: Vec<u16> = group.ingress.iter().map(|rule| rule.port).collect();
        assert_eq!(ports, [WEB_UI_PORT, SSH_PORT, MODEL_SERVER_PORT]);
        assert!(
            group
                .ingress
                .iter()
                .all(|rule| rule.source.to_string() == "203.0.113.7/32")
        );
    }

    #[test]
    fn boot_script_follows_variant() {
        let cpu = compose_script(&ollama_boot_steps(&config(false)), &config(false));
        let gpu = compose_script(&ollama_boot_steps(&config(true)), &config(true));
        assert!(cpu.starts_with("#!/bin/bash\n"));
        assert!(!cpu.contains("--gpus"));
        assert!(cpu.contains(
            "docker run -d -v ollama:/root/.ollama -p 11434:11434 --name ollama --restart always ollama/ollama:latest"
        ));
        assert!(gpu.contains("docker run -d --gpus all -v ollama:/root/.ollama"));
        assert_eq!(gpu.matches("docker run -d -v ollama:").count(), 0);
    }

    #[test]
    fn models_start_after_warmup_and_before_web_ui() {
        let script = compose_script(&ollama_boot_steps(&config(false)), &config(false));
        let sleep = script.find("sleep 15").unwrap();
        let first = script.find("ollama run deepseek-r1:8b").unwrap();
        let second = script.find("ollama run qwen2.5-coder:1.5b").unwrap();
        let web = script.find("ollama-webui:main").unwrap();
        assert!(sleep < first && first < second && second < web);
        assert!(script.contains("-p 8080:8080"));
    }
}
