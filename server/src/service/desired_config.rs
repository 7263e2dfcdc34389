//! Kubernetes config rendered for a workspace
//!
//! The agent applies the returned YAML stream as a whole and prunes
//! anything owned by the same inventory that is no longer present, so a
//! terminated workspace is expressed as "inventories only".

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::agent::WorkspacesAgentConfig;
use crate::domain::devfile::{Container, Devfile};
use crate::domain::workspace::{DesiredState, VariableType, Workspace, WorkspaceVariable};
use crate::error::{Error, Result};

pub const AGENT_ID_LABEL: &str = "agent.gitlab.com/id";
pub const HOST_TEMPLATE_ANNOTATION: &str = "workspaces.gitlab.com/host-template";
pub const WORKSPACE_ID_ANNOTATION: &str = "workspaces.gitlab.com/id";
pub const MAX_RESOURCES_ANNOTATION: &str =
    "workspaces.gitlab.com/max-resources-per-workspace-sha256";
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";
pub const INVENTORY_ID_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

/// Where file variables are mounted in every container
pub const VARIABLES_FILE_DIR: &str = "/.workspace-data/variables/file";

const VARIABLES_VOLUME_NAME: &str = "gl-workspace-variables";
const RUN_AS_USER: i64 = 5001;
const DEFAULT_VOLUME_SIZE: &str = "15Gi";

/// Everything needed to render a workspace
pub struct ConfigInput<'a> {
    pub workspace: &'a Workspace,
    pub agent_config: &'a WorkspacesAgentConfig,
    pub variables: &'a [WorkspaceVariable],
}

/// Render the config as a multi-document YAML stream
pub fn generate(input: &ConfigInput<'_>) -> Result<String> {
    let mut out = String::new();
    for resource in resources(input)? {
        let doc = serde_yaml::to_string(&resource)
            .map_err(|e| Error::Internal(format!("Failed to serialize config: {}", e)))?;
        out.push_str("---\n");
        out.push_str(&doc);
    }
    Ok(out)
}

/// Build the Kubernetes resources for a workspace, in apply order
pub fn resources(input: &ConfigInput<'_>) -> Result<Vec<Value>> {
    let ws = input.workspace;
    let names = ResourceNames::new(&ws.name);
    let labels = labels(input);

    let workspace_inventory = inventory_config_map(ws, &names.workspace_inventory, &labels);
    let secrets_inventory = inventory_config_map(ws, &names.secrets_inventory, &labels);

    if ws.desired_state == DesiredState::Terminated {
        return Ok(vec![workspace_inventory, secrets_inventory]);
    }

    let devfile = Devfile::parse(&ws.processed_devfile)?;
    let annotations = annotations(input, &names.workspace_inventory)?;
    let secret_annotations = {
        let mut a = annotations.clone();
        a.insert(
            OWNING_INVENTORY_ANNOTATION.to_string(),
            Value::String(names.secrets_inventory.clone()),
        );
        a
    };

    let mut out = vec![workspace_inventory];
    out.push(deployment(input, &devfile, &names, &labels, &annotations));
    out.push(service(ws, &devfile, &labels, &annotations));
    out.extend(persistent_volume_claims(ws, &devfile, &labels, &annotations));
    out.push(service_account(input, &labels, &annotations));
    if input.agent_config.network_policy_enabled {
        out.push(network_policy(input, &labels, &annotations));
    }
    out.push(secrets_inventory);
    out.push(secret(
        ws,
        &names.env_secret,
        VariableType::Environment,
        input.variables,
        &labels,
        &secret_annotations,
    ));
    out.push(secret(
        ws,
        &names.file_secret,
        VariableType::File,
        input.variables,
        &labels,
        &secret_annotations,
    ));
    Ok(out)
}

struct ResourceNames {
    workspace_inventory: String,
    secrets_inventory: String,
    env_secret: String,
    file_secret: String,
}

impl ResourceNames {
    fn new(workspace_name: &str) -> Self {
        Self {
            workspace_inventory: format!("{}-workspace-inventory", workspace_name),
            secrets_inventory: format!("{}-secrets-inventory", workspace_name),
            env_secret: format!("{}-env-var", workspace_name),
            file_secret: format!("{}-file", workspace_name),
        }
    }
}

fn labels(input: &ConfigInput<'_>) -> Map<String, Value> {
    let mut labels: Map<String, Value> = input
        .agent_config
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    labels.insert(
        AGENT_ID_LABEL.to_string(),
        Value::String(input.workspace.cluster_agent_id.to_string()),
    );
    labels
}

fn annotations(input: &ConfigInput<'_>, inventory: &str) -> Result<Map<String, Value>> {
    let ws = input.workspace;
    let max_resources = serde_json::to_string(&input.agent_config.max_resources_per_workspace)?;
    let digest = Sha256::digest(max_resources.as_bytes());

    let mut annotations: Map<String, Value> = input
        .agent_config
        .annotations
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    annotations.insert(
        HOST_TEMPLATE_ANNOTATION.to_string(),
        Value::String(format!(
            "{{{{.port}}}}-{}.{}",
            ws.name, input.agent_config.dns_zone
        )),
    );
    annotations.insert(
        WORKSPACE_ID_ANNOTATION.to_string(),
        Value::String(ws.id.to_string()),
    );
    annotations.insert(
        MAX_RESOURCES_ANNOTATION.to_string(),
        Value::String(format!("{:x}", digest)),
    );
    annotations.insert(
        OWNING_INVENTORY_ANNOTATION.to_string(),
        Value::String(inventory.to_string()),
    );
    Ok(annotations)
}

fn metadata(
    name: &str,
    namespace: &str,
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Value {
    json!({
        "name": name,
        "namespace": namespace,
        "labels": labels,
        "annotations": annotations,
    })
}

fn inventory_config_map(ws: &Workspace, name: &str, labels: &Map<String, Value>) -> Value {
    let mut labels = labels.clone();
    labels.insert(INVENTORY_ID_LABEL.to_string(), Value::String(name.to_string()));
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": name,
            "namespace": ws.namespace,
            "labels": labels,
        },
    })
}

fn deployment(
    input: &ConfigInput<'_>,
    devfile: &Devfile,
    names: &ResourceNames,
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Value {
    let ws = input.workspace;
    let replicas = if ws.desired_state == DesiredState::Running { 1 } else { 0 };
    let init_names = devfile.init_component_names();
    let defaults = &input.agent_config.default_resources_per_workspace_container;

    let mut init_containers = Vec::new();
    let mut containers = Vec::new();
    for component in &devfile.components {
        let Some(container) = &component.container else {
            continue;
        };
        let rendered = container_spec(&component.name, container, defaults, names);
        if init_names.contains(&component.name.as_str()) {
            init_containers.push(rendered);
        } else {
            containers.push(rendered);
        }
    }

    let mut volumes: Vec<Value> = devfile
        .components
        .iter()
        .filter_map(|c| c.volume.as_ref().map(|v| (c, v)))
        .map(|(component, volume)| {
            if volume.ephemeral == Some(true) {
                json!({"name": component.name, "emptyDir": {}})
            } else {
                json!({
                    "name": component.name,
                    "persistentVolumeClaim": {"claimName": format!("{}-{}", ws.name, component.name)},
                })
            }
        })
        .collect();
    volumes.push(json!({
        "name": VARIABLES_VOLUME_NAME,
        "projected": {
            "defaultMode": 0o774,
            "sources": [{"secret": {"name": names.file_secret}}],
        },
    }));

    let selector = json!({ AGENT_ID_LABEL: ws.cluster_agent_id.to_string() });

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": metadata(&ws.name, &ws.namespace, labels, annotations),
        "spec": {
            "replicas": replicas,
            "selector": {"matchLabels": selector},
            "strategy": {"type": "Recreate"},
            "template": {
                "metadata": {
                    "name": ws.name,
                    "namespace": ws.namespace,
                    "labels": labels,
                    "annotations": annotations,
                },
                "spec": {
                    "hostname": ws.name,
                    "serviceAccountName": ws.name,
                    "initContainers": init_containers,
                    "containers": containers,
                    "volumes": volumes,
                    "securityContext": {
                        "runAsNonRoot": true,
                        "runAsUser": RUN_AS_USER,
                        "fsGroup": 0,
                        "fsGroupChangePolicy": "OnRootMismatch",
                    },
                },
            },
        },
    })
}

fn container_spec(
    name: &str,
    container: &Container,
    defaults: &Value,
    names: &ResourceNames,
) -> Value {
    let env: Vec<Value> = container
        .env
        .iter()
        .map(|e| json!({"name": e.name, "value": e.value}))
        .collect();

    let ports: Vec<Value> = container
        .endpoints
        .iter()
        .map(|e| {
            json!({
                "name": e.name,
                "containerPort": e.target_port,
                "protocol": e.protocol.as_deref().map(str::to_uppercase).unwrap_or_else(|| "TCP".to_string()),
            })
        })
        .collect();

    let mut volume_mounts: Vec<Value> = container
        .volume_mounts
        .iter()
        .map(|m| {
            json!({
                "name": m.name,
                "mountPath": m.path.clone().unwrap_or_else(|| format!("/{}", m.name)),
            })
        })
        .collect();
    volume_mounts.push(json!({
        "name": VARIABLES_VOLUME_NAME,
        "mountPath": VARIABLES_FILE_DIR,
    }));

    let mut spec = json!({
        "name": name,
        "image": container.image,
        "imagePullPolicy": "IfNotPresent",
        "env": env,
        "envFrom": [{"secretRef": {"name": names.env_secret}}],
        "ports": ports,
        "volumeMounts": volume_mounts,
        "resources": container_resources(container, defaults),
        "securityContext": {
            "allowPrivilegeEscalation": false,
            "privileged": false,
            "runAsNonRoot": true,
            "runAsUser": RUN_AS_USER,
        },
    });
    if let Value::Object(map) = &mut spec {
        if !container.command.is_empty() {
            map.insert("command".to_string(), json!(container.command));
        }
        if !container.args.is_empty() {
            map.insert("args".to_string(), json!(container.args));
        }
    }
    spec
}

/// Explicit devfile values win over the agent's per-container defaults
fn container_resources(container: &Container, defaults: &Value) -> Value {
    let mut limits = defaults
        .get("limits")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let mut requests = defaults
        .get("requests")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    set_quantities(&mut limits, &container.cpu_limit, &container.memory_limit);
    set_quantities(&mut requests, &container.cpu_request, &container.memory_request);

    let mut resources = Map::new();
    if !limits.is_empty() {
        resources.insert("limits".to_string(), Value::Object(limits));
    }
    if !requests.is_empty() {
        resources.insert("requests".to_string(), Value::Object(requests));
    }
    Value::Object(resources)
}

fn set_quantities(target: &mut Map<String, Value>, cpu: &Option<String>, memory: &Option<String>) {
    for (key, value) in [("cpu", cpu), ("memory", memory)] {
        if let Some(value) = value {
            target.insert(key.to_string(), Value::String(value.clone()));
        }
    }
}

fn service(
    ws: &Workspace,
    devfile: &Devfile,
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Value {
    let ports: Vec<Value> = devfile
        .components
        .iter()
        .filter_map(|c| c.container.as_ref())
        .flat_map(|c| c.endpoints.iter())
        .map(|e| {
            json!({
                "name": e.name,
                "port": e.target_port,
                "targetPort": e.target_port,
                "protocol": "TCP",
            })
        })
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": metadata(&ws.name, &ws.namespace, labels, annotations),
        "spec": {
            "type": "ClusterIP",
            "ports": ports,
            "selector": { AGENT_ID_LABEL: ws.cluster_agent_id.to_string() },
        },
    })
}

fn persistent_volume_claims(
    ws: &Workspace,
    devfile: &Devfile,
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Vec<Value> {
    devfile
        .components
        .iter()
        .filter_map(|c| c.volume.as_ref().map(|v| (c, v)))
        .filter(|(_, volume)| volume.ephemeral != Some(true))
        .map(|(component, volume)| {
            let name = format!("{}-{}", ws.name, component.name);
            json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": metadata(&name, &ws.namespace, labels, annotations),
                "spec": {
                    "accessModes": ["ReadWriteOnce"],
                    "resources": {"requests": {
                        "storage": volume.size.clone().unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string()),
                    }},
                },
            })
        })
        .collect()
}

fn service_account(
    input: &ConfigInput<'_>,
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Value {
    let ws = input.workspace;
    let pull_secrets: Vec<Value> = input
        .agent_config
        .image_pull_secrets
        .iter()
        .map(|s| json!({"name": s.name}))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": metadata(&ws.name, &ws.namespace, labels, annotations),
        "automountServiceAccountToken": false,
        "imagePullSecrets": pull_secrets,
    })
}

fn network_policy(
    input: &ConfigInput<'_>,
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Value {
    let ws = input.workspace;
    let mut egress = vec![json!({
        "to": [{"namespaceSelector": {"matchLabels": {"kubernetes.io/metadata.name": "kube-system"}}}],
        "ports": [{"port": 53, "protocol": "TCP"}, {"port": 53, "protocol": "UDP"}],
    })];
    egress.extend(input.agent_config.network_policy_egress.iter().map(|rule| {
        json!({"to": [{"ipBlock": {"cidr": rule.allow, "except": rule.except}}]})
    }));

    json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": metadata(&ws.name, &ws.namespace, labels, annotations),
        "spec": {
            "podSelector": {},
            "policyTypes": ["Ingress", "Egress"],
            "ingress": [{"from": [
                {"namespaceSelector": {"matchLabels": {
                    "kubernetes.io/metadata.name": input.agent_config.gitlab_workspaces_proxy_namespace,
                }}},
            ]}],
            "egress": egress,
        },
    })
}

fn secret(
    ws: &Workspace,
    name: &str,
    kind: VariableType,
    variables: &[WorkspaceVariable],
    labels: &Map<String, Value>,
    annotations: &Map<String, Value>,
) -> Value {
    let data: BTreeMap<&str, String> = variables
        .iter()
        .filter(|v| v.variable_type == kind)
        .map(|v| (v.key.as_str(), STANDARD.encode(v.value.as_bytes())))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": metadata(name, &ws.namespace, labels, annotations),
        "type": "Opaque",
        "data": data,
    })
}
