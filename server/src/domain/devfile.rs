//! Devfile model, validation and processing
//!
//! Only the subset of the devfile 2.2 schema that can be rendered into a
//! single workspace pod is accepted. Processing injects the shared data
//! volume and the project cloner so the rendered config is self-contained.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the injected volume holding the cloned project
pub const DATA_VOLUME_NAME: &str = "gl-workspace-data";
/// Mount path of the data volume in every container
pub const PROJECTS_ROOT: &str = "/projects";
/// Name of the injected init component that clones the project
pub const CLONER_COMPONENT_NAME: &str = "gl-cloner-injector";
/// Attribute marking the container users work in
pub const MAIN_COMPONENT_ATTRIBUTE: &str = "gl/inject-editor";

const RESERVED_PREFIX: &str = "gl-";
const SUPPORTED_SCHEMA_PREFIX: &str = "2.2.";
const CLONER_IMAGE: &str = "alpine/git:2.45.2";

/// Clone inputs are read from the cloner's environment, never spliced into
/// the script text
const CLONE_SCRIPT: &str = r#"if [ ! -d "$GL_PROJECT_DIR" ]; then git clone --branch "$GL_PROJECT_REF" -- "$GL_CLONE_URL" "$GL_PROJECT_DIR"; fi"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Devfile {
    pub schema_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starter_projects: Option<serde_yaml::Value>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Events>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
}

impl Component {
    fn is_main(&self) -> bool {
        self.container.is_some()
            && self
                .attributes
                .get(MAIN_COMPONENT_ATTRIBUTE)
                .and_then(serde_yaml::Value::as_bool)
                .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedicated_pod: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub target_port: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCommand {
    pub component: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Events {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_start: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_start: Vec<String>,
}

/// Where the project to clone into the workspace lives
#[derive(Debug, Clone)]
pub struct ProjectSource {
    pub clone_url: String,
    pub project_ref: String,
    pub project_name: String,
}

impl Devfile {
    pub fn parse(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::DevfileInvalid(format!("Failed to parse devfile: {}", e)))
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::Internal(format!("Failed to serialize devfile: {}", e)))
    }

    /// Reject anything the config generator cannot render
    pub fn validate(&self) -> Result<()> {
        if !self.schema_version.starts_with(SUPPORTED_SCHEMA_PREFIX) {
            return Err(Error::DevfileInvalid(format!(
                "Unsupported schemaVersion '{}', expected 2.2.x",
                self.schema_version
            )));
        }

        for (field, present) in [
            ("parent", self.parent.is_some()),
            ("projects", self.projects.is_some()),
            ("starterProjects", self.starter_projects.is_some()),
        ] {
            if present {
                return Err(Error::DevfileInvalid(format!("'{}' is not supported", field)));
            }
        }

        let mut main_count = 0;
        let mut container_count = 0;
        for component in &self.components {
            if component.name.starts_with(RESERVED_PREFIX) {
                return Err(Error::DevfileInvalid(format!(
                    "Component name '{}' must not start with '{}'",
                    component.name, RESERVED_PREFIX
                )));
            }

            let Some(container) = &component.container else {
                if component.volume.is_none() {
                    return Err(Error::DevfileInvalid(format!(
                        "Component '{}' must be a container or a volume",
                        component.name
                    )));
                }
                continue;
            };

            container_count += 1;
            if component.is_main() {
                main_count += 1;
            }
            if container.image.trim().is_empty() {
                return Err(Error::DevfileInvalid(format!(
                    "Component '{}' has no image",
                    component.name
                )));
            }
            if container.dedicated_pod == Some(true) {
                return Err(Error::DevfileInvalid(format!(
                    "Component '{}' uses dedicatedPod, which is not supported",
                    component.name
                )));
            }
            for endpoint in &container.endpoints {
                if !(1..=65535).contains(&endpoint.target_port) {
                    return Err(Error::DevfileInvalid(format!(
                        "Endpoint '{}' has invalid targetPort {}",
                        endpoint.name, endpoint.target_port
                    )));
                }
            }
            for mount in &container.volume_mounts {
                if !self
                    .components
                    .iter()
                    .any(|c| c.name == mount.name && c.volume.is_some())
                {
                    return Err(Error::DevfileInvalid(format!(
                        "Volume mount '{}' does not reference a volume component",
                        mount.name
                    )));
                }
            }
        }

        if container_count == 0 {
            return Err(Error::DevfileInvalid(
                "At least one container component is required".to_string(),
            ));
        }
        if main_count > 1 {
            return Err(Error::DevfileInvalid(format!(
                "Only one component may set '{}'",
                MAIN_COMPONENT_ATTRIBUTE
            )));
        }

        for command in &self.commands {
            if let Some(apply) = &command.apply {
                if !self.components.iter().any(|c| c.name == apply.component) {
                    return Err(Error::DevfileInvalid(format!(
                        "Command '{}' applies unknown component '{}'",
                        command.id, apply.component
                    )));
                }
            }
        }

        if let Some(events) = &self.events {
            for id in &events.pre_start {
                let applies = self
                    .commands
                    .iter()
                    .any(|c| &c.id == id && c.apply.is_some());
                if !applies {
                    return Err(Error::DevfileInvalid(format!(
                        "preStart event '{}' must reference an apply command",
                        id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Name of the container users work in: the one marked as main, else the
    /// first container that is not an init component
    pub fn main_component_name(&self) -> Option<&str> {
        let init = self.init_component_names();
        self.components
            .iter()
            .find(|c| c.is_main())
            .or_else(|| {
                self.components
                    .iter()
                    .find(|c| c.container.is_some() && !init.contains(&c.name.as_str()))
            })
            .map(|c| c.name.as_str())
    }

    /// Components run to completion before the workspace starts
    pub fn init_component_names(&self) -> Vec<&str> {
        let Some(events) = &self.events else {
            return Vec::new();
        };
        events
            .pre_start
            .iter()
            .filter_map(|id| self.commands.iter().find(|c| &c.id == id))
            .filter_map(|c| c.apply.as_ref())
            .map(|a| a.component.as_str())
            .collect()
    }

    /// Produce the processed devfile: shared data volume, project cloner and
    /// project location hints for the main container
    pub fn process(mut self, source: &ProjectSource) -> Self {
        let project_dir = format!("{}/{}", PROJECTS_ROOT, source.project_name);
        let main = self.main_component_name().map(str::to_string);

        for component in &mut self.components {
            let Some(container) = component.container.as_mut() else {
                continue;
            };
            container.volume_mounts.push(VolumeMount {
                name: DATA_VOLUME_NAME.to_string(),
                path: Some(PROJECTS_ROOT.to_string()),
            });
            if main.as_deref() == Some(component.name.as_str()) {
                container.env.push(EnvVar {
                    name: "PROJECTS_ROOT".to_string(),
                    value: PROJECTS_ROOT.to_string(),
                });
                container.env.push(EnvVar {
                    name: "PROJECT_SOURCE".to_string(),
                    value: project_dir.clone(),
                });
            }
        }

        self.components.push(Component {
            name: DATA_VOLUME_NAME.to_string(),
            attributes: BTreeMap::new(),
            container: None,
            volume: Some(Volume {
                size: Some("50Gi".to_string()),
                ephemeral: None,
            }),
        });

        self.components.push(Component {
            name: CLONER_COMPONENT_NAME.to_string(),
            attributes: BTreeMap::new(),
            container: Some(Container {
                image: CLONER_IMAGE.to_string(),
                command: vec!["/bin/sh".to_string(), "-c".to_string()],
                args: vec![CLONE_SCRIPT.to_string()],
                env: vec![
                    EnvVar {
                        name: "GL_PROJECT_DIR".to_string(),
                        value: project_dir,
                    },
                    EnvVar {
                        name: "GL_PROJECT_REF".to_string(),
                        value: source.project_ref.clone(),
                    },
                    EnvVar {
                        name: "GL_CLONE_URL".to_string(),
                        value: source.clone_url.clone(),
                    },
                ],
                volume_mounts: vec![VolumeMount {
                    name: DATA_VOLUME_NAME.to_string(),
                    path: Some(PROJECTS_ROOT.to_string()),
                }],
                memory_limit: Some("256Mi".to_string()),
                cpu_limit: Some("500m".to_string()),
                ..Default::default()
            }),
            volume: None,
        });

        let command_id = format!("{}-command", CLONER_COMPONENT_NAME);
        self.commands.push(Command {
            id: command_id.clone(),
            apply: Some(ApplyCommand {
                component: CLONER_COMPONENT_NAME.to_string(),
            }),
            exec: None,
        });
        self.events
            .get_or_insert_with(Events::default)
            .pre_start
            .insert(0, command_id);

        self
    }
}
