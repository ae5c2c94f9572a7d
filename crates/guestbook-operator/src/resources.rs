//! Kubernetes resource builders
//!
//! This module derives the concrete manifests (Secrets, Deployments,
//! Services) for each tier of a GuestbookApp. Builders are pure: the same
//! GuestbookApp always yields descriptors with the same identity, which is
//! what makes repeated create-if-absent calls idempotent.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

use crate::crd::{GuestbookApp, GuestbookAppSpec, Tier};
use crate::error::{OperatorError, Result};

/// Value of the `app` label on every managed resource
pub const APP_LABEL: &str = "guestbook";

/// MySQL server port
pub const DATABASE_PORT: i32 = 3306;

/// Backend HTTP port
pub const BACKEND_PORT: i32 = 8000;

/// Frontend HTTP port (container side; the Service exposes 80)
pub const FRONTEND_PORT: i32 = 3000;

/// Deployment name for a tier, derived from the owning instance name
pub fn deployment_name(owner: &str, tier: Tier) -> String {
    match tier {
        Tier::Database => format!("{}-mysql", owner),
        Tier::Backend => format!("{}-backend", owner),
        Tier::Frontend => format!("{}-frontend", owner),
    }
}

/// Service name for a tier (same identity scheme as the deployment)
pub fn service_name(owner: &str, tier: Tier) -> String {
    deployment_name(owner, tier)
}

/// Name of the database auth secret
pub fn secret_name(owner: &str) -> String {
    format!("{}-mysql-auth", owner)
}

/// The fixed label set carried by every managed resource
///
/// Service selectors and the status projector key off this exact set, so
/// it is the join key between a GuestbookApp and its live resources.
pub fn labels(owner: &str, tier: Tier) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), APP_LABEL.to_string());
    labels.insert("owner".to_string(), owner.to_string());
    labels.insert("tier".to_string(), tier.as_str().to_string());
    labels
}

/// Builder for generating Kubernetes resources from a GuestbookApp
pub struct ResourceBuilder {
    name: String,
    namespace: String,
    uid: String,
    spec: GuestbookAppSpec,
}

impl ResourceBuilder {
    /// Create a new resource builder
    pub fn new(app: &GuestbookApp) -> Result<Self> {
        let name = app
            .metadata
            .name
            .clone()
            .ok_or_else(|| OperatorError::InvalidConfig("app name is required".to_string()))?;

        let namespace = app
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            name,
            namespace,
            uid: app.metadata.uid.clone().unwrap_or_default(),
            spec: app.spec.clone(),
        })
    }

    /// Get owner reference for managed resources
    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: "guestbook.dev/v1alpha1".to_string(),
            kind: "GuestbookApp".to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn metadata(&self, name: String, tier: Tier) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(labels(&self.name, tier)),
            owner_references: Some(vec![self.owner_reference()]),
            ..Default::default()
        }
    }

    /// Build the auth secret for the database tier
    ///
    /// The secret is created once and never reconciled afterwards; existing
    /// contents always win.
    pub fn build_auth_secret(&self) -> Secret {
        let mut string_data = BTreeMap::new();
        string_data.insert("username".to_string(), self.spec.database.username.clone());
        string_data.insert("password".to_string(), self.spec.database.password.clone());

        Secret {
            metadata: self.metadata(secret_name(&self.name), Tier::Database),
            string_data: Some(string_data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Build the MySQL deployment for the database tier
    pub fn build_database_deployment(&self) -> Deployment {
        let secret = secret_name(&self.name);
        let db = &self.spec.database;

        let container = Container {
            name: "mysql".to_string(),
            image: Some(db.get_image()),
            ports: Some(vec![ContainerPort {
                container_port: DATABASE_PORT,
                name: Some("mysql".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(vec![
                EnvVar {
                    name: "MYSQL_DATABASE".to_string(),
                    value: Some(db.database_name.clone()),
                    ..Default::default()
                },
                secret_env("MYSQL_USER", &secret, "username"),
                secret_env("MYSQL_PASSWORD", &secret, "password"),
                EnvVar {
                    name: "MYSQL_RANDOM_ROOT_PASSWORD".to_string(),
                    value: Some("yes".to_string()),
                    ..Default::default()
                },
            ]),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(DATABASE_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(15),
                period_seconds: Some(10),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: "data".to_string(),
                mount_path: "/var/lib/mysql".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(deployment_name(&self.name, Tier::Database), Tier::Database),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels(&self.name, Tier::Database)),
                    ..Default::default()
                },
                // Single writer on the data volume; never run old and new
                // MySQL pods side by side.
                strategy: Some(DeploymentStrategy {
                    type_: Some("Recreate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels(&self.name, Tier::Database)),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Build the ClusterIP service for the database tier
    pub fn build_database_service(&self) -> Service {
        self.build_service(Tier::Database, DATABASE_PORT, DATABASE_PORT, "mysql")
    }

    /// Build the API deployment for the backend tier
    pub fn build_backend_deployment(&self) -> Deployment {
        let secret = secret_name(&self.name);
        let backend = &self.spec.backend;

        let container = Container {
            name: "api".to_string(),
            image: Some(backend.get_image()),
            ports: Some(vec![ContainerPort {
                container_port: BACKEND_PORT,
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(vec![
                EnvVar {
                    name: "MYSQL_HOST".to_string(),
                    value: Some(service_name(&self.name, Tier::Database)),
                    ..Default::default()
                },
                EnvVar {
                    name: "MYSQL_PORT".to_string(),
                    value: Some(DATABASE_PORT.to_string()),
                    ..Default::default()
                },
                EnvVar {
                    name: "MYSQL_DATABASE".to_string(),
                    value: Some(self.spec.database.database_name.clone()),
                    ..Default::default()
                },
                secret_env("MYSQL_USER", &secret, "username"),
                secret_env("MYSQL_PASSWORD", &secret, "password"),
            ]),
            readiness_probe: Some(http_probe("/healthz", BACKEND_PORT)),
            ..Default::default()
        };

        self.build_deployment(Tier::Backend, backend.replicas, container)
    }

    /// Build the ClusterIP service for the backend tier
    pub fn build_backend_service(&self) -> Service {
        self.build_service(Tier::Backend, BACKEND_PORT, BACKEND_PORT, "http")
    }

    /// Build the web deployment for the frontend tier
    pub fn build_frontend_deployment(&self) -> Deployment {
        let frontend = &self.spec.frontend;

        let mut env = vec![EnvVar {
            name: "GUESTBOOK_BACKEND_URL".to_string(),
            value: Some(format!(
                "http://{}:{}",
                service_name(&self.name, Tier::Backend),
                BACKEND_PORT
            )),
            ..Default::default()
        }];
        if let Some(ref title) = frontend.title {
            env.push(EnvVar {
                name: "GUESTBOOK_TITLE".to_string(),
                value: Some(title.clone()),
                ..Default::default()
            });
        }

        let container = Container {
            name: "web".to_string(),
            image: Some(frontend.get_image()),
            ports: Some(vec![ContainerPort {
                container_port: FRONTEND_PORT,
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(env),
            readiness_probe: Some(http_probe("/", FRONTEND_PORT)),
            ..Default::default()
        };

        self.build_deployment(Tier::Frontend, frontend.replicas, container)
    }

    /// Build the ClusterIP service for the frontend tier
    pub fn build_frontend_service(&self) -> Service {
        self.build_service(Tier::Frontend, 80, FRONTEND_PORT, "http")
    }

    /// Deployment descriptor for a tier, dispatched by tier
    pub fn deployment_for(&self, tier: Tier) -> Deployment {
        match tier {
            Tier::Database => self.build_database_deployment(),
            Tier::Backend => self.build_backend_deployment(),
            Tier::Frontend => self.build_frontend_deployment(),
        }
    }

    fn build_deployment(&self, tier: Tier, replicas: i32, container: Container) -> Deployment {
        Deployment {
            metadata: self.metadata(deployment_name(&self.name, tier), tier),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(labels(&self.name, tier)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels(&self.name, tier)),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_service(&self, tier: Tier, port: i32, target_port: i32, port_name: &str) -> Service {
        Service {
            metadata: self.metadata(service_name(&self.name, tier), tier),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(labels(&self.name, tier)),
                ports: Some(vec![ServicePort {
                    name: Some(port_name.to_string()),
                    port,
                    target_port: Some(IntOrString::Int(target_port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::GuestbookAppSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_app(name: &str) -> GuestbookApp {
        GuestbookApp {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid-123".to_string()),
                ..Default::default()
            },
            spec: GuestbookAppSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_derived_names_are_deterministic() {
        assert_eq!(deployment_name("my-app", Tier::Database), "my-app-mysql");
        assert_eq!(deployment_name("my-app", Tier::Backend), "my-app-backend");
        assert_eq!(deployment_name("my-app", Tier::Frontend), "my-app-frontend");
        assert_eq!(secret_name("my-app"), "my-app-mysql-auth");
        assert_eq!(
            service_name("my-app", Tier::Backend),
            deployment_name("my-app", Tier::Backend)
        );
    }

    #[test]
    fn test_labels_carry_join_keys() {
        let labels = labels("my-app", Tier::Backend);
        assert_eq!(labels.get("app").map(String::as_str), Some("guestbook"));
        assert_eq!(labels.get("owner").map(String::as_str), Some("my-app"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("backend"));
        assert_eq!(labels.len(), 3);
    }

    #[test]
    fn test_build_auth_secret() {
        let app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let secret = builder.build_auth_secret();

        assert_eq!(secret.metadata.name, Some("my-app-mysql-auth".to_string()));
        let data = secret.string_data.unwrap();
        assert_eq!(data.get("username").map(String::as_str), Some("guestbook"));
        assert!(data.contains_key("password"));
    }

    #[test]
    fn test_build_database_deployment() {
        let app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let dep = builder.build_database_deployment();

        assert_eq!(dep.metadata.name, Some("my-app-mysql".to_string()));
        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.strategy.and_then(|s| s.type_),
            Some("Recreate".to_string())
        );

        let container = &spec.template.spec.unwrap().containers[0];
        assert_eq!(container.image, Some("mysql:8.0".to_string()));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "MYSQL_DATABASE"));
        let user = env.iter().find(|e| e.name == "MYSQL_USER").unwrap();
        let key_ref = user
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(key_ref.name, "my-app-mysql-auth");
        assert_eq!(key_ref.key, "username");
    }

    #[test]
    fn test_build_backend_deployment_wires_database() {
        let app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let dep = builder.build_backend_deployment();

        let container = &dep.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(
            container.image,
            Some("ghcr.io/guestbook/guestbook-api:1.0.0".to_string())
        );
        let env = container.env.as_ref().unwrap();
        let host = env.iter().find(|e| e.name == "MYSQL_HOST").unwrap();
        assert_eq!(host.value, Some("my-app-mysql".to_string()));
    }

    #[test]
    fn test_backend_replicas_propagate() {
        let mut app = test_app("my-app");
        app.spec.backend.replicas = 3;
        let builder = ResourceBuilder::new(&app).unwrap();
        let dep = builder.build_backend_deployment();

        assert_eq!(dep.spec.unwrap().replicas, Some(3));
    }

    #[test]
    fn test_frontend_title_env() {
        let mut app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let without = builder.build_frontend_deployment();
        let env = without.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert!(!env.iter().any(|e| e.name == "GUESTBOOK_TITLE"));

        app.spec.frontend.title = Some("Welcome".to_string());
        let builder = ResourceBuilder::new(&app).unwrap();
        let with = builder.build_frontend_deployment();
        let env = with.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        let title = env.iter().find(|e| e.name == "GUESTBOOK_TITLE").unwrap();
        assert_eq!(title.value, Some("Welcome".to_string()));
    }

    #[test]
    fn test_service_selector_matches_labels() {
        let app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let svc = builder.build_backend_service();

        assert_eq!(svc.metadata.name, Some("my-app-backend".to_string()));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.selector, Some(labels("my-app", Tier::Backend)));
        assert_eq!(spec.ports.unwrap()[0].port, BACKEND_PORT);
    }

    #[test]
    fn test_frontend_service_exposes_port_80() {
        let app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let svc = builder.build_frontend_service();

        let port = &svc.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(FRONTEND_PORT)));
    }

    #[test]
    fn test_owner_references() {
        let app = test_app("my-app");
        let builder = ResourceBuilder::new(&app).unwrap();
        let dep = builder.build_database_deployment();

        let owner_refs = dep.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owner_refs.len(), 1);
        assert_eq!(owner_refs[0].kind, "GuestbookApp");
        assert_eq!(owner_refs[0].name, "my-app");
        assert_eq!(owner_refs[0].controller, Some(true));
    }

    #[test]
    fn test_builder_requires_name() {
        let mut app = test_app("my-app");
        app.metadata.name = None;
        assert!(ResourceBuilder::new(&app).is_err());
    }
}
