//! Renders an instance's configuration into cluster manifests.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext, Service, ServiceAccount, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;

use crate::cluster::{CustomObject, CustomResourceRef, Manifest};
use crate::error::Error;
use crate::labels::{pod_selector, resource_labels};

use super::{Instance, derived_name};

const REPLICAS: i32 = 1;

pub(crate) fn config_map_name(k8s_name: &str) -> String {
    derived_name(k8s_name, "files")
}

pub(crate) fn volume_claim_name(k8s_name: &str) -> String {
    derived_name(k8s_name, "volume")
}

pub(crate) fn network_policy_name(k8s_name: &str) -> String {
    derived_name(k8s_name, "deny-all")
}

fn metadata(instance: &Instance, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(instance.namespace().to_owned()),
        labels: Some(labels_for(instance)),
        ..ObjectMeta::default()
    }
}

/// Labels for resources of `instance`. Sidecar resources carry their
/// parent's `app` label so selectors pick the shared pod.
fn labels_for(instance: &Instance) -> BTreeMap<String, String> {
    resource_labels(
        instance.pod_owner(),
        instance.deps.scope().as_str(),
        instance.instance_type.as_str(),
    )
}

/// Service exposing the union of the pod members' ports, or `None` when
/// no member exposes a port.
pub(crate) fn service(instance: &Instance) -> Option<Manifest> {
    let mut ports = Vec::new();
    let mut seen = Vec::new();
    for member in instance.pod_members() {
        let tcp = member.network.tcp_ports.iter().map(|port| ("TCP", *port));
        let udp = member.network.udp_ports.iter().map(|port| ("UDP", *port));
        for (protocol, port) in tcp.chain(udp) {
            if seen.contains(&(protocol, port)) {
                continue;
            }
            seen.push((protocol, port));
            ports.push(ServicePort {
                name: Some(format!("{}-{port}", protocol.to_ascii_lowercase())),
                port: i32::from(port),
                protocol: Some(protocol.to_owned()),
                target_port: Some(IntOrString::Int(i32::from(port))),
                ..ServicePort::default()
            });
        }
    }
    if ports.is_empty() {
        return None;
    }
    Some(Manifest::Service(Service {
        metadata: metadata(instance, instance.k8s_name.clone()),
        spec: Some(ServiceSpec {
            selector: Some(pod_selector(&instance.k8s_name)),
            ports: Some(ports),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }))
}

/// Carries the live object's identity over to an updated Service.
pub(crate) fn merge_service_identity(desired: &mut Manifest, live: &Manifest) {
    let (Manifest::Service(desired), Some(live)) = (desired, live.as_service()) else {
        return;
    };
    desired.metadata.resource_version = live.metadata.resource_version.clone();
    if let (Some(spec), Some(live_spec)) = (desired.spec.as_mut(), live.spec.as_ref()) {
        spec.cluster_ip = live_spec.cluster_ip.clone();
    }
}

/// PersistentVolumeClaim backing the instance's volume.
pub(crate) fn volume_claim(instance: &Instance) -> Option<Manifest> {
    let volume = instance.storage.volume.as_ref()?;
    Some(Manifest::PersistentVolumeClaim(PersistentVolumeClaim {
        metadata: metadata(instance, volume_claim_name(&instance.k8s_name)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![String::from("ReadWriteOnce")]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    String::from("storage"),
                    Quantity(volume.size.clone()),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }))
}

/// ConfigMap holding files added after commit.
pub(crate) fn config_map(instance: &Instance) -> Option<Manifest> {
    let mut data = BTreeMap::new();
    let mut binary_data = BTreeMap::new();
    for file in instance.storage.mounted_files() {
        let contents = file.contents.clone().unwrap_or_default();
        match String::from_utf8(contents) {
            Ok(text) => {
                data.insert(file.key.clone(), text);
            }
            Err(err) => {
                binary_data.insert(file.key.clone(), ByteString(err.into_bytes()));
            }
        }
    }
    if data.is_empty() && binary_data.is_empty() {
        return None;
    }
    Some(Manifest::ConfigMap(ConfigMap {
        metadata: metadata(instance, config_map_name(&instance.k8s_name)),
        data: Some(data).filter(|map| !map.is_empty()),
        binary_data: Some(binary_data).filter(|map| !map.is_empty()),
        ..ConfigMap::default()
    }))
}

pub(crate) fn service_account(instance: &Instance) -> Manifest {
    Manifest::ServiceAccount(ServiceAccount {
        metadata: metadata(instance, instance.k8s_name.clone()),
        ..ServiceAccount::default()
    })
}

/// Role granting the union of the pod members' rules, or `None` when there
/// are none.
pub(crate) fn role(instance: &Instance) -> Option<Manifest> {
    let rules: Vec<PolicyRule> = instance
        .pod_members()
        .into_iter()
        .flat_map(|member| member.resources.policy_rules.iter().cloned())
        .collect();
    if rules.is_empty() {
        return None;
    }
    Some(Manifest::Role(Role {
        metadata: metadata(instance, instance.k8s_name.clone()),
        rules: Some(rules),
    }))
}

pub(crate) fn role_binding(instance: &Instance) -> Manifest {
    Manifest::RoleBinding(RoleBinding {
        metadata: metadata(instance, instance.k8s_name.clone()),
        role_ref: RoleRef {
            api_group: String::from("rbac.authorization.k8s.io"),
            kind: String::from("Role"),
            name: instance.k8s_name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: String::from("ServiceAccount"),
            name: instance.k8s_name.clone(),
            namespace: Some(instance.namespace().to_owned()),
            ..Subject::default()
        }]),
    })
}

/// NetworkPolicy denying all ingress and egress for the instance's pod.
pub(crate) fn deny_all_policy(instance: &Instance) -> Result<Manifest, Error> {
    let body = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": network_policy_name(&instance.k8s_name),
            "namespace": instance.namespace(),
            "labels": labels_for(instance),
        },
        "spec": {
            "podSelector": { "matchLabels": pod_selector(&instance.k8s_name) },
            "policyTypes": ["Ingress", "Egress"],
        },
    });
    serde_json::from_value::<NetworkPolicy>(body)
        .map(Manifest::NetworkPolicy)
        .map_err(|err| Error::validation(&instance.k8s_name, "network policy", err.to_string()))
}

/// Custom fault object targeting every pod carrying the owner's `app`
/// label. `spec` holds the fault-specific fields.
pub(crate) fn fault(
    instance: &Instance,
    resource: CustomResourceRef,
    name: String,
    mut spec: serde_json::Map<String, serde_json::Value>,
) -> Manifest {
    spec.insert(String::from("mode"), json!("all"));
    spec.insert(
        String::from("selector"),
        json!({
            "namespaces": [instance.namespace()],
            "labelSelectors": pod_selector(instance.pod_owner()),
        }),
    );
    let body = json!({
        "apiVersion": resource.api_version(),
        "kind": resource.kind,
        "metadata": {
            "name": name,
            "namespace": instance.namespace(),
            "labels": labels_for(instance),
        },
        "spec": spec,
    });
    Manifest::Custom(CustomObject {
        resource,
        name,
        body,
    })
}

/// Single-replica ReplicaSet running the primary container plus one
/// container per sidecar.
pub(crate) fn replica_set(instance: &Instance) -> Manifest {
    let members = instance.pod_members();
    let init_image = &instance.deps.config().init_image;
    let containers = members.iter().map(|member| container(member)).collect();
    let init_containers: Vec<Container> = members
        .iter()
        .filter_map(|member| volume_init_container(member, init_image))
        .collect();
    let volumes: Vec<Volume> = members.iter().flat_map(|member| pod_volumes(member)).collect();
    let labels = labels_for(instance);
    Manifest::ReplicaSet(ReplicaSet {
        metadata: metadata(instance, instance.k8s_name.clone()),
        spec: Some(ReplicaSetSpec {
            replicas: Some(REPLICAS),
            selector: LabelSelector {
                match_labels: Some(pod_selector(&instance.k8s_name)),
                ..LabelSelector::default()
            },
            template: Some(PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(instance.k8s_name.clone()),
                    containers,
                    init_containers: Some(init_containers).filter(|list| !list.is_empty()),
                    volumes: Some(volumes).filter(|list| !list.is_empty()),
                    ..PodSpec::default()
                }),
            }),
            ..ReplicaSetSpec::default()
        }),
        ..ReplicaSet::default()
    })
}

/// Returns `true` once every desired replica reports ready.
pub(crate) fn is_ready(replica_set: &ReplicaSet) -> bool {
    let desired = replica_set
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(REPLICAS);
    let ready = replica_set
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    ready == desired
}

fn container(member: &Instance) -> Container {
    let build = &member.build;
    let env: Vec<EnvVar> = build
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect();
    let ports: Vec<ContainerPort> = member
        .network
        .tcp_ports
        .iter()
        .map(|port| ("TCP", *port))
        .chain(member.network.udp_ports.iter().map(|port| ("UDP", *port)))
        .map(|(protocol, port)| ContainerPort {
            container_port: i32::from(port),
            protocol: Some(protocol.to_owned()),
            ..ContainerPort::default()
        })
        .collect();
    Container {
        name: member.k8s_name.clone(),
        image: Some(build.image_name.clone()),
        image_pull_policy: Some(build.pull_policy.as_str().to_owned()),
        command: Some(build.command.clone()).filter(|cmd| !cmd.is_empty()),
        args: Some(build.args.clone()).filter(|args| !args.is_empty()),
        env: Some(env).filter(|env| !env.is_empty()),
        ports: Some(ports).filter(|ports| !ports.is_empty()),
        resources: resource_requirements(member),
        security_context: security_context(member),
        liveness_probe: member.monitoring.liveness.clone(),
        readiness_probe: member.monitoring.readiness.clone(),
        startup_probe: member.monitoring.startup.clone(),
        volume_mounts: Some(volume_mounts(member)).filter(|mounts| !mounts.is_empty()),
        ..Container::default()
    }
}

fn resource_requirements(member: &Instance) -> Option<ResourceRequirements> {
    let resources = &member.resources;
    let quantities = |cpu: &Option<String>, memory: &Option<String>| {
        let map: BTreeMap<String, Quantity> = [("cpu", cpu), ("memory", memory)]
            .into_iter()
            .filter_map(|(key, value)| {
                value
                    .as_ref()
                    .map(|value| (key.to_owned(), Quantity(value.clone())))
            })
            .collect();
        Some(map).filter(|map| !map.is_empty())
    };
    let requests = quantities(&resources.cpu_request, &resources.memory_request);
    let limits = quantities(&resources.cpu_limit, &resources.memory_limit);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests,
        limits,
        ..ResourceRequirements::default()
    })
}

fn security_context(member: &Instance) -> Option<SecurityContext> {
    let security = &member.security;
    if !security.privileged && security.capabilities.is_empty() {
        return None;
    }
    Some(SecurityContext {
        privileged: Some(security.privileged),
        capabilities: Some(Capabilities {
            add: Some(security.capabilities.clone()),
            ..Capabilities::default()
        })
        .filter(|_| !security.capabilities.is_empty()),
        ..SecurityContext::default()
    })
}

fn volume_mounts(member: &Instance) -> Vec<VolumeMount> {
    let mut mounts = Vec::new();
    if let Some(volume) = member.storage.volume.as_ref() {
        mounts.push(VolumeMount {
            name: volume_claim_name(&member.k8s_name),
            mount_path: volume.path.clone(),
            ..VolumeMount::default()
        });
    }
    for file in member.storage.mounted_files() {
        mounts.push(VolumeMount {
            name: config_map_name(&member.k8s_name),
            mount_path: file.dest.clone(),
            sub_path: Some(file.key.clone()),
            ..VolumeMount::default()
        });
    }
    mounts
}

fn pod_volumes(member: &Instance) -> Vec<Volume> {
    let mut volumes = Vec::new();
    if member.storage.volume.is_some() {
        let name = volume_claim_name(&member.k8s_name);
        volumes.push(Volume {
            name: name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: name,
                read_only: None,
            }),
            ..Volume::default()
        });
    }
    let items: Vec<KeyToPath> = member
        .storage
        .mounted_files()
        .map(|file| KeyToPath {
            key: file.key.clone(),
            path: file.key.clone(),
            mode: file.permission.and_then(|mode| i32::try_from(mode).ok()),
        })
        .collect();
    if !items.is_empty() {
        let name = config_map_name(&member.k8s_name);
        volumes.push(Volume {
            name: name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name,
                items: Some(items),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        });
    }
    volumes
}

fn volume_init_container(member: &Instance, init_image: &str) -> Option<Container> {
    let volume = member.storage.volume.as_ref()?;
    let owner = volume.owner.as_ref()?;
    Some(Container {
        name: derived_name(&member.k8s_name, "volume-init"),
        image: Some(init_image.to_owned()),
        command: Some(vec![
            String::from("chown"),
            String::from("-R"),
            owner.clone(),
            volume.path.clone(),
        ]),
        security_context: Some(SecurityContext {
            run_as_user: Some(0),
            ..SecurityContext::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: volume_claim_name(&member.k8s_name),
            mount_path: volume.path.clone(),
            ..VolumeMount::default()
        }]),
        ..Container::default()
    })
}
