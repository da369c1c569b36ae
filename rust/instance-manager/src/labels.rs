//! Naming rules, reserved labels and annotations, and content-addressed child names

use std::collections::BTreeMap;

use const_format::concatcp;
use openssl::sha::Sha256;

use crate::config::RuntimeOptions;

pub const LABEL_PREFIX: &str = "rpaas.extensions.tsuru.io/";

pub const LABEL_SERVICE_NAME: &str = concatcp!(LABEL_PREFIX, "service-name");
pub const LABEL_INSTANCE_NAME: &str = concatcp!(LABEL_PREFIX, "instance-name");
pub const LABEL_TEAM_OWNER: &str = concatcp!(LABEL_PREFIX, "team-owner");
pub const LABEL_CLUSTER_NAME: &str = concatcp!(LABEL_PREFIX, "cluster-name");
pub const LABEL_IS_FILE: &str = concatcp!(LABEL_PREFIX, "is-file");
pub const LABEL_FILE_NAME: &str = concatcp!(LABEL_PREFIX, "file-name");

pub const ANNOTATION_DESCRIPTION: &str = concatcp!(LABEL_PREFIX, "description");
pub const ANNOTATION_TAGS: &str = concatcp!(LABEL_PREFIX, "tags");
pub const ANNOTATION_TEAM_OWNER: &str = LABEL_TEAM_OWNER;
pub const ANNOTATION_SHA256_HASH: &str = concatcp!(LABEL_PREFIX, "sha256-hash");
pub const ANNOTATION_EXTRA_FILES_LAST_UPDATE: &str =
    concatcp!(LABEL_PREFIX, "extra-files-last-update");
pub const ANNOTATION_ALLOWED_DNS_ZONES: &str = concatcp!(LABEL_PREFIX, "allowed-dns-zones");

pub const LEGACY_LABEL_SERVICE: &str = "rpaas_service";
pub const LEGACY_LABEL_INSTANCE: &str = "rpaas_instance";

/// Maximum length of an instance name
pub const MAX_INSTANCE_NAME_LEN: usize = 30;

/// Whether `key` belongs to the manager and may not be set by users
pub fn is_reserved(key: &str) -> bool {
    key.starts_with(LABEL_PREFIX) || key == LEGACY_LABEL_SERVICE || key == LEGACY_LABEL_INSTANCE
}

/// Namespace an instance (and the plans and flavors it refers to) lives in
pub fn namespace_for(opts: &RuntimeOptions, pool: Option<&str>) -> String {
    match pool.filter(|pool| !pool.is_empty()) {
        Some(pool) if opts.namespaced_instances => format!("{}-{pool}", opts.service_name),
        _ => opts.service_name.clone(),
    }
}

/// Labels identifying the objects that belong to one instance
pub fn instance_labels(service: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SERVICE_NAME.to_string(), service.to_string()),
        (LABEL_INSTANCE_NAME.to_string(), instance.to_string()),
        (LEGACY_LABEL_SERVICE.to_string(), service.to_string()),
        (LEGACY_LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Labels of the config-map holding the extra file `file_name`
pub fn extra_file_labels(
    service: &str,
    instance: &str,
    file_name: &str,
) -> BTreeMap<String, String> {
    let mut labels = instance_labels(service, instance);
    labels.insert(LABEL_IS_FILE.to_string(), "true".to_string());
    labels.insert(LABEL_FILE_NAME.to_string(), file_name.to_string());
    labels
}

pub fn extra_files_generate_name(instance: &str) -> String {
    format!("{instance}-extra-files-")
}

/// Deterministic name of the secret holding `data`
pub fn certificate_secret_name(instance: &str, data: &BTreeMap<String, Vec<u8>>) -> String {
    format!("{instance}-certificates-{}", &content_hash(data)[..10])
}

/// Hex-encoded SHA-256 over the sorted keys and values of `data`
pub fn content_hash(data: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update(&(value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hasher
        .finish()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
