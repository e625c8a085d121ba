use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{ResourceExt, api::ObjectMeta};

use crate::config::SOURCE_LABEL;

/// Builds the copy of `source` that should live in `target`.
///
/// Only name, labels, annotations and payload are carried over; identity fields of the
/// source object (uid, resource version, owners, timestamps) never leave its namespace.
pub fn mirror_secret(source: &Secret, target: &str) -> Secret {
    let mut labels = source.labels().clone();
    labels.insert(
        SOURCE_LABEL.to_owned(),
        source.namespace().unwrap_or_default(),
    );

    Secret {
        metadata: ObjectMeta {
            name: Some(source.name_any()),
            namespace: Some(target.to_owned()),
            labels: Some(labels),
            annotations: Some(source.annotations().clone()),
            ..ObjectMeta::default()
        },
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        type_: source.type_.clone(),
        immutable: source.immutable,
    }
}

/// True when `observed` already holds everything `desired` would write.
pub fn is_up_to_date(desired: &Secret, observed: &Secret) -> bool {
    desired.type_.as_deref().unwrap_or("Opaque") == observed.type_.as_deref().unwrap_or("Opaque")
        && non_empty(&desired.data) == non_empty(&observed.data)
        && desired.string_data.is_none()
        && desired.immutable.unwrap_or(false) == observed.immutable.unwrap_or(false)
        && desired.labels() == observed.labels()
        && desired.annotations() == observed.annotations()
}

fn non_empty<V>(map: &Option<BTreeMap<String, V>>) -> Option<&BTreeMap<String, V>> {
    map.as_ref().filter(|m| !m.is_empty())
}

/// The source namespace recorded on a mirrored copy, if any.
pub fn mirrored_from(secret: &Secret) -> Option<&str> {
    secret.labels().get(SOURCE_LABEL).map(String::as_str)
}
