//! Per-kind update merges and status patches.
//!
//! An update never sends the desired object as is: it is merged into the live
//! one so that fields owned by other controllers survive.

use crate::crd::ConsensusSet;
use crate::errors::*;
use crate::model::Object;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

pub trait UpdateMerge: Sized {
    /// Returns `current` carrying the fields of `self` that the operator owns.
    fn merge_into(&self, current: &Self) -> Self;
}

fn merge_map(
    current: &Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (current, desired) {
        (None, None) => None,
        _ => {
            let mut out = current.clone().unwrap_or_default();
            out.extend(desired.clone().unwrap_or_default());
            Some(out)
        }
    }
}

fn merge_labels(desired: &ObjectMeta, current: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        labels: merge_map(&current.labels, &desired.labels),
        annotations: merge_map(&current.annotations, &desired.annotations),
        ..current.clone()
    }
}

fn pass_through(desired: &ObjectMeta, current: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        resource_version: current.resource_version.clone(),
        uid: current.uid.clone(),
        ..desired.clone()
    }
}

impl UpdateMerge for StatefulSet {
    fn merge_into(&self, current: &Self) -> Self {
        let mut out = current.clone();
        out.metadata = merge_labels(&self.metadata, &current.metadata);
        out.metadata.finalizers = self.metadata.finalizers.clone();
        if let Some(desired) = &self.spec {
            let spec = out.spec.get_or_insert_with(Default::default);
            spec.template = desired.template.clone();
            spec.replicas = desired.replicas;
            spec.update_strategy = desired.update_strategy.clone();
        }
        out
    }
}

impl UpdateMerge for Service {
    fn merge_into(&self, current: &Self) -> Self {
        let mut out = current.clone();
        out.metadata = merge_labels(&self.metadata, &current.metadata);
        out.metadata.finalizers = self.metadata.finalizers.clone();
        let mut spec = self.spec.clone().unwrap_or_default();
        if let Some(live) = &current.spec {
            spec.cluster_ip = live.cluster_ip.clone();
            spec.cluster_ips = live.cluster_ips.clone();
        }
        out.spec = Some(spec);
        out
    }
}

impl UpdateMerge for Deployment {
    fn merge_into(&self, current: &Self) -> Self {
        let mut out = current.clone();
        out.metadata = merge_labels(&self.metadata, &current.metadata);
        let mut spec = self.spec.clone().unwrap_or_default();
        if let Some(live) = &current.spec {
            let live_annotations = live.template.metadata.as_ref().and_then(|m| m.annotations.clone());
            let meta = spec.template.metadata.get_or_insert_with(Default::default);
            meta.annotations = merge_map(&live_annotations, &meta.annotations);
        }
        out.spec = Some(spec);
        out
    }
}

impl UpdateMerge for PersistentVolumeClaim {
    fn merge_into(&self, current: &Self) -> Self {
        let mut out = current.clone();
        let storage = self
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .cloned();
        if let Some(storage) = storage {
            out.spec
                .get_or_insert_with(Default::default)
                .resources
                .get_or_insert_with(Default::default)
                .requests
                .get_or_insert_with(Default::default)
                .insert("storage".to_string(), storage);
        }
        out
    }
}

macro_rules! pass_through_merge {
    ($($ty:ty),*) => {
        $(
            impl UpdateMerge for $ty {
                fn merge_into(&self, current: &Self) -> Self {
                    let mut out = self.clone();
                    out.metadata = pass_through(&self.metadata, &current.metadata);
                    out
                }
            }
        )*
    };
}

pass_through_merge!(Secret, ConfigMap, DynamicObject, PodDisruptionBudget);

macro_rules! metadata_only_merge {
    ($($ty:ty),*) => {
        $(
            impl UpdateMerge for $ty {
                fn merge_into(&self, current: &Self) -> Self {
                    let mut out = current.clone();
                    out.metadata.labels = merge_map(&current.metadata.labels, &self.metadata.labels);
                    out.metadata.finalizers = self.metadata.finalizers.clone();
                    out
                }
            }
        )*
    };
}

metadata_only_merge!(Job, Pod, ConsensusSet);

impl Object {
    /// Dispatches to the kind's [`UpdateMerge`]; both sides must be the same kind.
    pub fn merge_into(&self, current: &Object) -> Result<Object> {
        let merged: Object = match (self, current) {
            (Object::ConsensusSet(d), Object::ConsensusSet(c)) => d.merge_into(c).into(),
            (Object::StatefulSet(d), Object::StatefulSet(c)) => d.merge_into(c).into(),
            (Object::Service(d), Object::Service(c)) => d.merge_into(c).into(),
            (Object::ConfigMap(d), Object::ConfigMap(c)) => d.merge_into(c).into(),
            (Object::Secret(d), Object::Secret(c)) => d.merge_into(c).into(),
            (Object::Deployment(d), Object::Deployment(c)) => d.merge_into(c).into(),
            (Object::PodDisruptionBudget(d), Object::PodDisruptionBudget(c)) => d.merge_into(c).into(),
            (Object::PersistentVolumeClaim(d), Object::PersistentVolumeClaim(c)) => d.merge_into(c).into(),
            (Object::Job(d), Object::Job(c)) => d.merge_into(c).into(),
            (Object::Pod(d), Object::Pod(c)) => d.merge_into(c).into(),
            (Object::Custom(d), Object::Custom(c)) if self.kind() == current.kind() => {
                d.merge_into(c).into()
            }
            _ => bail!(ErrorKind::WrongVertexType(format!(
                "{} merged into {}",
                self.key(),
                current.key()
            ))),
        };
        Ok(merged)
    }
}

/// JSON merge patch turning `old` into `new`.
pub fn merge_patch_diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut patch = Map::new();
            for (k, nv) in n {
                match o.get(k) {
                    Some(ov) if ov == nv => {}
                    Some(ov @ Value::Object(_)) if nv.is_object() => {
                        patch.insert(k.clone(), merge_patch_diff(ov, nv));
                    }
                    _ => {
                        patch.insert(k.clone(), nv.clone());
                    }
                }
            }
            for k in o.keys() {
                if !n.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// `{"status": diff}` between two versions of an object, None if the status did not change.
pub fn status_patch(old: &Object, new: &Object) -> Result<Option<Value>> {
    let status = |o: &Object| -> Result<Value> {
        Ok(match o.to_value()?.get("status") {
            Some(s) if !s.is_null() => s.clone(),
            _ => json!({}),
        })
    };
    let diff = merge_patch_diff(&status(old)?, &status(new)?);
    match &diff {
        Value::Object(m) if m.is_empty() => Ok(None),
        _ => Ok(Some(json!({ "status": diff }))),
    }
}
