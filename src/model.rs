//! The closed set of object kinds the engine reads and writes, and their identities.

use crate::crd::ConsensusSet;
use crate::errors::*;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use std::fmt;

/// Group/version/kind of an object handled through the dynamic API.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl CustomKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        CustomKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn of_dynamic(o: &DynamicObject) -> Self {
        let (api_version, kind) = o
            .types
            .as_ref()
            .map(|t| (t.api_version.as_str(), t.kind.as_str()))
            .unwrap_or(("", ""));
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        CustomKind::new(group, version, kind)
    }
}

/// Implemented by every concrete kind wrapped in [`Object`].
pub trait TypedObject: Sized {
    fn object_kind() -> ObjectKind;
    fn from_object(obj: &Object) -> Option<&Self>;
    fn from_object_mut(obj: &mut Object) -> Option<&mut Self>;
}

macro_rules! object_kinds {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        /// One kubernetes object, desired or observed.
        #[derive(Clone, Debug)]
        pub enum Object {
            $($variant(Box<$ty>),)*
            Custom(Box<DynamicObject>),
        }

        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ObjectKind {
            $($variant,)*
            Custom(CustomKind),
        }

        impl Object {
            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Object::$variant(o) => &o.metadata,)*
                    Object::Custom(o) => &o.metadata,
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Object::$variant(o) => &mut o.metadata,)*
                    Object::Custom(o) => &mut o.metadata,
                }
            }

            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(Object::$variant(_) => ObjectKind::$variant,)*
                    Object::Custom(o) => ObjectKind::Custom(CustomKind::of_dynamic(o)),
                }
            }

            pub fn to_value(&self) -> Result<serde_json::Value> {
                let v = match self {
                    $(Object::$variant(o) => serde_json::to_value(o)?,)*
                    Object::Custom(o) => serde_json::to_value(o)?,
                };
                Ok(v)
            }
        }

        impl fmt::Display for ObjectKind {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(ObjectKind::$variant => f.write_str(stringify!($variant)),)*
                    ObjectKind::Custom(c) => write!(f, "{}.{}", c.kind, c.group),
                }
            }
        }

        $(
            impl From<$ty> for Object {
                fn from(o: $ty) -> Self {
                    Object::$variant(Box::new(o))
                }
            }

            impl TypedObject for $ty {
                fn object_kind() -> ObjectKind {
                    ObjectKind::$variant
                }

                fn from_object(obj: &Object) -> Option<&Self> {
                    match obj {
                        Object::$variant(o) => Some(&**o),
                        _ => None,
                    }
                }

                fn from_object_mut(obj: &mut Object) -> Option<&mut Self> {
                    match obj {
                        Object::$variant(o) => Some(&mut **o),
                        _ => None,
                    }
                }
            }
        )*
    };
}

object_kinds! {
    ConsensusSet => ConsensusSet,
    StatefulSet => StatefulSet,
    Service => Service,
    ConfigMap => ConfigMap,
    Secret => Secret,
    Deployment => Deployment,
    PodDisruptionBudget => PodDisruptionBudget,
    PersistentVolumeClaim => PersistentVolumeClaim,
    Job => Job,
    Pod => Pod,
}

impl From<DynamicObject> for Object {
    fn from(o: DynamicObject) -> Self {
        Object::Custom(Box::new(o))
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.to_value().ok() == other.to_value().ok()
    }
}

impl Object {
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            kind: self.kind(),
            namespace: self.namespace().to_string(),
            name: self.name().to_string(),
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.meta()
            .finalizers
            .as_ref()
            .map_or(false, |fs| fs.iter().any(|f| f == finalizer))
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        match self.meta_mut().finalizers.as_mut() {
            Some(fs) => {
                let before = fs.len();
                fs.retain(|f| f != finalizer);
                before != fs.len()
            }
            None => false,
        }
    }

    pub fn as_typed<T: TypedObject>(&self) -> Option<&T> {
        T::from_object(self)
    }
}

/// Vertex identity: at most one vertex per key in a graph.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::{ApiResource, GroupVersionKind};

    fn named_cm(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                finalizers: Some(vec!["a".to_string(), "b".to_string()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn keys_order_by_kind_first() {
        let sts: Object = StatefulSet {
            metadata: ObjectMeta {
                name: Some("z".into()),
                ..Default::default()
            },
            ..Default::default()
        }
        .into();
        let cm: Object = named_cm("a").into();
        assert!(sts.key() < cm.key());
        assert_eq!(cm.key().to_string(), "ConfigMap/default/a");
    }

    #[test]
    fn finalizer_removal_reports_presence() {
        let mut cm: Object = named_cm("a").into();
        assert!(cm.has_finalizer("a"));
        assert!(cm.remove_finalizer("a"));
        assert!(!cm.remove_finalizer("a"));
        assert!(cm.has_finalizer("b"));
    }

    #[test]
    fn custom_kind_comes_from_type_meta() {
        let gvk = GroupVersionKind::gvk("dataprotection.pikach.us", "v1alpha1", "Backup");
        let ar = ApiResource::from_gvk(&gvk);
        let backup: Object = DynamicObject::new("b-1", &ar).within("default").into();
        assert_eq!(
            backup.kind(),
            ObjectKind::Custom(CustomKind::new("dataprotection.pikach.us", "v1alpha1", "Backup"))
        );
        assert_eq!(backup.namespace(), "default");
    }

    #[test]
    fn typed_lookup_only_matches_its_variant() {
        let cm: Object = named_cm("a").into();
        assert!(cm.as_typed::<ConfigMap>().is_some());
        assert!(cm.as_typed::<Service>().is_none());
        assert_eq!(ConfigMap::object_kind(), ObjectKind::ConfigMap);
    }
}
