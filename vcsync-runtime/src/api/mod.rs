//! Normalized access to the object APIs of one cluster.
//!
//! Every read and write the engine performs goes through [`ObjectApi`], an
//! object-safe surface over [`DynamicObject`] with the error taxonomy the
//! reconcilers rely on already applied: not-found reads come back as
//! `Ok(None)`, and the create/replace/delete verbs report `AlreadyExists`
//! and `Conflict` as first-class variants instead of status codes.
//! [`ApiBackend`] hands out one such surface per resource, plus the raw
//! watch stream the informer layer feeds from. The production backend wraps
//! a [`kube::Client`]; tests swap in an in-memory one with the same
//! semantics.

use crate::sync::SyncObject;
use futures::stream::BoxStream;
use kube::{
    api::{ApiResource, DynamicObject},
    runtime::watcher,
    Resource,
};
use serde_json::Value;
use std::marker::PhantomData;
use thiserror::Error;

mod kube_backend;
pub use kube_backend::KubeBackend;

/// The normalized API error taxonomy.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The object does not exist. Read paths never surface this; it is
    /// returned by writes that require the object to be present.
    #[error("object not found")]
    NotFound,
    /// A create hit an existing object.
    #[error("object already exists")]
    AlreadyExists,
    /// A write lost a conflict (stale resource version or a failed UID
    /// precondition).
    #[error("write conflict")]
    Conflict,
    /// The object could not be encoded or decoded.
    #[error("object failed to decode: {0}")]
    BadObject(String),
    /// Any other request failure: network, throttling, server errors.
    #[error("api request failed: {0}")]
    Service(String),
}

/// Object-safe CRUD surface for one resource on one cluster.
///
/// Namespaces are passed per call (`None` for cluster-scoped kinds) so a
/// single handle serves every namespace of the resource.
#[async_trait::async_trait]
pub trait ObjectApi: Send + Sync {
    /// Fetch one object, `Ok(None)` when absent.
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ApiError>;

    /// List objects, in one namespace or across the cluster.
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, ApiError>;

    /// Create `obj`.
    async fn create(&self, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ApiError>;

    /// Replace the object named `name` with `obj`.
    async fn replace(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;

    /// Replace only the status subresource of `name` from `obj`.
    async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;

    /// Delete `name`. When `expected_uid` is set the delete carries a UID
    /// precondition and loses with [`ApiError::Conflict`] if the live object
    /// has a different UID.
    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        expected_uid: Option<&str>,
    ) -> Result<(), ApiError>;
}

/// A factory for [`ObjectApi`] handles and watch streams on one cluster.
pub trait ApiBackend: Send + Sync {
    /// CRUD surface for `resource`.
    fn api(&self, resource: &ApiResource) -> Box<dyn ObjectApi>;

    /// Raw watch stream for `resource`: an initial list rendered as
    /// `Init`/`InitApply`/`InitDone`, followed by live events. The stream
    /// recovers from transport errors internally where it can and surfaces
    /// the ones it cannot.
    fn watch(
        &self,
        resource: &ApiResource,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, ApiError>>;
}

/// Typed wrapper over an [`ObjectApi`], converting at the boundary.
pub struct TypedApi<K> {
    raw: Box<dyn ObjectApi>,
    resource: ApiResource,
    _kind: PhantomData<fn() -> K>,
}

impl<K: SyncObject> TypedApi<K> {
    /// Build the typed handle for `K` on `backend`.
    #[must_use]
    pub fn new(backend: &dyn ApiBackend) -> Self {
        let resource = ApiResource::erase::<K>(&());
        Self {
            raw: backend.api(&resource),
            resource,
            _kind: PhantomData,
        }
    }

    /// Fetch one object, `Ok(None)` when absent.
    pub async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ApiError> {
        match self.raw.get(namespace, name).await? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    /// List objects.
    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, ApiError> {
        self.raw
            .list(namespace)
            .await?
            .into_iter()
            .map(from_dynamic)
            .collect()
    }

    /// Create `obj`.
    pub async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K, ApiError> {
        let created = self.raw.create(namespace, &to_dynamic(obj, &self.resource)?).await?;
        from_dynamic(created)
    }

    /// Replace `name` with `obj`.
    pub async fn replace(&self, namespace: Option<&str>, name: &str, obj: &K) -> Result<K, ApiError> {
        let replaced = self
            .raw
            .replace(namespace, name, &to_dynamic(obj, &self.resource)?)
            .await?;
        from_dynamic(replaced)
    }

    /// Replace the status subresource of `name` from `obj`.
    pub async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &K,
    ) -> Result<K, ApiError> {
        let replaced = self
            .raw
            .replace_status(namespace, name, &to_dynamic(obj, &self.resource)?)
            .await?;
        from_dynamic(replaced)
    }

    /// Delete `name`, optionally guarded by a UID precondition.
    pub async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        expected_uid: Option<&str>,
    ) -> Result<(), ApiError> {
        self.raw.delete(namespace, name, expected_uid).await
    }
}

/// Render a typed object as a [`DynamicObject`], stamping the type metadata
/// the wire requires.
pub fn to_dynamic<K: SyncObject>(obj: &K, resource: &ApiResource) -> Result<DynamicObject, ApiError> {
    let mut value = serde_json::to_value(obj).map_err(|err| ApiError::BadObject(err.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert("apiVersion".to_string(), Value::String(resource.api_version.clone()));
        map.insert("kind".to_string(), Value::String(resource.kind.clone()));
    }
    serde_json::from_value(value).map_err(|err| ApiError::BadObject(err.to_string()))
}

/// Parse a [`DynamicObject`] back into its typed form.
pub fn from_dynamic<K: Resource + serde::de::DeserializeOwned>(obj: DynamicObject) -> Result<K, ApiError> {
    obj.try_parse().map_err(|err| ApiError::BadObject(err.to_string()))
}
