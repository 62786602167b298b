//! The production [`ApiBackend`] over a [`kube::Client`].

use super::{ApiBackend, ApiError, ObjectApi};
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams, Preconditions},
    runtime::{watcher, WatchStreamExt},
    Client,
};

/// API backend for a real cluster.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    /// Wrap a connected client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ApiBackend for KubeBackend {
    fn api(&self, resource: &ApiResource) -> Box<dyn ObjectApi> {
        Box::new(KubeApi {
            client: self.client.clone(),
            resource: resource.clone(),
        })
    }

    fn watch(
        &self,
        resource: &ApiResource,
    ) -> BoxStream<'static, Result<watcher::Event<DynamicObject>, ApiError>> {
        let api = Api::<DynamicObject>::all_with(self.client.clone(), resource);
        watcher(api, watcher::Config::default())
            .default_backoff()
            .map_err(|err| ApiError::Service(err.to_string()))
            .boxed()
    }
}

struct KubeApi {
    client: Client,
    resource: ApiResource,
}

impl KubeApi {
    fn scoped(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

fn normalize(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
            (404, _) => ApiError::NotFound,
            (409, "AlreadyExists") => ApiError::AlreadyExists,
            (409, _) => ApiError::Conflict,
            _ => ApiError::Service(response.message),
        },
        other => ApiError::Service(other.to_string()),
    }
}

#[async_trait::async_trait]
impl ObjectApi for KubeApi {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<DynamicObject>, ApiError> {
        self.scoped(namespace).get_opt(name).await.map_err(normalize)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<DynamicObject>, ApiError> {
        let list = self
            .scoped(namespace)
            .list(&ListParams::default())
            .await
            .map_err(normalize)?;
        Ok(list.items)
    }

    async fn create(&self, namespace: Option<&str>, obj: &DynamicObject) -> Result<DynamicObject, ApiError> {
        self.scoped(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(normalize)
    }

    async fn replace(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        self.scoped(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(normalize)
    }

    async fn replace_status(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let data = serde_json::to_vec(obj).map_err(|err| ApiError::BadObject(err.to_string()))?;
        self.scoped(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(normalize)
    }

    async fn delete(
        &self,
        namespace: Option<&str>,
        name: &str,
        expected_uid: Option<&str>,
    ) -> Result<(), ApiError> {
        let params = DeleteParams {
            preconditions: expected_uid.map(|uid| Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };
        self.scoped(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(normalize)
    }
}
