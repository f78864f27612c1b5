//! Kubernetes API adapter.
//!
//! Implements every platform collaborator trait on top of a single
//! `kube::Client`. API status codes are classified into `PlatformError`
//! variants here so the rest of the crate never looks at raw codes.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, PostParams},
    Client,
};
use tracing::debug;

use crate::interfaces::job_platform::MAX_LOG_BYTES;
use crate::interfaces::{DocumentStore, JobPlatform, PlatformError, Result, VolumeDirectory};

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;

/// Platform collaborators backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Cheap API-server reachability check used by the readiness prober.
    pub async fn ping(&self) -> Result<()> {
        let version = self.client.apiserver_version().await?;
        debug!(git_version = %version.git_version, "API server reachable");
        Ok(())
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error onto the classified platform error for one object.
fn classify(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> PlatformError {
    match &err {
        kube::Error::Api(response) if response.code == HTTP_NOT_FOUND => PlatformError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(response)
            if response.code == HTTP_CONFLICT && response.reason == "AlreadyExists" =>
        {
            PlatformError::AlreadyExists {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == HTTP_CONFLICT => PlatformError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        _ => PlatformError::Kube(err),
    }
}

fn object_name<'a>(name: &'a Option<String>, kind: &'static str) -> Result<&'a str> {
    name.as_deref().ok_or_else(|| PlatformError::InvalidObject {
        kind,
        message: "metadata.name is required".to_string(),
    })
}

#[async_trait]
impl VolumeDirectory for KubePlatform {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        self.claims(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, "PersistentVolumeClaim", namespace, name))
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = object_name(&claim.metadata.name, "PersistentVolumeClaim")?;
        self.claims(namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| classify(e, "PersistentVolumeClaim", namespace, name))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods.items)
    }
}

#[async_trait]
impl JobPlatform for KubePlatform {
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = object_name(&job.metadata.name, "Job")?;
        self.jobs(namespace)
            .create(&PostParams::default(), job)
            .await
            .map_err(|e| classify(e, "Job", namespace, name))
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        self.jobs(namespace)
            .get(name)
            .await
            .map_err(|e| classify(e, "Job", namespace, name))
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.jobs(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify(e, "Job", namespace, name))?;
        Ok(())
    }

    async fn job_logs(&self, namespace: &str, job_name: &str) -> Result<String> {
        let selector = format!("job-name={}", job_name);
        let pods = self.list_pods(namespace, &selector).await?;
        let pod_name = pods
            .first()
            .and_then(|p| p.metadata.name.clone())
            .ok_or_else(|| PlatformError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: selector.clone(),
            })?;

        let params = LogParams {
            limit_bytes: Some(MAX_LOG_BYTES),
            ..Default::default()
        };
        self.pods(namespace)
            .logs(&pod_name, &params)
            .await
            .map_err(|e| classify(e, "Pod", namespace, &pod_name))
    }
}

#[async_trait]
impl DocumentStore for KubePlatform {
    async fn get_document(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.config_maps(namespace)
            .get_opt(name)
            .await
            .map_err(|e| classify(e, "ConfigMap", namespace, name))
    }

    async fn create_document(&self, namespace: &str, document: &ConfigMap) -> Result<ConfigMap> {
        let name = object_name(&document.metadata.name, "ConfigMap")?;
        self.config_maps(namespace)
            .create(&PostParams::default(), document)
            .await
            .map_err(|e| classify(e, "ConfigMap", namespace, name))
    }

    async fn replace_document(&self, namespace: &str, document: &ConfigMap) -> Result<ConfigMap> {
        // The API server rejects the update with 409 when resourceVersion is stale.
        let name = object_name(&document.metadata.name, "ConfigMap")?;
        self.config_maps(namespace)
            .replace(name, &PostParams::default(), document)
            .await
            .map_err(|e| classify(e, "ConfigMap", namespace, name))
    }
}
