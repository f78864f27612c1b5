//! In-memory platform for testing.
//!
//! Implements every collaborator trait over maps guarded by `RwLock`s.
//! Job status is driven by a configurable `JobBehavior` instead of a real
//! controller, and documents carry a monotonically increasing
//! `resourceVersion` so compare-and-swap semantics match the API server.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Pod,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::sync::RwLock;

use crate::interfaces::{DocumentStore, JobPlatform, PlatformError, Result, VolumeDirectory};

type ObjectKey = (String, String);

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

/// How submitted jobs progress when their status is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobBehavior {
    /// Report `succeeded = 1` on the first status read.
    Succeed,
    /// Report `failed = attempts` on the first status read.
    Fail(i32),
    /// Stay `active = 1` forever.
    Hang,
}

/// Mock platform that stores all objects in memory.
pub struct MockPlatform {
    claims: RwLock<HashMap<ObjectKey, PersistentVolumeClaim>>,
    pods: RwLock<HashMap<ObjectKey, Pod>>,
    jobs: RwLock<HashMap<ObjectKey, Job>>,
    created_jobs: RwLock<Vec<String>>,
    deleted_jobs: RwLock<Vec<String>>,
    documents: RwLock<HashMap<ObjectKey, ConfigMap>>,
    next_version: RwLock<u64>,
    job_behavior: RwLock<JobBehavior>,
    job_logs: RwLock<String>,
    fail_documents: RwLock<bool>,
    pending_conflicts: RwLock<u32>,
    lost_races: RwLock<u32>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            claims: RwLock::new(HashMap::new()),
            pods: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            created_jobs: RwLock::new(Vec::new()),
            deleted_jobs: RwLock::new(Vec::new()),
            documents: RwLock::new(HashMap::new()),
            next_version: RwLock::new(1),
            job_behavior: RwLock::new(JobBehavior::Succeed),
            job_logs: RwLock::new(String::new()),
            fail_documents: RwLock::new(false),
            pending_conflicts: RwLock::new(0),
            lost_races: RwLock::new(0),
        }
    }
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a claim with the given phase, access modes and labels.
    pub async fn add_claim(
        &self,
        namespace: &str,
        name: &str,
        phase: &str,
        access_modes: &[&str],
        labels: &[(&str, &str)],
    ) {
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(access_modes.iter().map(|m| m.to_string()).collect()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        };
        self.claims.write().await.insert(key(namespace, name), claim);
    }

    /// Register a pod carrying the given labels.
    pub async fn add_pod(&self, namespace: &str, name: &str, labels: &[(&str, &str)]) {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        self.pods.write().await.insert(key(namespace, name), pod);
    }

    pub async fn get_stored_claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.claims.read().await.get(&key(namespace, name)).cloned()
    }

    pub async fn set_job_behavior(&self, behavior: JobBehavior) {
        *self.job_behavior.write().await = behavior;
    }

    pub async fn set_job_logs(&self, logs: &str) {
        *self.job_logs.write().await = logs.to_string();
    }

    /// Names of all jobs submitted, in submission order.
    pub async fn created_jobs(&self) -> Vec<String> {
        self.created_jobs.read().await.clone()
    }

    pub async fn deleted_jobs(&self) -> Vec<String> {
        self.deleted_jobs.read().await.clone()
    }

    pub async fn get_stored_job(&self, namespace: &str, name: &str) -> Option<Job> {
        self.jobs.read().await.get(&key(namespace, name)).cloned()
    }

    /// Make every document operation fail.
    pub async fn set_fail_documents(&self, fail: bool) {
        *self.fail_documents.write().await = fail;
    }

    /// Reject the next `count` document replacements with a conflict, as if
    /// another writer had bumped the version in between.
    pub async fn inject_conflicts(&self, count: u32) {
        *self.pending_conflicts.write().await = count;
    }

    /// Writes rejected because another writer created or replaced the
    /// document first. Injected conflicts are not counted.
    pub async fn lost_races(&self) -> u32 {
        *self.lost_races.read().await
    }

    pub async fn get_stored_document(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.documents.read().await.get(&key(namespace, name)).cloned()
    }

    async fn bump_version(&self) -> String {
        let mut next = self.next_version.write().await;
        let version = *next;
        *next += 1;
        version.to_string()
    }

    async fn check_documents_available(&self) -> Result<()> {
        if *self.fail_documents.read().await {
            return Err(PlatformError::InvalidObject {
                kind: "ConfigMap",
                message: "document store unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn status_for(behavior: &JobBehavior) -> JobStatus {
        match behavior {
            JobBehavior::Succeed => JobStatus {
                succeeded: Some(1),
                ..Default::default()
            },
            JobBehavior::Fail(attempts) => JobStatus {
                failed: Some(*attempts),
                ..Default::default()
            },
            JobBehavior::Hang => JobStatus {
                active: Some(1),
                ..Default::default()
            },
        }
    }
}

fn required_name<'a>(name: &'a Option<String>, kind: &'static str) -> Result<&'a str> {
    name.as_deref().ok_or_else(|| PlatformError::InvalidObject {
        kind,
        message: "metadata.name is required".to_string(),
    })
}

fn matches_selector(labels: &Option<BTreeMap<String, String>>, selector: &str) -> bool {
    let Some((k, v)) = selector.split_once('=') else {
        return false;
    };
    labels
        .as_ref()
        .and_then(|l| l.get(k))
        .is_some_and(|value| value == v)
}

#[async_trait]
impl VolumeDirectory for MockPlatform {
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.claims.read().await.get(&key(namespace, name)).cloned())
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        let name = required_name(&claim.metadata.name, "PersistentVolumeClaim")?;
        let mut claims = self.claims.write().await;
        if claims.contains_key(&key(namespace, name)) {
            return Err(PlatformError::AlreadyExists {
                kind: "PersistentVolumeClaim",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        claims.insert(key(namespace, name), claim.clone());
        Ok(claim.clone())
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let pods = self.pods.read().await;
        Ok(pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && matches_selector(&pod.metadata.labels, label_selector)
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }
}

#[async_trait]
impl JobPlatform for MockPlatform {
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = required_name(&job.metadata.name, "Job")?;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&key(namespace, name)) {
            return Err(PlatformError::AlreadyExists {
                kind: "Job",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        jobs.insert(key(namespace, name), job.clone());
        self.created_jobs.write().await.push(name.to_string());
        Ok(job.clone())
    }

    async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        let behavior = self.job_behavior.read().await.clone();
        let jobs = self.jobs.read().await;
        let mut job = jobs
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| PlatformError::NotFound {
                kind: "Job",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        job.status = Some(Self::status_for(&behavior));
        Ok(job)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let removed = self.jobs.write().await.remove(&key(namespace, name));
        if removed.is_none() {
            return Err(PlatformError::NotFound {
                kind: "Job",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        self.deleted_jobs.write().await.push(name.to_string());
        Ok(())
    }

    async fn job_logs(&self, namespace: &str, job_name: &str) -> Result<String> {
        if !self.jobs.read().await.contains_key(&key(namespace, job_name)) {
            return Err(PlatformError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: format!("job-name={}", job_name),
            });
        }
        Ok(self.job_logs.read().await.clone())
    }
}

#[async_trait]
impl DocumentStore for MockPlatform {
    async fn get_document(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        self.check_documents_available().await?;
        let document = self.documents.read().await.get(&key(namespace, name)).cloned();
        // Let other writers run between this read and the caller's write.
        tokio::task::yield_now().await;
        Ok(document)
    }

    async fn create_document(&self, namespace: &str, document: &ConfigMap) -> Result<ConfigMap> {
        self.check_documents_available().await?;
        let name = required_name(&document.metadata.name, "ConfigMap")?;
        let version = self.bump_version().await;
        let mut documents = self.documents.write().await;
        if documents.contains_key(&key(namespace, name)) {
            *self.lost_races.write().await += 1;
            return Err(PlatformError::AlreadyExists {
                kind: "ConfigMap",
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let mut stored = document.clone();
        stored.metadata.resource_version = Some(version);
        documents.insert(key(namespace, name), stored.clone());
        Ok(stored)
    }

    async fn replace_document(&self, namespace: &str, document: &ConfigMap) -> Result<ConfigMap> {
        self.check_documents_available().await?;
        let name = required_name(&document.metadata.name, "ConfigMap")?;
        let conflict = PlatformError::Conflict {
            kind: "ConfigMap",
            namespace: namespace.to_string(),
            name: name.to_string(),
        };

        {
            let mut pending = self.pending_conflicts.write().await;
            if *pending > 0 {
                *pending -= 1;
                return Err(conflict);
            }
        }

        let version = self.bump_version().await;
        let mut documents = self.documents.write().await;
        let current = documents
            .get(&key(namespace, name))
            .ok_or_else(|| PlatformError::NotFound {
                kind: "ConfigMap",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        if current.metadata.resource_version != document.metadata.resource_version {
            *self.lost_races.write().await += 1;
            return Err(conflict);
        }
        let mut stored = document.clone();
        stored.metadata.resource_version = Some(version);
        documents.insert(key(namespace, name), stored.clone());
        Ok(stored)
    }
}
