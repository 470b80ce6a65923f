use crate::crd::ImageScan;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams, Preconditions};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("imagescan {0} not found")]
    NotFound(String),
    #[error("imagescan {0} already exists")]
    AlreadyExists(String),
    #[error("imagescan {0} was modified concurrently")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    fn from_kube(name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(name.to_string()),
            kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(name.to_string())
            }
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(name.to_string()),
            e => StoreError::Other(e.into()),
        }
    }
}

pub trait ScanStore: Send + Sync + 'static {
    fn get(&self, name: &str) -> impl Future<Output = Result<ImageScan, StoreError>> + Send;

    fn create(&self, scan: &ImageScan)
    -> impl Future<Output = Result<ImageScan, StoreError>> + Send;

    /// Writes the status subresource. Fails with [`StoreError::Conflict`] when `scan` carries
    /// a stale resource version.
    fn update_status(
        &self,
        scan: &ImageScan,
    ) -> impl Future<Output = Result<ImageScan, StoreError>> + Send;

    /// Deletes `scan` unless it changed since it was read, which fails with
    /// [`StoreError::Conflict`].
    fn delete(&self, scan: &ImageScan) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<T: ScanStore> ScanStore for Arc<T> {
    fn get(&self, name: &str) -> impl Future<Output = Result<ImageScan, StoreError>> + Send {
        (**self).get(name)
    }

    fn create(
        &self,
        scan: &ImageScan,
    ) -> impl Future<Output = Result<ImageScan, StoreError>> + Send {
        (**self).create(scan)
    }

    fn update_status(
        &self,
        scan: &ImageScan,
    ) -> impl Future<Output = Result<ImageScan, StoreError>> + Send {
        (**self).update_status(scan)
    }

    fn delete(&self, scan: &ImageScan) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).delete(scan)
    }
}

pub const FIELD_MANAGER: &str = "imgscanner";

#[derive(Clone)]
pub struct KubeScanStore {
    api: Api<ImageScan>,
}

impl KubeScanStore {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

impl ScanStore for KubeScanStore {
    async fn get(&self, name: &str) -> Result<ImageScan, StoreError> {
        self.api
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(name, e))
    }

    async fn create(&self, scan: &ImageScan) -> Result<ImageScan, StoreError> {
        let name = scan.name_any();
        let mut created = self
            .api
            .create(&PostParams::default(), scan)
            .await
            .map_err(|e| StoreError::from_kube(&name, e))?;
        // the main resource endpoint drops status, write it separately
        let wanted = scan.status.clone().unwrap_or_default();
        if created.status.clone().unwrap_or_default() != wanted {
            created.status = Some(wanted);
            created = self.update_status(&created).await?;
        }
        Ok(created)
    }

    async fn update_status(&self, scan: &ImageScan) -> Result<ImageScan, StoreError> {
        let name = scan.name_any();
        // the resource version makes the API server reject writes based on stale reads
        let patch = json!({
            "metadata": { "resourceVersion": scan.resource_version() },
            "status": scan.status,
        });
        debug!("Patching imagescan {} status with {}", name, patch);
        self.api
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| StoreError::from_kube(&name, e))
    }

    async fn delete(&self, scan: &ImageScan) -> Result<(), StoreError> {
        let name = scan.name_any();
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                resource_version: scan.resource_version(),
                uid: scan.uid(),
            }),
            ..DeleteParams::default()
        };
        self.api
            .delete(&name, &params)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::from_kube(&name, e))
    }
}
