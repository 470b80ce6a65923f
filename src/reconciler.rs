use crate::controller::{ControllerHandle, Syncer};
use crate::crd::{Image, ImageRef, ImageScan};
use crate::store::{ScanStore, StoreError};
use anyhow::Context;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use tracing::{debug, info};

const CONFLICT_RETRIES: usize = 3;

/// Deletes ImageScans once none of the Images they reference exist anymore.
pub struct ImageScanService<St> {
    store: St,
    images: Store<Image>,
}

impl<St: ScanStore> ImageScanService<St> {
    pub fn new(store: St, images: Store<Image>) -> Self {
        Self { store, images }
    }

    /// An Image recreated under the same name is a different Image, so the UID must match too.
    fn image_exists(&self, reference: &ImageRef) -> bool {
        let key = ObjectRef::new(&reference.name).within(&reference.namespace);
        self.images.get(&key).is_some_and(|image| {
            match image.meta().uid.as_deref() {
                Some(uid) if !uid.is_empty() && !reference.uid.is_empty() => uid == reference.uid,
                _ => true,
            }
        })
    }

    /// Drops references to Images that are gone and deletes the ImageScan once none are left.
    /// Scans that never completed are left to the dispatcher. Writes are conditional on the
    /// resource version; a record that changed underneath is read again and collected anew.
    pub async fn sync(&self, scan: &ImageScan) -> anyhow::Result<()> {
        let name = scan.name_any();
        let mut scan = scan.clone();
        let mut attempt = 1;
        loop {
            match self.collect(scan).await {
                Err(StoreError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                    debug!("Imagescan {} changed concurrently, reading it again", name);
                    attempt += 1;
                    scan = match self.store.get(&name).await {
                        Ok(scan) => scan,
                        Err(StoreError::NotFound(_)) => return Ok(()),
                        Err(e) => return Err(e).context("error reading image scan"),
                    };
                }
                result => return result.context("error collecting image scan"),
            }
        }
    }

    async fn collect(&self, mut scan: ImageScan) -> Result<(), StoreError> {
        if !scan.executed() {
            return Ok(());
        }

        let gone: Vec<ImageRef> = scan
            .references()
            .iter()
            .filter(|r| !self.image_exists(r))
            .cloned()
            .collect();
        if gone.is_empty() {
            return Ok(());
        }

        let name = scan.name_any();
        for reference in &gone {
            debug!(
                "Image {}/{} no longer exists, removing reference from imagescan {}",
                reference.namespace, reference.name, name
            );
            scan.delete_reference(reference);
        }

        if scan.has_references() {
            self.store.update_status(&scan).await?;
            info!(
                "Removed {} stale references from imagescan {}",
                gone.len(),
                name
            );
            return Ok(());
        }

        match self.store.delete(&scan).await {
            Ok(()) => info!("Deleted imagescan {} as no image references it", name),
            Err(StoreError::NotFound(_)) => debug!("Imagescan {} already deleted", name),
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl<St: ScanStore> Syncer<ImageScan> for ImageScanService<St> {
    async fn sync(&self, scan: Arc<ImageScan>) -> anyhow::Result<()> {
        ImageScanService::sync(self, &scan).await
    }
}

/// Routes Image events to the dispatcher. A deletion also enqueues every ImageScan that points
/// at the Image, as that is the only way the garbage collector learns about it.
pub fn image_event_handler(
    images: ControllerHandle<Image>,
    scans: ControllerHandle<ImageScan>,
) -> impl FnMut(&watcher::Event<Image>) + Send + 'static {
    move |event: &watcher::Event<Image>| {
        images.enqueue_event(event);
        if let watcher::Event::Delete(image) = event {
            for key in scans_referencing(scans.store(), image) {
                scans.enqueue(key);
            }
        }
    }
}

/// Keys of the cached ImageScans that point back at `image`.
pub fn scans_referencing(scans: &Store<ImageScan>, image: &Image) -> Vec<ObjectRef<ImageScan>> {
    let Some(uid) = image.meta().uid.as_deref() else {
        return Vec::new();
    };
    scans
        .state()
        .iter()
        .filter(|scan| scan.has_reference(uid))
        .map(|scan| ObjectRef::from_obj(scan.as_ref()))
        .collect()
}
