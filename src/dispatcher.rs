use crate::controller::Syncer;
use crate::crd::{Image, ImageRef, ImageScan, Vulnerability};
use crate::image_reference::{ImageReference, ParseError};
use crate::registry_auth::AuthResolver;
use crate::scanner::Scanner;
use crate::store::{ScanStore, StoreError};
use anyhow::Context;
use kube::ResourceExt;
use kube::runtime::reflector::{ObjectRef, Store};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CONFLICT_RETRIES: usize = 3;

/// Turns Image events into ImageScans, one per layer digest.
pub struct Dispatcher<St, Sc, A> {
    store: St,
    scans: Store<ImageScan>,
    scanner: Sc,
    auth: A,
    max_attempts: usize,
}

impl<St, Sc, A> Dispatcher<St, Sc, A>
where
    St: ScanStore,
    Sc: Scanner,
    A: AuthResolver,
{
    pub fn new(
        store: St,
        scans: Store<ImageScan>,
        scanner: Sc,
        auth: A,
        max_attempts: usize,
    ) -> Self {
        Self {
            store,
            scans,
            scanner,
            auth,
            max_attempts,
        }
    }

    /// Processes every hash reference of `image`. A malformed reference fails the whole sync,
    /// a reference without a usable digest is skipped. Failures of single references do not
    /// stop their siblings; they are reported together once all references were handled.
    pub async fn sync(&self, image: &Image) -> anyhow::Result<()> {
        let image_key = format!("{}/{}", image.namespace().unwrap_or_default(), image.name_any());

        let mut references = Vec::new();
        for hash_reference in image.hash_references() {
            match ImageReference::parse(&hash_reference.image_reference) {
                Ok(reference) => references.push(reference),
                Err(e @ (ParseError::MissingDigest | ParseError::InvalidDigest(_))) => {
                    error!(
                        "Skipping reference {} of image {}: {}",
                        hash_reference.image_reference, image_key, e
                    );
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!(
                            "unable to parse image reference {}",
                            hash_reference.image_reference
                        )
                    });
                }
            }
        }

        let mut failed = 0;
        for reference in &references {
            if let Err(e) = self.process_image(image, reference).await {
                error!("Error processing {} for image {}: {:#}", reference, image_key, e);
                failed += 1;
            }
        }
        if failed > 0 {
            anyhow::bail!(
                "{} of {} references of image {} failed",
                failed,
                references.len(),
                image_key
            );
        }
        Ok(())
    }

    /// Returns the ImageScan called `name`, creating it if it does not exist yet. Losing a
    /// creation race to another writer is not an error, the winner's object is returned.
    pub async fn assure_scan(&self, name: &str) -> anyhow::Result<ImageScan> {
        if let Some(scan) = self.scans.get(&ObjectRef::new(name)) {
            return Ok(scan.as_ref().clone());
        }

        match self.store.create(&ImageScan::for_digest(name)).await {
            Ok(scan) => {
                info!("Created imagescan {}", name);
                Ok(scan)
            }
            Err(StoreError::AlreadyExists(_) | StoreError::Conflict(_)) => {
                debug!("Imagescan {} created concurrently, reading it back", name);
                self.store
                    .get(name)
                    .await
                    .with_context(|| format!("unable to read existing scan {}", name))
            }
            Err(e) => Err(e).context("unable to create new scan"),
        }
    }

    /// Makes sure the ImageScan for `reference` exists and points back at `image`, then scans
    /// the content unless it was scanned already or ran out of attempts.
    async fn process_image(
        &self,
        image: &Image,
        reference: &ImageReference,
    ) -> anyhow::Result<()> {
        let name = reference.digest_hex();
        let image_ref = ImageRef::from_image(image);

        let scan = self.assure_scan(name).await?;
        if self.settled(&scan) {
            return self
                .update_scan(scan, |s| s.add_reference(image_ref.clone()))
                .await;
        }
        // the cache may lag behind the store, only scan if the stored record still owes one
        let scan = self
            .store
            .get(name)
            .await
            .with_context(|| format!("unable to read scan {}", name))?;
        if self.settled(&scan) {
            return self
                .update_scan(scan, |s| s.add_reference(image_ref.clone()))
                .await;
        }

        let namespace = image.namespace().unwrap_or_default();
        let auths = self
            .auth
            .resolve(reference, &namespace, image.spec.insecure)
            .await
            .context("error reading registry auth contexts")?;

        let outcome: Result<Vec<Vulnerability>, String> =
            match self.scanner.scan(reference, &auths).await {
                Ok(vulnerabilities) => {
                    info!(
                        "Scan for {} found {} vulnerabilities",
                        name,
                        vulnerabilities.len()
                    );
                    Ok(vulnerabilities)
                }
                Err(e) => {
                    warn!("Scan for {} failed: {:#}", name, e);
                    Err(format!("{:#}", e))
                }
            };

        let max_attempts = self.max_attempts;
        self.update_scan(scan, |s| {
            let mut changed = s.add_reference(image_ref.clone());
            // a concurrent writer may have finished the scan in the meantime
            if !s.executed() && !s.has_failed(max_attempts) {
                match &outcome {
                    Ok(vulnerabilities) => s.set_result(vulnerabilities.clone()),
                    Err(error) => s.prepend_failure(error.clone(), max_attempts),
                }
                changed = true;
            }
            changed
        })
        .await
    }

    /// Whether `scan` finished or ran out of attempts, so no scan is owed anymore.
    fn settled(&self, scan: &ImageScan) -> bool {
        if scan.executed() {
            info!("Scan for {} already executed", scan.name_any());
            true
        } else if scan.has_failed(self.max_attempts) {
            info!("No more attempts to scan {}", scan.name_any());
            true
        } else {
            false
        }
    }

    /// Applies `mutate` and writes the status back. On a resource version conflict the object
    /// is read again and the mutation reapplied.
    async fn update_scan<F>(&self, mut scan: ImageScan, mutate: F) -> anyhow::Result<()>
    where
        F: Fn(&mut ImageScan) -> bool,
    {
        let name = scan.name_any();
        let mut attempt = 1;
        loop {
            if !mutate(&mut scan) {
                return Ok(());
            }
            match self.store.update_status(&scan).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                    debug!("Conflict updating imagescan {}, retrying", name);
                    attempt += 1;
                    scan = self
                        .store
                        .get(&name)
                        .await
                        .with_context(|| format!("unable to re-read scan {}", name))?;
                }
                Err(e) => return Err(e).context("unable to update scan status"),
            }
        }
    }
}

impl<St, Sc, A> Syncer<Image> for Dispatcher<St, Sc, A>
where
    St: ScanStore,
    Sc: Scanner,
    A: AuthResolver,
{
    async fn sync(&self, image: Arc<Image>) -> anyhow::Result<()> {
        Dispatcher::sync(self, &image).await
    }
}
