//! Turns a [`MountRequest`] into the files of the volume. The secrets are fetched concurrently
//! with a bounded fan-out while the response keeps the request order, and the call fails as a
//! whole as soon as one secret cannot be fetched.

use crate::auth::CredentialResolver;
use crate::error::{Error, Result};
use crate::secretmanager::{ResourceName, SecretFetcher, SecretPayload};
use futures::{StreamExt, stream};
use gcp_provider_pb::provider::v1alpha1::{File, MountRequest, MountResponse, ObjectVersion};
use params::MountParams;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod params;

pub struct MountProcessor<R, F> {
    resolver: R,
    fetcher: F,
    max_concurrent_fetches: usize,
    default_file_mode: u32,
}

impl<R, F> MountProcessor<R, F>
where
    R: CredentialResolver + Sync,
    F: SecretFetcher + Sync,
{
    pub fn new(resolver: R, fetcher: F, max_concurrent_fetches: usize, default_file_mode: u32) -> Self {
        Self {
            resolver,
            fetcher,
            max_concurrent_fetches: max_concurrent_fetches.max(1),
            default_file_mode,
        }
    }

    /// Resolves every object of the request. On success the response has one file and one
    /// object version per object, in request order. On error nothing is returned.
    pub async fn mount(
        &self,
        request: &MountRequest,
        cln_token: &CancellationToken,
    ) -> Result<MountResponse> {
        let params = MountParams::try_from(request)?;
        info!(
            pod = params.pod.name,
            namespace = params.pod.namespace,
            target_path = ?params.target_path,
            objects = params.objects.len(),
            "Mounting secrets"
        );

        let credentials = self
            .resolver
            .resolve(&params.pod, &params.auth, cln_token)
            .await?;

        // one slot per distinct resource, objects refer to their slot by index
        let mut unique: Vec<&ResourceName> = Vec::new();
        let mut slot_index: HashMap<&ResourceName, usize> = HashMap::new();
        let object_slots: Vec<usize> = params
            .objects
            .iter()
            .map(|object| {
                *slot_index.entry(&object.resource).or_insert_with(|| {
                    unique.push(&object.resource);
                    unique.len() - 1
                })
            })
            .collect();

        let mut slots: Vec<Option<SecretPayload>> = vec![None; unique.len()];
        let credentials = &credentials;
        let fetches: Vec<_> = unique
            .iter()
            .enumerate()
            .map(|(slot, name)| {
                let name = ResourceName::clone(name);
                async move {
                    let result = self.fetcher.fetch(&name, credentials, cln_token).await;
                    (slot, result)
                }
            })
            .collect();
        let mut fetches = stream::iter(fetches).buffer_unordered(self.max_concurrent_fetches);

        // the first error drops the stream and with it every fetch still in flight
        while let Some((slot, result)) = fetches.next().await {
            let payload = result?;
            if let Some(entry) = slots.get_mut(slot) {
                *entry = Some(payload);
            }
        }
        drop(fetches);

        let mut files = Vec::with_capacity(params.objects.len());
        let mut object_versions = Vec::with_capacity(params.objects.len());
        for (object, slot) in params.objects.iter().zip(object_slots) {
            let payload = slots
                .get(slot)
                .and_then(Option::as_ref)
                .ok_or_else(|| Error::Internal(format!("no payload fetched for {}", object.id)))?;

            if let Some(current) = params.current_versions.get(&object.id) {
                if *current != payload.version {
                    info!(
                        resource = object.id,
                        from = current,
                        to = payload.version,
                        "Secret version changed"
                    );
                }
            }

            let mode = object
                .mode
                .or(params.permission)
                .unwrap_or(self.default_file_mode);
            files.push(File {
                path: object.file_name.clone(),
                mode: mode as i32,
                contents: payload.data.to_vec(),
            });
            object_versions.push(ObjectVersion {
                id: object.id.clone(),
                version: payload.version.clone(),
            });
        }

        debug!(
            pod = params.pod.name,
            namespace = params.pod.namespace,
            fetched = unique.len(),
            "Mounted secrets"
        );
        Ok(MountResponse {
            object_version: object_versions,
            error: None,
            files,
        })
    }
}
