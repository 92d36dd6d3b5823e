//! Tollgate kubehub: list+watch declarative objects from Kubernetes and feed
//! them into the store as deltas.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tollgate_core::{DeclarativeObject, ObjectKey};
use tollgate_store::Delta;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Drop server-populated fields so status-only writes do not look like new desired state.
fn strip_noisy(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("creationTimestamp");
        meta.remove("generation");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}

fn normalize_uid(uid_str: &str) -> Result<String> {
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(u.hyphenated().to_string())
}

fn group_of(api_version: &str) -> &str {
    api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
}

/// Convert a watched object. Owner references become dependencies, so an
/// object is excluded together with a broken owner.
pub fn object_from_dynamic(obj: &DynamicObject, gvk: &GroupVersionKind) -> Result<DeclarativeObject> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let key = ObjectKey::new(gvk.group.clone(), gvk.kind.clone(), namespace.clone(), name);
    let references = obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .map(|o| ObjectKey::new(group_of(&o.api_version), o.kind.clone(), namespace.clone(), o.name.clone()))
        .collect::<Vec<_>>();
    let mut content = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_noisy(&mut content);

    let mut out = DeclarativeObject::new(key, obj.metadata.generation.unwrap_or(0), content).with_references(references);
    if let Some(uid) = obj.metadata.uid.as_deref() {
        out = out.with_uid(normalize_uid(uid)?);
    }
    Ok(out)
}

fn key_from_dynamic(obj: &DynamicObject, gvk: &GroupVersionKind) -> Result<ObjectKey> {
    let name = obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok(ObjectKey::new(gvk.group.clone(), gvk.kind.clone(), obj.metadata.namespace.clone().unwrap_or_default(), name))
}

/// Map one watch event to a store delta. Objects that cannot be identified
/// are skipped with a warning so one bad object never stops the watcher.
fn delta_from_event(ev: Event<DynamicObject>, gvk: &GroupVersionKind) -> Option<Delta> {
    let skipped = |e: anyhow::Error| {
        warn!(kind = %gvk.kind, group = %gvk.group, error = %e, "skipping unconvertible object");
        counter!("kubehub_objects_skipped_total", 1u64);
    };
    match ev {
        Event::Applied(o) => object_from_dynamic(&o, gvk).map(Delta::Applied).map_err(skipped).ok(),
        Event::Deleted(o) => key_from_dynamic(&o, gvk).map(Delta::Deleted).map_err(skipped).ok(),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            let objects = list.iter().filter_map(|o| object_from_dynamic(o, gvk).map_err(skipped).ok()).collect();
            Some(Delta::Replaced { group: gvk.group.clone(), kind: gvk.kind.clone(), objects })
        }
    }
}

/// Start list+watch for a GVK key and send deltas into the provided channel
/// until the stream ends or the receiver is dropped.
pub async fn start_watcher(gvk_key: &str, namespace: Option<&str>, delta_tx: mpsc::Sender<Delta>) -> Result<()> {
    let client = Client::try_default().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

    let api: Api<DynamicObject> = if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        }
    } else {
        Api::all_with(client.clone(), &ar)
    };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key, ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await? {
        let Some(delta) = delta_from_event(ev, &gvk) else { continue };
        if delta_tx.send(delta).await.is_err() {
            debug!(gvk = %gvk_key, "delta receiver dropped; stopping watcher");
            return Ok(());
        }
    }
    warn!(gvk = %gvk_key, "watcher stream ended");
    Ok(())
}
