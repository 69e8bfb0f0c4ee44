//! kwatch kubehub: client construction and list+watch wiring

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result};
use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config, Resource,
};
use kwatch_core::Delta;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to watch: one namespace or all of them, optionally narrowed by selectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchTarget {
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
    pub label_selector: Option<String>,
}

impl WatchTarget {
    fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(f) = self.field_selector.as_deref() {
            cfg = cfg.fields(f);
        }
        if let Some(l) = self.label_selector.as_deref() {
            cfg = cfg.labels(l);
        }
        cfg
    }
}

/// Build a client from an explicit kubeconfig path, or the usual defaults
/// (`KUBECONFIG`, `~/.kube/config`, in-cluster) when none is given.
pub async fn client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("building client config from kubeconfig")?;
            Client::try_from(cfg).context("creating kube client")
        }
        None => Client::try_default().await.context("creating default kube client"),
    }
}

/// Translate a watcher event into the delta the informer consumes.
pub fn delta_of<K>(ev: Event<K>) -> Delta<K> {
    match ev {
        Event::Applied(o) => Delta::Applied(o),
        Event::Deleted(o) => Delta::Deleted(o),
        Event::Restarted(list) => Delta::Restarted(list),
    }
}

/// List+watch `K` and forward deltas into `delta_tx` until `shutdown` fires or the
/// receiver goes away.
///
/// Stream errors are retried with the watcher's default backoff, which re-lists and
/// surfaces as `Delta::Restarted`; they never end this loop.
pub async fn start_watcher<K>(
    client: Client,
    target: &WatchTarget,
    delta_tx: mpsc::Sender<Delta<K>>,
    shutdown: CancellationToken,
) -> Result<()>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    let api: Api<K> = match target.namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let kind = K::kind(&());
    let stream = watcher::watcher(api, target.watcher_config()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?target.namespace, "watcher started");
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(kind = %kind, "watcher stopping");
                return Ok(());
            }
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                counter!("kwatch_watch_errors_total", 1u64);
                warn!(kind = %kind, error = %e, "watch stream error; backing off");
                continue;
            }
            None => break,
        };
        if let Event::Restarted(list) = &ev {
            debug!(count = list.len(), "watch restart");
        }
        if delta_tx.send(delta_of(ev)).await.is_err() {
            debug!("delta receiver dropped; stopping watcher");
            return Ok(());
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}
