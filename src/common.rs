use crate::error::{is_already_exists, is_not_found};
use futures::{Future, FutureExt};
use kube::api::{Api, DeleteParams, PostParams, Resource};
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use tracing::*;

/// Creates `desired`, or replaces the live object with `merge(desired, live)`
/// so fields the caller does not own survive the update.
pub async fn create_or_replace<K, F>(api: &Api<K>, desired: K, merge: F) -> Result<K, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
    F: FnOnce(K, K) -> K,
{
    let name = desired.meta().name.clone().unwrap_or_default();
    match api.get_opt(&name).await? {
        Some(live) => {
            debug!(
                "Current rv of {} {}: {:?}",
                K::kind(&()),
                name,
                live.meta().resource_version
            );
            info!("Update {}: {}", K::kind(&()), name);
            api.replace(&name, &PostParams::default(), &merge(desired, live)).await
        }
        None => {
            info!("Create {}: {}", K::kind(&()), name);
            api.create(&PostParams::default(), &desired).await
        }
    }
}

/// Creates `desired` and leaves an existing object untouched.
pub async fn create_if_absent<K>(api: &Api<K>, desired: &K) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), desired).await {
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e),
        Ok(_) => {
            info!("Create {}: {}", K::kind(&()), desired.meta().name.as_deref().unwrap_or_default());
            Ok(())
        }
    }
}

/// Deletes `name`. Returns true when the object was already gone.
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<bool, kube::Error>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Err(e) if is_not_found(&e) => Ok(true),
        Err(e) => Err(e),
        Ok(_) => {
            info!("Delete {}: {}", K::kind(&()), name);
            Ok(false)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs one reconcile pass, turning a panic inside it into `on_panic(msg)`
/// so the error policy requeues the object and the other controllers keep
/// running.
pub async fn catch_panic<T, E, F, P>(pass: F, on_panic: P) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    P: FnOnce(String) -> E,
{
    match AssertUnwindSafe(pass).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!("Reconcile panicked: {}", msg);
            Err(on_panic(msg))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn exploding_pass(index: usize) -> crate::error::Result<u32> {
        let owners: Vec<u32> = Vec::new();
        Ok(owners[index])
    }

    async fn refusing_pass() -> Result<(), String> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_pass_becomes_an_error() {
        let res = catch_panic(exploding_pass(3), Error::ReconcilePanicked).await;
        match res {
            Err(Error::ReconcilePanicked(msg)) => assert!(msg.contains("index out of bounds"), "{}", msg),
            other => panic!("expected a panic error, got {:?}", other),
        }

        let res = catch_panic(refusing_pass(), |m| format!("panicked: {}", m)).await;
        assert_eq!(res, Err("panicked: boom".to_string()));
    }

    #[tokio::test]
    async fn clean_pass_is_untouched() {
        let res = catch_panic(async { Ok::<_, Error>(7) }, Error::ReconcilePanicked).await;
        assert_eq!(res.unwrap(), 7);
        let res = catch_panic(async { Err::<u32, _>(Error::MissingObjectKey(".metadata.name")) }, Error::ReconcilePanicked).await;
        assert!(matches!(res, Err(Error::MissingObjectKey(_))));
    }
}
