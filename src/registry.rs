//! Durable notebook registry
//!
//! Records are stored in the key/value [`Database`] under `notebook:<id>` as JSON.
//! The registry enforces domain uniqueness and publishes every mutation to its
//! subscribers without waiting for them.
//!
//! # Delivery
//!
//! Each subscriber gets its own dispatch task fed by an unbounded channel, so
//! publishing never blocks a writer. The dispatch task fans events out to one
//! FIFO worker per notebook id: events for the same id reach the subscriber in
//! commit order, events for different ids are handled concurrently.
//!
//! On construction every stored record is re-published as
//! [`RegistryAction::Added`] so subscribers can rebuild in-memory state.

use crate::db::Database;
use crate::error::HubError;
use crate::notebook::{canonical_domain, Notebook, NotebookRequest, RegistryAction};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTEBOOK_PREFIX: &str = "notebook:";

/// Callback invoked for every published mutation
pub type Subscriber = Arc<dyn Fn(Notebook, RegistryAction) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`Subscriber`]
pub fn subscriber<F, Fut>(f: F) -> Subscriber
where
    F: Fn(Notebook, RegistryAction) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |nb, action| f(nb, action).boxed())
}

type Event = (Notebook, RegistryAction);

/// Per-subscriber dispatch queue
struct Dispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl Dispatcher {
    fn spawn(subscriber: Subscriber) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        tokio::spawn(async move {
            let mut queues: HashMap<String, mpsc::UnboundedSender<Event>> = HashMap::new();

            while let Some((notebook, action)) = rx.recv().await {
                let id = notebook.id.clone();
                let queue = queues
                    .entry(id.clone())
                    .or_insert_with(|| spawn_worker(Arc::clone(&subscriber)));

                if let Err(mpsc::error::SendError(event)) = queue.send((notebook, action)) {
                    // Worker died (subscriber panicked); start a fresh one
                    warn!(id = %id, "Subscriber worker gone, restarting it");
                    let fresh = spawn_worker(Arc::clone(&subscriber));
                    let _ = fresh.send(event);
                    *queue = fresh;
                }

                if action == RegistryAction::Deleted {
                    // Worker drains what it has and exits
                    queues.remove(&id);
                }
            }

            debug!("Registry dispatcher stopped");
        });

        Self { tx }
    }

    fn publish(&self, notebook: Notebook, action: RegistryAction) {
        if self.tx.send((notebook, action)).is_err() {
            warn!("Registry dispatcher closed, dropping event");
        }
    }
}

fn spawn_worker(subscriber: Subscriber) -> mpsc::UnboundedSender<Event> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        while let Some((notebook, action)) = rx.recv().await {
            subscriber(notebook, action).await;
        }
    });
    tx
}

/// Durable, event-emitting store of notebook definitions
pub struct Registry {
    db: Database,
    dispatchers: Vec<Dispatcher>,
    /// domain -> id; the stored records stay authoritative for uniqueness
    domains: DashMap<String, String>,
    /// Serializes check-then-write and keeps publish order equal to commit order
    write_lock: Mutex<()>,
}

impl Registry {
    /// Open a registry backed by the SQLite file at `path`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(path: impl AsRef<Path>, subscribers: Vec<Subscriber>) -> Result<Self, HubError> {
        let db = Database::open(path)?;
        Self::new(db, subscribers)
    }

    /// Build a registry over an open database and replay its records.
    pub fn new(db: Database, subscribers: Vec<Subscriber>) -> Result<Self, HubError> {
        let registry = Self {
            db,
            dispatchers: subscribers.into_iter().map(Dispatcher::spawn).collect(),
            domains: DashMap::new(),
            write_lock: Mutex::new(()),
        };

        registry.load_existing()?;
        Ok(registry)
    }

    fn load_existing(&self) -> Result<(), HubError> {
        let notebooks = self.load_all()?;
        info!(count = notebooks.len(), "Loaded notebooks from storage");

        for notebook in notebooks {
            self.domains.insert(canonical_domain(&notebook.domain), notebook.id.clone());
            debug!(id = %notebook.id, "Notifying subscribers for loaded notebook");
            self.publish(notebook, RegistryAction::Added);
        }
        Ok(())
    }

    /// Create a notebook. `name`, `path` and `domain` are required.
    pub fn add(&self, req: NotebookRequest) -> Result<Notebook, HubError> {
        let (Some(name), Some(path), Some(domain)) = (req.name(), req.path(), req.domain()) else {
            warn!(?req, "Missing required fields");
            return Err(HubError::Validation(
                "name, path, and domain are required for creation".to_string(),
            ));
        };

        let domain = canonical_domain(domain);

        let _guard = self.write_lock.lock();

        if self.scan_by_domain(&domain)?.is_some() {
            warn!(%domain, "Domain already in use");
            return Err(HubError::DomainConflict(domain));
        }

        let notebook = Notebook {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            path: path.to_string(),
            domain,
            show_code: req.show_code.unwrap_or(false),
            watch: req.watch.unwrap_or(false),
            created_at: Utc::now(),
        };

        self.store(&notebook)?;
        self.domains.insert(notebook.domain.clone(), notebook.id.clone());
        self.publish(notebook.clone(), RegistryAction::Added);

        info!(id = %notebook.id, domain = %notebook.domain, "Notebook added");
        Ok(notebook)
    }

    pub fn get(&self, id: &str) -> Option<Notebook> {
        match self.db.get(&key(id)) {
            Ok(Some(value)) => decode(&value),
            Ok(None) => None,
            Err(e) => {
                warn!(id, error = %e, "Failed to read notebook");
                None
            }
        }
    }

    /// Find the notebook that owns `domain`, ignoring ASCII case
    pub fn get_by_domain(&self, domain: &str) -> Option<Notebook> {
        let domain = canonical_domain(domain);
        let id = self.domains.get(&domain).map(|entry| entry.value().clone())?;

        if let Some(notebook) = self.get(&id).filter(|nb| nb.domain.eq_ignore_ascii_case(&domain)) {
            return Some(notebook);
        }

        debug!(%domain, id = %id, "Stale domain index entry, scanning storage");
        match self.scan_by_domain(&domain) {
            Ok(found) => found,
            Err(e) => {
                warn!(%domain, error = %e, "Failed to scan notebooks");
                None
            }
        }
    }

    /// All stored notebooks, ordered by storage key
    pub fn list(&self) -> Vec<Notebook> {
        self.load_all().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list notebooks");
            Vec::new()
        })
    }

    /// Apply the fields present in `req` to notebook `id`.
    ///
    /// Returns the stored record untouched, without publishing, when nothing changes.
    pub fn update(&self, id: &str, req: NotebookRequest) -> Result<Notebook, HubError> {
        let _guard = self.write_lock.lock();

        let existing = self.get(id).ok_or_else(|| {
            warn!(id, "Notebook not found");
            HubError::NotFound(id.to_string())
        })?;

        let mut updated = existing.clone();
        if let Some(name) = req.name() {
            updated.name = name.to_string();
        }
        if let Some(path) = req.path() {
            updated.path = path.to_string();
        }
        if let Some(domain) = req.domain() {
            updated.domain = canonical_domain(domain);
        }
        if let Some(show_code) = req.show_code {
            updated.show_code = show_code;
        }
        if let Some(watch) = req.watch {
            updated.watch = watch;
        }

        if updated == existing {
            debug!(id, "No changes to update");
            return Ok(existing);
        }

        let domain_changed = !updated.domain.eq_ignore_ascii_case(&existing.domain);
        if domain_changed {
            if let Some(owner) = self.scan_by_domain(&updated.domain)? {
                if owner.id != id {
                    warn!(domain = %updated.domain, "Domain already in use");
                    return Err(HubError::DomainConflict(updated.domain));
                }
            }
        }

        self.store(&updated)?;
        if domain_changed {
            self.domains.remove(&canonical_domain(&existing.domain));
            self.domains.insert(updated.domain.clone(), updated.id.clone());
        }
        self.publish(updated.clone(), RegistryAction::Updated);

        info!(id, domain = %updated.domain, "Notebook updated");
        Ok(updated)
    }

    pub fn delete(&self, id: &str) -> Result<(), HubError> {
        let _guard = self.write_lock.lock();

        let existing = self.get(id).ok_or_else(|| {
            warn!(id, "Notebook not found");
            HubError::NotFound(id.to_string())
        })?;

        if !self.db.delete(&key(id))? {
            return Err(HubError::NotFound(id.to_string()));
        }
        self.domains
            .remove_if(&canonical_domain(&existing.domain), |_, owner| owner == id);

        info!(id, domain = %existing.domain, "Notebook deleted");
        self.publish(existing, RegistryAction::Deleted);
        Ok(())
    }

    fn store(&self, notebook: &Notebook) -> Result<(), HubError> {
        let value = serde_json::to_string(notebook)
            .map_err(|e| HubError::Storage(anyhow::anyhow!("failed to encode notebook: {}", e)))?;
        self.db.put(&key(&notebook.id), &value)?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Notebook>, HubError> {
        let entries = self.db.scan_prefix(NOTEBOOK_PREFIX)?;
        Ok(entries.iter().filter_map(|(_, value)| decode(value)).collect())
    }

    /// Linear scan over stored records
    fn scan_by_domain(&self, domain: &str) -> Result<Option<Notebook>, HubError> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|nb| nb.domain.eq_ignore_ascii_case(domain)))
    }

    fn publish(&self, notebook: Notebook, action: RegistryAction) {
        for dispatcher in &self.dispatchers {
            dispatcher.publish(notebook.clone(), action);
        }
    }
}

fn key(id: &str) -> String {
    format!("{}{}", NOTEBOOK_PREFIX, id)
}

fn decode(value: &str) -> Option<Notebook> {
    match serde_json::from_str(value) {
        Ok(notebook) => Some(notebook),
        Err(e) => {
            warn!(error = %e, "Skipping undecodable notebook record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn channel_subscriber() -> (Subscriber, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = subscriber(move |nb, action| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((nb, action));
            }
        });
        (sub, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event delivered")
            .expect("channel open")
    }

    async fn assert_no_event(rx: &mut mpsc::UnboundedReceiver<Event>) {
        assert!(
            timeout(Duration::from_millis(150), rx.recv()).await.is_err(),
            "unexpected event"
        );
    }

    fn registry_with_events() -> (Registry, mpsc::UnboundedReceiver<Event>) {
        let (sub, rx) = channel_subscriber();
        let registry = Registry::new(Database::open_in_memory().unwrap(), vec![sub]).unwrap();
        (registry, rx)
    }

    #[tokio::test]
    async fn test_add_and_lookup_by_domain() {
        let (registry, mut rx) = registry_with_events();

        let a = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com"))
            .unwrap();
        let b = registry
            .add(NotebookRequest::new("b", "/nb/b.py", "b.example.com").with_watch(true))
            .unwrap();

        assert_ne!(a.id, b.id);
        assert!(b.watch);
        assert!(!b.show_code);
        assert_eq!(registry.get_by_domain("a.example.com").unwrap().id, a.id);
        assert_eq!(registry.get_by_domain("b.example.com").unwrap().id, b.id);
        assert!(registry.get_by_domain("c.example.com").is_none());
        assert_eq!(registry.get(&a.id), Some(a.clone()));
        assert_eq!(registry.list().len(), 2);

        let (nb, action) = next_event(&mut rx).await;
        assert_eq!(action, RegistryAction::Added);
        assert!(nb.id == a.id || nb.id == b.id);
    }

    #[tokio::test]
    async fn test_add_requires_fields() {
        let (registry, _rx) = registry_with_events();

        let mut req = NotebookRequest::new("a", "/nb/a.py", "a.example.com");
        req.domain = Some(String::new());

        let err = registry.add(req).unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_add_domain_conflict_persists_nothing() {
        let (registry, mut rx) = registry_with_events();

        registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com"))
            .unwrap();
        next_event(&mut rx).await;

        let err = registry
            .add(NotebookRequest::new("other", "/nb/other.py", "a.example.com"))
            .unwrap_err();
        assert!(matches!(err, HubError::DomainConflict(ref d) if d == "a.example.com"));
        assert_eq!(registry.list().len(), 1);
        assert_no_event(&mut rx).await;
    }

    #[tokio::test]
    async fn test_domains_are_case_insensitive() {
        let (registry, _rx) = registry_with_events();

        let a = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "A.Example.com"))
            .unwrap();
        assert_eq!(a.domain, "a.example.com");
        assert_eq!(registry.get_by_domain("a.example.com").unwrap().id, a.id);
        assert_eq!(registry.get_by_domain("A.EXAMPLE.COM").unwrap().id, a.id);

        let err = registry
            .add(NotebookRequest::new("b", "/nb/b.py", "a.example.com"))
            .unwrap_err();
        assert!(matches!(err, HubError::DomainConflict(_)));

        let b = registry
            .add(NotebookRequest::new("b", "/nb/b.py", "b.example.com"))
            .unwrap();
        let err = registry
            .update(&b.id, NotebookRequest::default().with_domain("a.EXAMPLE.com"))
            .unwrap_err();
        assert!(matches!(err, HubError::DomainConflict(_)));

        // Case-only change of the owner's own domain is not a change
        let same = registry
            .update(&a.id, NotebookRequest::default().with_domain("A.EXAMPLE.COM"))
            .unwrap();
        assert_eq!(same, a);
        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn test_update_without_changes_does_not_publish() {
        let (registry, mut rx) = registry_with_events();

        let nb = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com"))
            .unwrap();
        next_event(&mut rx).await;

        let same = registry
            .update(&nb.id, NotebookRequest::new("a", "/nb/a.py", "a.example.com").with_watch(false))
            .unwrap();
        assert_eq!(same, nb);

        let empty = registry.update(&nb.id, NotebookRequest::default()).unwrap();
        assert_eq!(empty, nb);

        assert_no_event(&mut rx).await;
    }

    #[tokio::test]
    async fn test_partial_update_applies_present_fields_only() {
        let (registry, mut rx) = registry_with_events();

        let nb = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com").with_show_code(true))
            .unwrap();
        next_event(&mut rx).await;

        let updated = registry
            .update(&nb.id, NotebookRequest::default().with_watch(true))
            .unwrap();
        assert!(updated.watch);
        assert!(updated.show_code);
        assert_eq!(updated.name, "a");
        assert_eq!(updated.created_at, nb.created_at);

        let (event_nb, action) = next_event(&mut rx).await;
        assert_eq!(action, RegistryAction::Updated);
        assert_eq!(event_nb, updated);
        assert_eq!(registry.get(&nb.id), Some(updated));
    }

    #[tokio::test]
    async fn test_update_domain_conflict_leaves_record() {
        let (registry, _rx) = registry_with_events();

        let a = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com"))
            .unwrap();
        registry
            .add(NotebookRequest::new("b", "/nb/b.py", "b.example.com"))
            .unwrap();

        let req = NotebookRequest {
            domain: Some("b.example.com".to_string()),
            ..Default::default()
        };
        let err = registry.update(&a.id, req).unwrap_err();
        assert!(matches!(err, HubError::DomainConflict(_)));
        assert_eq!(registry.get(&a.id), Some(a.clone()));
        assert_eq!(registry.get_by_domain("a.example.com").unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_update_moves_domain() {
        let (registry, _rx) = registry_with_events();

        let a = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com"))
            .unwrap();
        let req = NotebookRequest {
            domain: Some("z.example.com".to_string()),
            ..Default::default()
        };
        registry.update(&a.id, req).unwrap();

        assert!(registry.get_by_domain("a.example.com").is_none());
        assert_eq!(registry.get_by_domain("z.example.com").unwrap().id, a.id);

        // The old domain is free again
        registry
            .add(NotebookRequest::new("b", "/nb/b.py", "a.example.com"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_unknown_id() {
        let (registry, _rx) = registry_with_events();
        let err = registry
            .update("missing", NotebookRequest::default().with_watch(true))
            .unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let (registry, mut rx) = registry_with_events();

        assert!(matches!(
            registry.delete("missing").unwrap_err(),
            HubError::NotFound(_)
        ));

        let nb = registry
            .add(NotebookRequest::new("a", "/nb/a.py", "a.example.com"))
            .unwrap();
        next_event(&mut rx).await;

        registry.delete(&nb.id).unwrap();
        assert!(registry.get(&nb.id).is_none());
        assert!(registry.get_by_domain("a.example.com").is_none());

        let (event_nb, action) = next_event(&mut rx).await;
        assert_eq!(action, RegistryAction::Deleted);
        assert_eq!(event_nb, nb);
    }

    #[tokio::test]
    async fn test_events_for_one_id_arrive_in_commit_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = subscriber(move |nb: Notebook, _action| {
            let tx = tx.clone();
            async move {
                // Slow down early events so out-of-order delivery would show
                if nb.name == "n0" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                let _ = tx.send(nb.name);
            }
        });
        let registry = Registry::new(Database::open_in_memory().unwrap(), vec![sub]).unwrap();

        let nb = registry
            .add(NotebookRequest::new("n0", "/nb/a.py", "a.example.com"))
            .unwrap();
        for i in 1..10 {
            let req = NotebookRequest {
                name: Some(format!("n{}", i)),
                ..Default::default()
            };
            registry.update(&nb.id, req).unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap());
        }
        let expected: Vec<String> = (0..10).map(|i| format!("n{}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_reopen_replays_records_as_added() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.db");

        let ids: Vec<String> = {
            let registry = Registry::open(&path, Vec::new()).unwrap();
            (0..3)
                .map(|i| {
                    registry
                        .add(NotebookRequest::new(
                            &format!("nb{}", i),
                            &format!("/nb/{}.py", i),
                            &format!("nb{}.example.com", i),
                        ))
                        .unwrap()
                        .id
                })
                .collect()
        };

        let (sub, mut rx) = channel_subscriber();
        let registry = Registry::open(&path, vec![sub]).unwrap();

        let mut replayed = Vec::new();
        for _ in 0..3 {
            let (nb, action) = next_event(&mut rx).await;
            assert_eq!(action, RegistryAction::Added);
            replayed.push(nb.id);
        }
        replayed.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(replayed, expected);
        assert_no_event(&mut rx).await;

        // Domain index is rebuilt too
        assert!(registry.get_by_domain("nb1.example.com").is_some());
    }
}
