use crate::capabilities::{infer_specialization, specialization_from_name};
use crate::{OllamaClient, OllamaError};
use llamaterm_core::Specialization;
use llamaterm_storage::{ChatStore, StorageError};
use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteModel {
    pub name: String,
    pub size: i64,
    pub specialization: Specialization,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub models_seen: usize,
    pub models_added: usize,
    pub marked_available: usize,
    pub marked_unavailable: usize,
    pub placeholder_registered: bool,
}

pub fn apply_model_list(
    store: &ChatStore,
    remote: &[RemoteModel],
) -> Result<SyncReport, StorageError> {
    let mut report = SyncReport {
        models_seen: remote.len(),
        ..SyncReport::default()
    };

    let remote_names = remote
        .iter()
        .map(|model| model.name.as_str())
        .collect::<BTreeSet<_>>();

    for model in remote {
        match store.model_by_name(&model.name)? {
            Some(existing) if existing.currently_available => {}
            Some(existing) => {
                store.set_model_availability(existing.id, true)?;
                report.marked_available += 1;
            }
            None => {
                store.upsert_model(&model.name, model.size, model.specialization)?;
                info!(model = %model.name, specialization = %model.specialization, "model registered");
                report.models_added += 1;
            }
        }
    }

    for known in store.available_models()? {
        if !remote_names.contains(known.name.as_str()) {
            store.set_model_availability(known.id, false)?;
            report.marked_unavailable += 1;
        }
    }

    if remote.is_empty() {
        let placeholder = store.ensure_placeholder_model()?;
        if !placeholder.currently_available {
            store.set_model_availability(placeholder.id, true)?;
        }
        report.placeholder_registered = true;
    }

    Ok(report)
}

pub async fn sync_registry(
    client: &OllamaClient,
    store: &Mutex<ChatStore>,
) -> Result<SyncReport, OllamaError> {
    let tags = match client.list_models().await {
        Ok(tags) => tags,
        Err(err) => {
            let db = store.lock().map_err(|_| OllamaError::StoreLock)?;
            if db.models()?.is_empty() {
                db.ensure_placeholder_model()?;
            }
            return Err(err.into());
        }
    };

    let known = {
        let db = store.lock().map_err(|_| OllamaError::StoreLock)?;
        db.models()?
            .into_iter()
            .map(|model| model.name)
            .collect::<BTreeSet<_>>()
    };

    let mut remote = Vec::with_capacity(tags.len());
    for tag in tags {
        let specialization = if known.contains(&tag.name) {
            specialization_from_name(&tag.name).unwrap_or_default()
        } else if let Some(hinted) = specialization_from_name(&tag.name) {
            hinted
        } else {
            match client.show_model(&tag.name).await {
                Ok(info) => infer_specialization(&tag.name, &info.capabilities),
                Err(err) => {
                    warn!(model = %tag.name, error = %err, "could not read model capabilities");
                    Specialization::General
                }
            }
        };
        remote.push(RemoteModel {
            name: tag.name,
            size: tag.size,
            specialization,
        });
    }

    let db = store.lock().map_err(|_| OllamaError::StoreLock)?;
    let report = apply_model_list(&db, &remote)?;
    info!(
        seen = report.models_seen,
        added = report.models_added,
        unavailable = report.marked_unavailable,
        "model registry synced"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use llamaterm_core::PLACEHOLDER_MODEL_NAME;

    fn remote(name: &str) -> RemoteModel {
        RemoteModel {
            name: name.to_string(),
            size: 1_000,
            specialization: Specialization::General,
        }
    }

    #[test]
    fn adds_new_models_and_marks_missing_ones_unavailable() {
        let store = ChatStore::open_in_memory().expect("open store");
        store
            .upsert_model("mistral:7b", 4_000, Specialization::General)
            .expect("seed model");

        let report = apply_model_list(&store, &[remote("llama3:latest")]).expect("apply");
        assert_eq!(report.models_seen, 1);
        assert_eq!(report.models_added, 1);
        assert_eq!(report.marked_unavailable, 1);
        assert!(!report.placeholder_registered);

        let available = store
            .available_models()
            .expect("available")
            .into_iter()
            .map(|model| model.name)
            .collect::<Vec<_>>();
        assert_eq!(available, vec!["llama3:latest".to_string()]);
    }

    #[test]
    fn returning_model_is_marked_available_again() {
        let store = ChatStore::open_in_memory().expect("open store");
        let model = store
            .upsert_model("mistral:7b", 4_000, Specialization::General)
            .expect("seed model");
        store
            .set_model_availability(model.id, false)
            .expect("mark unavailable");

        let report = apply_model_list(&store, &[remote("mistral:7b")]).expect("apply");
        assert_eq!(report.marked_available, 1);
        assert_eq!(report.models_added, 0);
        assert!(store.model(model.id).expect("load").expect("exists").currently_available);
    }

    #[test]
    fn empty_server_falls_back_to_placeholder() {
        let store = ChatStore::open_in_memory().expect("open store");

        let report = apply_model_list(&store, &[]).expect("apply");
        assert!(report.placeholder_registered);
        let available = store.available_models().expect("available");
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, PLACEHOLDER_MODEL_NAME);

        let report = apply_model_list(&store, &[remote("llama3:latest")]).expect("apply");
        assert_eq!(report.marked_unavailable, 1);
        assert!(!store
            .model_by_name(PLACEHOLDER_MODEL_NAME)
            .expect("load")
            .expect("exists")
            .currently_available);
    }
}
