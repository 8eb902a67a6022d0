//! On-disk artefact store for planner variables and encoded images.
//!
//! Layout per planner:
//!
//! ```text
//! <base>/<planner_id>/
//!   execution_plan_model.json
//!   current_task.json
//!   database.db               (per-planner SQL engine, optional)
//!   variables/<key>.blob      (JSON-serialised values)
//!   images/<key>.b64          (base64 PNG text)
//! ```
//!
//! The `(planner_id, key) → path` maps stored on the owning entity are
//! the source of truth; paths are never parsed to recover keys.

use crate::error::Result;
use crate::plan::ExecutionPlan;
use crate::schemas::CurrentTask;
use anyhow::Context as _;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const EXECUTION_PLAN_FILENAME: &str = "execution_plan_model.json";
pub const CURRENT_TASK_FILENAME: &str = "current_task.json";
pub const PLANNER_DATABASE_FILENAME: &str = "database.db";

/// What to do when a key's file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionPolicy {
    /// Replace the existing file.
    Overwrite,
    /// Append a 3-hex-char suffix until the name is free.
    Avoid,
}

/// Content store rooted at the collaterals base path. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ArtefactStore {
    base: PathBuf,
}

impl ArtefactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory for one planner's files.
    pub fn planner_dir(&self, planner_id: &str) -> PathBuf {
        self.base.join(planner_id)
    }

    /// Path of the planner's SQL engine database file.
    pub fn database_path(&self, planner_id: &str) -> PathBuf {
        self.planner_dir(planner_id).join(PLANNER_DATABASE_FILENAME)
    }

    /// Save a variable. Returns the file path and the final key (suffixed
    /// when `Avoid` hit a collision).
    pub fn save_variable(
        &self,
        planner_id: &str,
        key: &str,
        value: &Value,
        policy: CollisionPolicy,
    ) -> Result<(PathBuf, String)> {
        let dir = self.planner_dir(planner_id).join("variables");
        let (path, final_key) = resolve_slot(&dir, key, "blob", policy);

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create variables dir for planner {planner_id}"))?;
        let json = serde_json::to_vec_pretty(value).context("failed to serialise variable")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write variable {final_key}"))?;

        tracing::debug!(%planner_id, key = %final_key, "variable saved");
        Ok((path, final_key))
    }

    /// Load a variable from a previously returned path. Missing files
    /// come back as None.
    pub fn load_variable(&self, path: &Path) -> Result<Option<Value>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read variable at {}", path.display()))?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse variable at {}", path.display()))?;
        Ok(Some(value))
    }

    /// Save a base64-encoded image under a cleaned name. `existing_names`
    /// are the planner's current image keys; duplicates get a numeric
    /// suffix before the collision policy is applied to the file itself.
    pub fn save_image(
        &self,
        planner_id: &str,
        raw_name: &str,
        existing_names: &HashSet<String>,
        encoded: &str,
        policy: CollisionPolicy,
    ) -> Result<(PathBuf, String)> {
        let cleaned = clean_image_name(raw_name, existing_names);
        let dir = self.planner_dir(planner_id).join("images");
        let (path, final_key) = resolve_slot(&dir, &cleaned, "b64", policy);

        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create images dir for planner {planner_id}"))?;
        std::fs::write(&path, encoded)
            .with_context(|| format!("failed to write image {final_key}"))?;

        tracing::debug!(%planner_id, key = %final_key, "image saved");
        Ok((path, final_key))
    }

    /// Load an encoded image from a previously returned path.
    pub fn load_image(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let encoded = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read image at {}", path.display()))?;
        Ok(Some(encoded))
    }

    /// Remove everything the planner owns on disk.
    pub fn cleanup(&self, planner_id: &str) -> Result<()> {
        let dir = self.planner_dir(planner_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to clean up planner dir {}", dir.display()))?;
            tracing::info!(%planner_id, "planner artefacts cleaned up");
        }
        Ok(())
    }

    pub fn save_execution_plan(&self, planner_id: &str, plan: &ExecutionPlan) -> Result<()> {
        self.write_json(planner_id, EXECUTION_PLAN_FILENAME, plan)
    }

    pub fn load_execution_plan(&self, planner_id: &str) -> Result<Option<ExecutionPlan>> {
        self.read_json(planner_id, EXECUTION_PLAN_FILENAME)
    }

    pub fn save_current_task(&self, planner_id: &str, task: &CurrentTask) -> Result<()> {
        self.write_json(planner_id, CURRENT_TASK_FILENAME, task)
    }

    pub fn load_current_task(&self, planner_id: &str) -> Result<Option<CurrentTask>> {
        self.read_json(planner_id, CURRENT_TASK_FILENAME)
    }

    fn write_json<T: serde::Serialize>(
        &self,
        planner_id: &str,
        filename: &str,
        value: &T,
    ) -> Result<()> {
        let dir = self.planner_dir(planner_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create planner dir {}", dir.display()))?;
        let json = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to serialise {filename}"))?;
        std::fs::write(dir.join(filename), json)
            .with_context(|| format!("failed to write {filename} for planner {planner_id}"))?;
        Ok(())
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        planner_id: &str,
        filename: &str,
    ) -> Result<Option<T>> {
        let path = self.planner_dir(planner_id).join(filename);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(value))
    }
}

/// Pick a free `<dir>/<key>.<ext>` slot according to the policy.
fn resolve_slot(
    dir: &Path,
    key: &str,
    extension: &str,
    policy: CollisionPolicy,
) -> (PathBuf, String) {
    let mut final_key = key.to_string();
    let mut path = dir.join(format!("{final_key}.{extension}"));

    if policy == CollisionPolicy::Avoid {
        while path.exists() {
            final_key = format!("{key}_{}", hex_suffix());
            path = dir.join(format!("{final_key}.{extension}"));
        }
    }

    (path, final_key)
}

fn hex_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..3].to_string()
}

/// Clean an image name: alphanumerics and underscores only, collapsed and
/// trimmed underscores, `image` fallback, numeric suffix on duplicates
/// against the given existing names.
pub fn clean_image_name(raw_name: &str, existing_names: &HashSet<String>) -> String {
    let source = if raw_name.is_empty() { "image" } else { raw_name };

    let mut cleaned = String::with_capacity(source.len());
    let mut last_was_underscore = false;
    for c in source.chars() {
        if c.is_ascii_alphanumeric() {
            cleaned.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            cleaned.push('_');
            last_was_underscore = true;
        }
    }
    let cleaned = cleaned.trim_matches('_').to_string();
    let cleaned = if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    };

    if !existing_names.contains(&cleaned) {
        return cleaned;
    }
    let mut counter = 1;
    loop {
        let candidate = format!("{cleaned}_{counter}");
        if !existing_names.contains(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::InitialExecutionPlan;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, ArtefactStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtefactStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn variable_round_trips_exactly() {
        let (_guard, store) = store();

        let value = json!({"regions": ["north", "south"], "total": 4210.5});
        let (path, key) = store
            .save_variable("p1", "revenue_summary", &value, CollisionPolicy::Avoid)
            .expect("save");
        assert_eq!(key, "revenue_summary");

        let loaded = store.load_variable(&path).expect("load").expect("exists");
        assert_eq!(loaded, value);
    }

    #[test]
    fn avoid_policy_suffixes_colliding_keys() {
        let (_guard, store) = store();

        let (_, first) = store
            .save_variable("p1", "total", &json!(1), CollisionPolicy::Avoid)
            .expect("save");
        let (path, second) = store
            .save_variable("p1", "total", &json!(2), CollisionPolicy::Avoid)
            .expect("save");

        assert_eq!(first, "total");
        assert_ne!(second, "total");
        assert!(second.starts_with("total_"));
        assert_eq!(
            store.load_variable(&path).expect("load").expect("exists"),
            json!(2)
        );
    }

    #[test]
    fn overwrite_policy_replaces_in_place() {
        let (_guard, store) = store();

        let (first_path, _) = store
            .save_variable("p1", "total", &json!(1), CollisionPolicy::Overwrite)
            .expect("save");
        let (second_path, key) = store
            .save_variable("p1", "total", &json!(2), CollisionPolicy::Overwrite)
            .expect("save");

        assert_eq!(first_path, second_path);
        assert_eq!(key, "total");
        assert_eq!(
            store.load_variable(&second_path).expect("load").expect("exists"),
            json!(2)
        );
    }

    #[test]
    fn image_round_trips_and_cleans_names() {
        let (_guard, store) = store();

        let encoded = "iVBORw0KGgo=";
        let (path, key) = store
            .save_image(
                "p1",
                "Q3 sales -- chart!!",
                &HashSet::new(),
                encoded,
                CollisionPolicy::Avoid,
            )
            .expect("save");

        assert_eq!(key, "Q3_sales_chart");
        assert_eq!(
            store.load_image(&path).expect("load").expect("exists"),
            encoded
        );
    }

    #[test]
    fn clean_image_name_rules() {
        let empty = HashSet::new();
        assert_eq!(clean_image_name("", &empty), "image");
        assert_eq!(clean_image_name("___", &empty), "image");
        assert_eq!(clean_image_name("a--b__c", &empty), "a_b_c");

        let taken: HashSet<String> = ["chart".to_string(), "chart_1".to_string()].into();
        assert_eq!(clean_image_name("chart", &taken), "chart_2");
    }

    #[test]
    fn planners_get_disjoint_directories() {
        let (_guard, store) = store();

        let (path_a, _) = store
            .save_variable("planner_a", "x", &json!(1), CollisionPolicy::Avoid)
            .expect("save");
        let (path_b, _) = store
            .save_variable("planner_b", "x", &json!(1), CollisionPolicy::Avoid)
            .expect("save");

        assert_ne!(path_a, path_b);
        assert!(path_a.starts_with(store.planner_dir("planner_a")));
        assert!(path_b.starts_with(store.planner_dir("planner_b")));
    }

    #[test]
    fn cleanup_removes_the_planner_tree() {
        let (_guard, store) = store();

        store
            .save_variable("p1", "x", &json!(1), CollisionPolicy::Avoid)
            .expect("save");
        let plan = ExecutionPlan::from_initial(InitialExecutionPlan {
            objective: "o".to_string(),
            todos: vec!["t".to_string()],
        });
        store.save_execution_plan("p1", &plan).expect("save plan");
        assert!(store.planner_dir("p1").exists());

        store.cleanup("p1").expect("cleanup");
        assert!(!store.planner_dir("p1").exists());

        // Idempotent on a missing directory.
        store.cleanup("p1").expect("cleanup again");
    }

    #[test]
    fn plan_and_task_json_round_trip() {
        let (_guard, store) = store();

        let plan = ExecutionPlan::from_initial(InitialExecutionPlan {
            objective: "answer".to_string(),
            todos: vec!["a".to_string(), "b".to_string()],
        });
        store.save_execution_plan("p1", &plan).expect("save");
        let loaded = store
            .load_execution_plan("p1")
            .expect("load")
            .expect("exists");
        assert_eq!(loaded, plan);

        assert!(store.load_current_task("p1").expect("load").is_none());
    }
}
