//! Durable backing for the task store.
//!
//! Every task mutation is mirrored here so a crashed coordinator can resume
//! by reloading state instead of recomputing the plan. The completion marker
//! also lives here: it survives restarts and stays idempotent.

use crate::error::Result;
use crate::model::{Task, TaskId};
use std::path::Path;

/// Persistence seam for task records and the run completion marker.
///
/// Deliberately synchronous: writes happen inside store critical sections
/// and sled's API is synchronous anyway.
pub trait Storage: Send + Sync {
    fn put_task(&self, task: &Task) -> Result<()>;
    fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
    fn list_tasks(&self) -> Result<Vec<Task>>;
    /// Record run completion. Idempotent.
    fn set_completed(&self) -> Result<()>;
    fn is_completed(&self) -> Result<bool>;
}

/// Sled-backed storage with bincode-encoded task records.
pub struct SledStorage {
    tasks: sled::Tree,
    meta: sled::Tree,
    _db: sled::Db,
}

const COMPLETED_KEY: &[u8] = b"run_completed";

impl SledStorage {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let tasks = db.open_tree("tasks")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            tasks,
            meta,
            _db: db,
        })
    }
}

impl Storage for SledStorage {
    fn put_task(&self, task: &Task) -> Result<()> {
        let bytes = bincode::serialize(task)?;
        self.tasks.insert(task.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        match self.tasks.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for entry in self.tasks.iter() {
            let (_, bytes) = entry?;
            tasks.push(bincode::deserialize(&bytes)?);
        }
        Ok(tasks)
    }

    fn set_completed(&self) -> Result<()> {
        self.meta.insert(COMPLETED_KEY, &[1u8])?;
        self.meta.flush()?;
        Ok(())
    }

    fn is_completed(&self) -> Result<bool> {
        Ok(self.meta.get(COMPLETED_KEY)?.is_some())
    }
}
