use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use run_store::new_ticket_id;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    InProgress,
    Blocked,
    RevisionRequired,
    Completed,
    Failed,
}

impl TicketStatus {
    /// Rank in the status lattice `pending < in_progress < blocked <
    /// revision_required < completed/failed`. Completed and failed share the
    /// top rank; their join is failed.
    fn rank(&self) -> u8 {
        match self {
            TicketStatus::Pending => 0,
            TicketStatus::InProgress => 1,
            TicketStatus::Blocked => 2,
            TicketStatus::RevisionRequired => 3,
            TicketStatus::Completed | TicketStatus::Failed => 4,
        }
    }

    fn join(self, other: TicketStatus) -> TicketStatus {
        match self.rank().cmp(&other.rank()) {
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Equal => {
                if self == TicketStatus::Failed || other == TicketStatus::Failed {
                    TicketStatus::Failed
                } else {
                    self
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketLevel {
    Parent,
    Child,
    Grandchild,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: String,
    pub parent_id: Option<String>,
    pub level: TicketLevel,
    pub title: String,
    pub status: TicketStatus,
    #[serde(default)]
    pub children: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ticket Manager - three-level tree (project intent / task / subtask) with
/// bottom-up status propagation. A parent's status is the monotone least
/// upper bound of its children's statuses: it recomputes as the join over
/// children but never moves back down the lattice.
#[derive(Debug, Default)]
pub struct TicketManager {
    tickets: RwLock<HashMap<String, Ticket>>,
}

impl TicketManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_parent(&self, title: impl Into<String>) -> String {
        self.insert(None, TicketLevel::Parent, title)
            .expect("parent creation cannot fail")
    }

    pub fn create_child(&self, parent_id: &str, title: impl Into<String>) -> EngineResult<String> {
        self.require_level(parent_id, TicketLevel::Parent)?;
        self.insert(Some(parent_id.to_string()), TicketLevel::Child, title)
    }

    /// Child ticket under a caller-chosen id, so a subtask id can double as
    /// its ticket id.
    pub fn create_child_with_id(
        &self,
        parent_id: &str,
        ticket_id: &str,
        title: impl Into<String>,
    ) -> EngineResult<String> {
        self.require_level(parent_id, TicketLevel::Parent)?;
        if self.tickets.read().contains_key(ticket_id) {
            return Err(EngineError::Conflict(format!(
                "ticket {ticket_id} already exists"
            )));
        }
        self.insert_with_id(
            ticket_id.to_string(),
            Some(parent_id.to_string()),
            TicketLevel::Child,
            title,
        )
    }

    pub fn create_grandchild(
        &self,
        child_id: &str,
        title: impl Into<String>,
    ) -> EngineResult<String> {
        self.require_level(child_id, TicketLevel::Child)?;
        self.insert(Some(child_id.to_string()), TicketLevel::Grandchild, title)
    }

    pub fn get(&self, id: &str) -> Option<Ticket> {
        self.tickets.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.tickets.read().values().cloned().collect();
        tickets.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tickets
    }

    /// Sets a ticket's status and propagates joins up the tree.
    pub fn set_status(&self, id: &str, status: TicketStatus) -> EngineResult<()> {
        let mut tickets = self.tickets.write();
        let ticket = tickets
            .get_mut(id)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown ticket {id}")))?;
        ticket.status = status;
        ticket.updated_at = Utc::now();

        let mut cursor = ticket.parent_id.clone();
        while let Some(parent_id) = cursor {
            let joined = {
                let parent = tickets
                    .get(&parent_id)
                    .ok_or_else(|| EngineError::Internal(format!("orphaned parent {parent_id}")))?;
                let mut joined: Option<TicketStatus> = None;
                for child_id in &parent.children {
                    if let Some(child) = tickets.get(child_id) {
                        joined = Some(match joined {
                            None => child.status,
                            Some(acc) => acc.join(child.status),
                        });
                    }
                }
                joined
            };

            let parent = tickets
                .get_mut(&parent_id)
                .expect("parent existence checked above");
            if let Some(joined) = joined {
                // Monotone: never step back down the lattice.
                let next = parent.status.join(joined);
                if next != parent.status {
                    parent.status = next;
                    parent.updated_at = Utc::now();
                }
            }
            cursor = parent.parent_id.clone();
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.tickets.write().clear();
    }

    fn insert(
        &self,
        parent_id: Option<String>,
        level: TicketLevel,
        title: impl Into<String>,
    ) -> EngineResult<String> {
        self.insert_with_id(new_ticket_id(), parent_id, level, title)
    }

    fn insert_with_id(
        &self,
        id: String,
        parent_id: Option<String>,
        level: TicketLevel,
        title: impl Into<String>,
    ) -> EngineResult<String> {
        let now = Utc::now();
        let mut tickets = self.tickets.write();

        if let Some(parent) = parent_id.as_deref() {
            let parent = tickets
                .get_mut(parent)
                .ok_or_else(|| EngineError::InvalidArgument(format!("unknown ticket {parent}")))?;
            parent.children.push(id.clone());
        }

        tickets.insert(
            id.clone(),
            Ticket {
                id: id.clone(),
                parent_id,
                level,
                title: title.into(),
                status: TicketStatus::Pending,
                children: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    fn require_level(&self, id: &str, level: TicketLevel) -> EngineResult<()> {
        let tickets = self.tickets.read();
        let ticket = tickets
            .get(id)
            .ok_or_else(|| EngineError::InvalidArgument(format!("unknown ticket {id}")))?;
        if ticket.level != level {
            return Err(EngineError::InvalidArgument(format!(
                "ticket {id} is not a {level:?} ticket"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_levels_and_no_deeper() {
        let manager = TicketManager::new();
        let parent = manager.create_parent("login feature");
        let child = manager.create_child(&parent, "implement endpoint").unwrap();
        let grandchild = manager.create_grandchild(&child, "write handler").unwrap();

        assert!(manager.create_grandchild(&grandchild, "too deep").is_err());
        assert!(manager.create_child(&child, "wrong level").is_err());
    }

    #[test]
    fn parent_status_is_join_of_children() {
        let manager = TicketManager::new();
        let parent = manager.create_parent("feature");
        let a = manager.create_child(&parent, "a").unwrap();
        let b = manager.create_child(&parent, "b").unwrap();

        manager.set_status(&a, TicketStatus::InProgress).unwrap();
        assert_eq!(manager.get(&parent).unwrap().status, TicketStatus::InProgress);

        manager.set_status(&b, TicketStatus::RevisionRequired).unwrap();
        assert_eq!(
            manager.get(&parent).unwrap().status,
            TicketStatus::RevisionRequired
        );
    }

    #[test]
    fn propagation_reaches_grandparent() {
        let manager = TicketManager::new();
        let parent = manager.create_parent("feature");
        let child = manager.create_child(&parent, "task").unwrap();
        let leaf = manager.create_grandchild(&child, "subtask").unwrap();

        manager.set_status(&leaf, TicketStatus::Completed).unwrap();
        assert_eq!(manager.get(&child).unwrap().status, TicketStatus::Completed);
        assert_eq!(manager.get(&parent).unwrap().status, TicketStatus::Completed);
    }

    #[test]
    fn failed_dominates_completed_at_top_rank() {
        let manager = TicketManager::new();
        let parent = manager.create_parent("feature");
        let a = manager.create_child(&parent, "a").unwrap();
        let b = manager.create_child(&parent, "b").unwrap();

        manager.set_status(&a, TicketStatus::Completed).unwrap();
        manager.set_status(&b, TicketStatus::Failed).unwrap();
        assert_eq!(manager.get(&parent).unwrap().status, TicketStatus::Failed);
    }

    #[test]
    fn parent_status_is_monotone() {
        let manager = TicketManager::new();
        let parent = manager.create_parent("feature");
        let a = manager.create_child(&parent, "a").unwrap();

        manager.set_status(&a, TicketStatus::RevisionRequired).unwrap();
        assert_eq!(
            manager.get(&parent).unwrap().status,
            TicketStatus::RevisionRequired
        );

        // Child drops back to pending; the parent holds its high-water mark.
        manager.set_status(&a, TicketStatus::Pending).unwrap();
        assert_eq!(
            manager.get(&parent).unwrap().status,
            TicketStatus::RevisionRequired
        );
    }
}
