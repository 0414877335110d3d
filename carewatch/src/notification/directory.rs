//! Contact directory seam.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::domain::{Capability, Contact};

/// Source of the caregivers that may be notified about a subject.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Contacts of `subject_id` holding `capability`, ordered by priority.
    async fn list_eligible_contacts(
        &self,
        subject_id: &str,
        capability: Capability,
    ) -> Result<Vec<Contact>>;
}

/// Contacts of one subject, as loaded from a seed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectContacts {
    pub subject_id: String,
    pub contacts: Vec<Contact>,
}

/// Directory backed by an in-process map.
#[derive(Debug, Default)]
pub struct StaticContactDirectory {
    subjects: RwLock<HashMap<String, Vec<Contact>>>,
}

impl StaticContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = SubjectContacts>) -> Self {
        let directory = Self::new();
        for entry in entries {
            directory.set_contacts(entry.subject_id, entry.contacts);
        }
        directory
    }

    /// Replace the contacts of a subject.
    pub fn set_contacts(&self, subject_id: impl Into<String>, contacts: Vec<Contact>) {
        self.subjects.write().insert(subject_id.into(), contacts);
    }
}

#[async_trait]
impl ContactDirectory for StaticContactDirectory {
    async fn list_eligible_contacts(
        &self,
        subject_id: &str,
        capability: Capability,
    ) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self
            .subjects
            .read()
            .get(subject_id)
            .map(|list| {
                list.iter()
                    .filter(|c| c.permission_level.grants(capability))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        contacts.sort_by_key(|c| c.priority);
        Ok(contacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeliveryChannel, PermissionLevel};

    #[tokio::test]
    async fn test_filters_by_capability_and_orders_by_priority() {
        let directory = StaticContactDirectory::new();
        directory.set_contacts(
            "s1",
            vec![
                Contact::new("c3", "Observer", 0, DeliveryChannel::Push)
                    .with_permission(PermissionLevel::Observer),
                Contact::new("c2", "Nurse", 2, DeliveryChannel::Sms)
                    .with_permission(PermissionLevel::Caregiver),
                Contact::new("c1", "Daughter", 1, DeliveryChannel::Push),
            ],
        );

        let alerts = directory
            .list_eligible_contacts("s1", Capability::ReceiveAlerts)
            .await
            .unwrap();
        let ids: Vec<&str> = alerts.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);

        let emergencies = directory
            .list_eligible_contacts("s1", Capability::ReceiveEmergencyAlerts)
            .await
            .unwrap();
        assert_eq!(emergencies.len(), 1);

        assert!(
            directory
                .list_eligible_contacts("unknown", Capability::ReceiveAlerts)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
