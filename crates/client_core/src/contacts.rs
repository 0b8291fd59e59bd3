//! Contact directory and group membership.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use shared::{
    domain::{GroupId, UserId},
    protocol::{actions, type_keys, Contact, Group},
    Envelope, EnvelopeError,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    chat::payload_error,
    connection::MessageLink,
    error::{RouterError, ServiceError},
    router::MessageRouter,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ContactEvent {
    ContactListUpdated(Vec<Contact>),
    ContactRemoved(UserId),
    ContactStatusChanged { contact_id: UserId, status: String },
    GroupListUpdated(Vec<Group>),
    GroupMembersChanged { group_id: GroupId, members: Vec<UserId> },
    Error(String),
}

#[derive(Default)]
struct Directory {
    contacts: Vec<Contact>,
    groups: Vec<Group>,
}

pub struct ContactService {
    link: Arc<dyn MessageLink>,
    directory: RwLock<Directory>,
    events: broadcast::Sender<ContactEvent>,
}

type ContactHandler = fn(&ContactService, &Envelope) -> Result<(), ServiceError>;

impl ContactService {
    pub fn new(link: Arc<dyn MessageLink>) -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            link,
            directory: RwLock::new(Directory::default()),
            events,
        })
    }

    pub fn register_handlers(self: &Arc<Self>, router: &MessageRouter) -> Result<(), RouterError> {
        let routes: [(&'static str, ContactHandler); 4] = [
            (type_keys::CONTACT_LIST, Self::handle_contact_list),
            (type_keys::CONTACT_STATUS, Self::handle_status_update),
            (type_keys::GROUP_LIST, Self::handle_group_list),
            (type_keys::GROUP_UPDATE, Self::handle_group_update),
        ];
        for (type_key, handle) in routes {
            let service = Arc::downgrade(self);
            router.register_handler(type_key, move |envelope| {
                let Some(service) = service.upgrade() else {
                    return;
                };
                if let Err(err) = handle(&service, envelope) {
                    warn!(type_key, %err, "Error processing contact message");
                    let _ = service.events.send(ContactEvent::Error(err.to_string()));
                }
            })?;
        }
        Ok(())
    }

    pub fn request_contact_list(&self) -> Result<(), ServiceError> {
        self.send(Envelope::request(type_keys::CONTACT_LIST, actions::FETCH))?;
        debug!("Requesting contact list");
        Ok(())
    }

    pub fn add_contact(&self, user_id: &UserId) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::CONTACT_MANAGE, actions::ADD)
                .with("userId", user_id.as_str()),
        )
    }

    /// Asks the server to drop the contact and removes it from the local directory.
    pub fn remove_contact(&self, contact_id: &UserId) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::CONTACT_MANAGE, actions::REMOVE)
                .with("contactId", contact_id.as_str()),
        )?;
        self.directory
            .write()
            .contacts
            .retain(|contact| &contact.id != contact_id);
        let _ = self
            .events
            .send(ContactEvent::ContactRemoved(contact_id.clone()));
        Ok(())
    }

    pub fn update_remark(&self, contact_id: &UserId, remark: &str) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::CONTACT_MANAGE, actions::UPDATE_REMARK)
                .with("contactId", contact_id.as_str())
                .with("remark", remark),
        )?;
        if let Some(contact) = self
            .directory
            .write()
            .contacts
            .iter_mut()
            .find(|contact| &contact.id == contact_id)
        {
            contact.remark = remark.to_string();
        }
        Ok(())
    }

    pub fn create_group(&self, name: &str, member_ids: &[UserId]) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::GROUP_MANAGE, actions::CREATE)
                .with("name", name)
                .with("members", id_array(member_ids)),
        )
    }

    pub fn join_group(&self, group_id: &GroupId) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::GROUP_MANAGE, actions::JOIN)
                .with("groupId", group_id.as_str()),
        )
    }

    pub fn leave_group(&self, group_id: &GroupId) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::GROUP_MANAGE, actions::LEAVE)
                .with("groupId", group_id.as_str()),
        )?;
        self.directory
            .write()
            .groups
            .retain(|group| &group.id != group_id);
        Ok(())
    }

    pub fn invite_to_group(&self, group_id: &GroupId, member_ids: &[UserId]) -> Result<(), ServiceError> {
        self.send(
            Envelope::request(type_keys::GROUP_MANAGE, actions::INVITE)
                .with("groupId", group_id.as_str())
                .with("members", id_array(member_ids)),
        )
    }

    pub fn contact(&self, contact_id: &UserId) -> Option<Contact> {
        self.directory
            .read()
            .contacts
            .iter()
            .find(|contact| &contact.id == contact_id)
            .cloned()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.directory.read().contacts.clone()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.directory.read().groups.clone()
    }

    pub fn search_contacts(&self, keyword: &str) -> Vec<Contact> {
        self.directory
            .read()
            .contacts
            .iter()
            .filter(|contact| contact.matches(keyword))
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContactEvent> {
        self.events.subscribe()
    }

    fn send(&self, request: Envelope) -> Result<(), ServiceError> {
        if !self.link.is_connected() {
            let err = ServiceError::NotConnected;
            let _ = self.events.send(ContactEvent::Error(err.to_string()));
            return Err(err);
        }
        self.link.send(&request)?;
        Ok(())
    }

    fn handle_contact_list(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let contacts: Vec<Contact> = list_field(envelope, "contacts")
            .map_err(|source| payload_error(type_keys::CONTACT_LIST, source))?;
        debug!(total = contacts.len(), "Contact list updated");
        self.directory.write().contacts = contacts.clone();
        let _ = self.events.send(ContactEvent::ContactListUpdated(contacts));
        Ok(())
    }

    fn handle_status_update(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        if !(envelope.contains("contactId") && envelope.contains("status")) {
            return Ok(());
        }
        let read = |key: &'static str| {
            envelope
                .str_field(key)
                .map_err(|source| payload_error(type_keys::CONTACT_STATUS, source))
        };
        let contact_id = UserId::from(read("contactId")?);
        let status = read("status")?.to_string();

        if let Some(contact) = self
            .directory
            .write()
            .contacts
            .iter_mut()
            .find(|contact| contact.id == contact_id)
        {
            contact.status = status.clone();
        }
        let _ = self
            .events
            .send(ContactEvent::ContactStatusChanged { contact_id, status });
        Ok(())
    }

    fn handle_group_list(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        let groups: Vec<Group> = list_field(envelope, "groups")
            .map_err(|source| payload_error(type_keys::GROUP_LIST, source))?;
        debug!(total = groups.len(), "Group list updated");
        self.directory.write().groups = groups.clone();
        let _ = self.events.send(ContactEvent::GroupListUpdated(groups));
        Ok(())
    }

    fn handle_group_update(&self, envelope: &Envelope) -> Result<(), ServiceError> {
        if !(envelope.contains("groupId") && envelope.contains("members")) {
            return Ok(());
        }
        let group_id = GroupId::from(
            envelope
                .str_field("groupId")
                .map_err(|source| payload_error(type_keys::GROUP_UPDATE, source))?,
        );
        let members: Vec<UserId> = list_field(envelope, "members")
            .map_err(|source| payload_error(type_keys::GROUP_UPDATE, source))?;

        if let Some(group) = self
            .directory
            .write()
            .groups
            .iter_mut()
            .find(|group| group.id == group_id)
        {
            group.members = members.clone();
        }
        let _ = self
            .events
            .send(ContactEvent::GroupMembersChanged { group_id, members });
        Ok(())
    }
}

/// Reads an array field; absent or non-array values read as empty.
fn list_field<T>(envelope: &Envelope, key: &str) -> Result<Vec<T>, EnvelopeError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    match envelope.get(key) {
        Some(Value::Array(_)) => envelope.field_as(key),
        _ => Ok(Vec::new()),
    }
}

fn id_array(ids: &[UserId]) -> Value {
    Value::Array(ids.iter().map(|id| Value::from(id.as_str())).collect())
}

#[cfg(test)]
#[path = "tests/contacts_tests.rs"]
mod tests;
