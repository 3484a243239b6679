use crate::models::chat::{ ConversationEntry, Delivery, Sender };
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("No conversation entry at index {0}")]
    NoSuchEntry(usize),
    #[error("Entry {0} is not a structured result")]
    NotStructured(usize),
}

/// Ordered log of conversation entries. Entries are only ever appended; an
/// entry's index is its identity for the lifetime of the store.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    entries: Vec<ConversationEntry>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<ConversationEntry>) -> Self {
        let entries = entries
            .into_iter()
            .map(|mut entry| {
                entry.page_cursor = 0;
                entry
            })
            .collect();
        Self { entries }
    }

    /// Appends an entry and returns its index.
    pub fn append(&mut self, entry: ConversationEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&ConversationEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_page_cursor(&mut self, index: usize, cursor: usize) -> Result<(), StoreError> {
        let entry = self.entries.get_mut(index).ok_or(StoreError::NoSuchEntry(index))?;
        if !entry.is_structured {
            return Err(StoreError::NotStructured(index));
        }
        entry.page_cursor = cursor;
        Ok(())
    }

    pub fn set_delivery(&mut self, index: usize, delivery: Delivery) -> Result<(), StoreError> {
        let entry = self.entries.get_mut(index).ok_or(StoreError::NoSuchEntry(index))?;
        entry.delivery = delivery;
        Ok(())
    }

    pub fn set_unanswered(&mut self, index: usize, unanswered: bool) -> Result<(), StoreError> {
        let entry = self.entries.get_mut(index).ok_or(StoreError::NoSuchEntry(index))?;
        entry.unanswered = unanswered;
        Ok(())
    }
}

pub fn format_transcript(entries: &[ConversationEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut result = String::new();
    for entry in entries {
        let sender_display = match entry.sender {
            Sender::User => "You",
            Sender::Bot => "Bot",
        };
        result.push_str(&format!("{}: {}\n", sender_display, entry.text));
    }

    result
}
