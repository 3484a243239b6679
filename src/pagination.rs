//! Windowed view over the location blocks of a structured result.
//!
//! The view is a pure projection of a [`ConversationEntry`]: it never mutates
//! the entry. Moving between pages goes through the session, which owns the
//! message store.

use crate::models::chat::{ ConversationEntry, GeoPoint };

pub const PAGE_SIZE: usize = 4;

/// Separates location blocks inside a structured result's text.
pub const LOCATION_DELIMITER: &str = "\n\n";

#[derive(Clone, Debug, PartialEq)]
pub struct PageItem<'a> {
    pub location: &'a str,
    /// `None` when the entry carries fewer coordinates than location blocks.
    pub coordinate: Option<GeoPoint>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PageView<'a> {
    pub cursor: usize,
    pub total_blocks: usize,
    pub items: Vec<PageItem<'a>>,
    pub has_previous: bool,
    pub has_next: bool,
}

impl<'a> PageView<'a> {
    pub fn locations(&self) -> Vec<&'a str> {
        self.items.iter().map(|item| item.location).collect()
    }

    /// Markers for the visible page; items without a coordinate are skipped.
    pub fn markers(&self) -> Vec<GeoPoint> {
        self.items.iter().filter_map(|item| item.coordinate).collect()
    }

    pub fn page_count(&self) -> usize {
        page_count(self.total_blocks)
    }

    pub fn is_paginated(&self) -> bool {
        self.total_blocks > PAGE_SIZE
    }
}

pub fn split_locations(text: &str) -> Vec<&str> {
    text.split(LOCATION_DELIMITER)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .collect()
}

pub fn page_count(total_blocks: usize) -> usize {
    total_blocks.div_ceil(PAGE_SIZE)
}

pub fn has_previous(cursor: usize) -> bool {
    cursor > 0
}

pub fn has_next(cursor: usize, total_blocks: usize) -> bool {
    cursor
        .checked_add(1)
        .and_then(|next| next.checked_mul(PAGE_SIZE))
        .is_some_and(|first_of_next| first_of_next < total_blocks)
}

/// Windows `text` and its coordinates to page `cursor`. A cursor past the last
/// page yields an empty window rather than an error.
pub fn window<'a>(text: &'a str, geo: &[GeoPoint], cursor: usize) -> PageView<'a> {
    let blocks = split_locations(text);
    let total_blocks = blocks.len();
    let start = cursor.saturating_mul(PAGE_SIZE).min(total_blocks);
    let end = start.saturating_add(PAGE_SIZE).min(total_blocks);

    let items = blocks[start..end]
        .iter()
        .copied()
        .enumerate()
        .map(|(offset, location)| PageItem {
            location,
            coordinate: geo.get(start + offset).copied(),
        })
        .collect();

    PageView {
        cursor,
        total_blocks,
        items,
        has_previous: has_previous(cursor),
        has_next: has_next(cursor, total_blocks),
    }
}

/// The current page of a structured entry, or `None` for plain text entries.
pub fn page_view(entry: &ConversationEntry) -> Option<PageView<'_>> {
    if !entry.is_structured {
        return None;
    }
    Some(window(&entry.text, &entry.geo, entry.page_cursor))
}
