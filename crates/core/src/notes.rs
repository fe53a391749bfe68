use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Window placement hints. Stored and returned as-is; the engine never interprets them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowGeometry {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Boolean item properties that can be toggled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemFlag {
    Completed,
    Heading,
    Important,
    AlarmDismissed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub heading: bool,
    #[serde(default)]
    pub important: bool,
    /// Long-form text attached to the item.
    #[serde(default)]
    pub attachment: Option<String>,
    #[serde(default)]
    pub due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub alarm_dismissed: bool,
    #[serde(default)]
    pub snooze_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Index of the item within its note.
    pub position: u32,
}

impl Item {
    pub fn new(text: impl Into<String>, position: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            completed: false,
            heading: false,
            important: false,
            attachment: None,
            due: None,
            alarm_dismissed: false,
            snooze_until: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            position,
        }
    }

    pub fn flag(&self, flag: ItemFlag) -> bool {
        match flag {
            ItemFlag::Completed => self.completed,
            ItemFlag::Heading => self.heading,
            ItemFlag::Important => self.important,
            ItemFlag::AlarmDismissed => self.alarm_dismissed,
        }
    }

    fn flag_mut(&mut self, flag: ItemFlag) -> &mut bool {
        match flag {
            ItemFlag::Completed => &mut self.completed,
            ItemFlag::Heading => &mut self.heading,
            ItemFlag::Important => &mut self.important,
            ItemFlag::AlarmDismissed => &mut self.alarm_dismissed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub color: String,
    #[serde(default)]
    pub items: Vec<Item>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub geometry: Option<WindowGeometry>,
    #[serde(default)]
    pub pinned: bool,
    /// Write marker of the stored record as last observed by this process.
    /// Used for conflict detection; never persisted.
    #[serde(skip)]
    pub last_write_marker: Option<DateTime<Utc>>,
}

impl Note {
    /// Creates an empty note with a fresh id.
    pub fn new(title: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            color: "yellow".to_string(),
            items: Vec::new(),
            created_at: now,
            modified_at: now,
            geometry: None,
            pinned: false,
            last_write_marker: None,
        }
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.iter().find(|item| item.id == item_id)
    }

    fn item_mut(&mut self, item_id: &str) -> Option<&mut Item> {
        self.items.iter_mut().find(|item| item.id == item_id)
    }

    /// Appends a new item and returns its id.
    pub fn add_item(&mut self, text: impl Into<String>, now: DateTime<Utc>) -> String {
        let item = Item::new(text, self.items.len() as u32, now);
        let id = item.id.clone();
        self.items.push(item);
        self.modified_at = now;
        id
    }

    /// Removes an item. Returns false if no such item exists.
    pub fn remove_item(&mut self, item_id: &str, now: DateTime<Utc>) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != item_id);
        if self.items.len() == before {
            return false;
        }
        self.renumber_items();
        self.modified_at = now;
        true
    }

    /// Moves the item at index `from` to index `to`, shifting the others.
    pub fn move_item(&mut self, from: usize, to: usize, now: DateTime<Utc>) -> bool {
        if from >= self.items.len() || to >= self.items.len() {
            return false;
        }
        if from != to {
            let item = self.items.remove(from);
            self.items.insert(to, item);
            self.renumber_items();
            self.modified_at = now;
        }
        true
    }

    pub fn set_item_text(&mut self, item_id: &str, text: impl Into<String>, now: DateTime<Utc>) -> bool {
        let Some(item) = self.item_mut(item_id) else {
            return false;
        };
        item.text = text.into();
        item.updated_at = now;
        self.modified_at = now;
        true
    }

    /// Flips a boolean property of an item and returns its new value.
    pub fn toggle_item_flag(&mut self, item_id: &str, flag: ItemFlag, now: DateTime<Utc>) -> Option<bool> {
        let item = self.item_mut(item_id)?;
        let value = item.flag_mut(flag);
        *value = !*value;
        let new_value = *value;
        item.updated_at = now;
        self.modified_at = now;
        Some(new_value)
    }

    pub fn set_title(&mut self, title: impl Into<String>, now: DateTime<Utc>) {
        self.title = title.into();
        self.modified_at = now;
    }

    pub fn set_color(&mut self, color: impl Into<String>, now: DateTime<Utc>) {
        self.color = color.into();
        self.modified_at = now;
    }

    pub fn set_pinned(&mut self, pinned: bool, now: DateTime<Utc>) {
        self.pinned = pinned;
        self.modified_at = now;
    }

    /// Geometry is a placement hint and does not bump `modified_at`.
    pub fn set_geometry(&mut self, geometry: WindowGeometry) {
        self.geometry = Some(geometry);
    }

    /// Rewrites item positions so they match their index.
    pub fn renumber_items(&mut self) {
        for (index, item) in self.items.iter_mut().enumerate() {
            item.position = index as u32;
        }
    }

    pub fn positions_are_contiguous(&self) -> bool {
        self.items
            .iter()
            .enumerate()
            .all(|(index, item)| item.position as usize == index)
    }
}
