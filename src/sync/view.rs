use crate::models::{ChangeEvent, ChangeKind, Todo, TodoPatch, ViewSnapshot};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::watch;

/// A single column an optimistic operation touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TodoField {
    Completed(bool),
    Text(String),
    ImageUrl(Option<String>),
}

impl TodoField {
    /// Same column, value read from `todo`.
    fn current(&self, todo: &Todo) -> TodoField {
        match self {
            Self::Completed(_) => Self::Completed(todo.completed),
            Self::Text(_) => Self::Text(todo.text.clone()),
            Self::ImageUrl(_) => Self::ImageUrl(todo.image_url.clone()),
        }
    }

    fn write(self, todo: &mut Todo) {
        match self {
            Self::Completed(value) => todo.completed = value,
            Self::Text(value) => todo.text = value,
            Self::ImageUrl(value) => todo.image_url = value,
        }
    }

    pub fn to_patch(&self) -> TodoPatch {
        match self {
            Self::Completed(value) => TodoPatch::completed(*value),
            Self::Text(value) => TodoPatch::text(value.clone()),
            Self::ImageUrl(None) => TodoPatch::clear_image(),
            Self::ImageUrl(Some(url)) => TodoPatch {
                image_url: Some(Some(url.clone())),
                ..TodoPatch::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalChange {
    Set(TodoField),
    Remove,
}

/// What an optimistic change replaced, so it can be put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Field(TodoField),
    Record(Todo),
}

/// The list as the owner sees it, newest first.
#[derive(Debug)]
pub struct TodoView {
    owner_id: Option<String>,
    todos: Vec<Todo>,
    version: u64,
    epoch: u64,
    loading: bool,
    parked: VecDeque<Todo>,
    tombstones: VecDeque<String>,
    park_capacity: usize,
}

impl TodoView {
    pub fn new(park_capacity: usize) -> Self {
        Self {
            owner_id: None,
            todos: Vec::new(),
            version: 0,
            epoch: 0,
            loading: false,
            parked: VecDeque::new(),
            tombstones: VecDeque::new(),
            park_capacity: park_capacity.max(1),
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.owner_id.as_deref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn get(&self, id: &str) -> Option<&Todo> {
        self.todos.iter().find(|todo| todo.id == id)
    }

    pub fn len(&self) -> usize {
        self.todos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.todos.is_empty()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            version: self.version,
            owner_id: self.owner_id.clone(),
            loading: self.loading,
            todos: self.todos.clone(),
        }
    }

    /// Starts a fresh session for `owner_id`; in-flight reverts from the old epoch are dropped.
    pub fn activate(&mut self, owner_id: &str) {
        self.owner_id = Some(owner_id.to_string());
        self.reset();
    }

    pub fn deactivate(&mut self) {
        self.owner_id = None;
        self.loading = false;
        self.reset();
    }

    fn reset(&mut self) {
        self.todos.clear();
        self.parked.clear();
        self.tombstones.clear();
        self.epoch += 1;
        self.version += 1;
    }

    pub fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.version += 1;
        }
    }

    /// Replaces the list with a fresh read, already ordered newest first.
    pub fn replace_all(&mut self, todos: Vec<Todo>) {
        self.todos = todos;
        self.parked.clear();
        self.tombstones.clear();
        self.version += 1;
    }

    /// Merges one feed event. Returns whether the list changed.
    pub fn apply_change(&mut self, event: ChangeEvent) -> bool {
        if self.owner_id.as_deref() != Some(event.record.user_id.as_str()) {
            return false;
        }
        let changed = match event.kind {
            ChangeKind::Insert => self.apply_insert(event.record),
            ChangeKind::Update => self.apply_update(event.record),
            ChangeKind::Delete => self.apply_delete(&event.record.id),
        };
        if changed {
            self.version += 1;
        }
        changed
    }

    fn apply_insert(&mut self, mut record: Todo) -> bool {
        if self.tombstones.iter().any(|id| *id == record.id) {
            tracing::debug!(todo_id = %record.id, "insert for deleted todo ignored");
            return false;
        }
        if self.get(&record.id).is_some() {
            tracing::debug!(todo_id = %record.id, "todo already present, skipping insert");
            return false;
        }
        record = self.take_newer_parked(record);
        self.todos.insert(0, record);
        true
    }

    /// Returns the parked copy of `record` instead if it is at least as new.
    fn take_newer_parked(&mut self, record: Todo) -> Todo {
        let Some(index) = self.parked.iter().position(|parked| parked.id == record.id) else {
            return record;
        };
        match self.parked.remove(index) {
            Some(parked) if parked.updated_at >= record.updated_at => parked,
            _ => record,
        }
    }

    fn apply_update(&mut self, record: Todo) -> bool {
        let Some(index) = self.todos.iter().position(|todo| todo.id == record.id) else {
            self.park(record);
            return false;
        };
        let existing = &mut self.todos[index];
        if record.updated_at < existing.updated_at {
            tracing::debug!(todo_id = %record.id, "stale update ignored");
            return false;
        }
        if *existing == record {
            return false;
        }
        *existing = record;
        true
    }

    fn apply_delete(&mut self, id: &str) -> bool {
        let before = self.todos.len();
        self.todos.retain(|todo| todo.id != id);
        if self.todos.len() != before {
            return true;
        }
        self.parked.retain(|parked| parked.id != id);
        if !self.tombstones.iter().any(|existing| existing == id) {
            self.tombstones.push_back(id.to_string());
            while self.tombstones.len() > self.park_capacity {
                self.tombstones.pop_front();
            }
        }
        false
    }

    fn park(&mut self, record: Todo) {
        if self.tombstones.iter().any(|id| *id == record.id) {
            return;
        }
        if let Some(existing) = self.parked.iter_mut().find(|parked| parked.id == record.id) {
            if record.updated_at >= existing.updated_at {
                *existing = record;
            }
            return;
        }
        self.parked.push_back(record);
        while self.parked.len() > self.park_capacity {
            self.parked.pop_front();
        }
    }

    /// Applies a local change and returns what it replaced. `None` if `id` is not in the list.
    pub fn apply_local(&mut self, id: &str, change: &LocalChange) -> Option<Snapshot> {
        let index = self.todos.iter().position(|todo| todo.id == id)?;
        let snapshot = match change {
            LocalChange::Set(field) => {
                let todo = &mut self.todos[index];
                let previous = field.current(todo);
                field.clone().write(todo);
                Snapshot::Field(previous)
            }
            LocalChange::Remove => Snapshot::Record(self.todos.remove(index)),
        };
        self.version += 1;
        Some(snapshot)
    }

    /// Puts back what [`apply_local`](Self::apply_local) replaced. A removed record
    /// returns at the head of the list, not at its old position.
    pub fn restore(&mut self, id: &str, snapshot: Snapshot) -> bool {
        let restored = match snapshot {
            Snapshot::Field(field) => match self.todos.iter_mut().find(|todo| todo.id == id) {
                Some(todo) => {
                    field.write(todo);
                    true
                }
                None => false,
            },
            Snapshot::Record(record) => {
                let gone = self.tombstones.iter().any(|tombstone| *tombstone == record.id);
                if gone || self.get(&record.id).is_some() {
                    false
                } else {
                    let record = self.take_newer_parked(record);
                    self.todos.insert(0, record);
                    true
                }
            }
        };
        if restored {
            self.version += 1;
        }
        restored
    }
}

/// The view plus its observers. Every mutation that bumps the version is published.
pub struct ViewCell {
    view: Mutex<TodoView>,
    sender: watch::Sender<ViewSnapshot>,
}

impl ViewCell {
    pub fn new(park_capacity: usize) -> Self {
        let view = TodoView::new(park_capacity);
        let (sender, _) = watch::channel(view.snapshot());
        Self {
            view: Mutex::new(view),
            sender,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.sender.subscribe()
    }

    pub fn read<T>(&self, f: impl FnOnce(&TodoView) -> T) -> T {
        let view = self.view.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&view)
    }

    pub fn mutate<T>(&self, f: impl FnOnce(&mut TodoView) -> T) -> T {
        let mut view = self.view.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = view.version();
        let result = f(&mut view);
        if view.version() != before {
            self.sender.send_replace(view.snapshot());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{LocalChange, Snapshot, TodoField, TodoView};
    use crate::models::{ChangeEvent, Todo};
    use chrono::{Duration, Utc};

    fn todo(id: &str, owner: &str, minutes_ago: i64) -> Todo {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        Todo {
            id: id.to_string(),
            user_id: owner.to_string(),
            text: format!("task {}", id),
            completed: false,
            image_url: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn active_view() -> TodoView {
        let mut view = TodoView::new(8);
        view.activate("u1");
        view
    }

    fn ids(view: &TodoView) -> Vec<String> {
        view.snapshot().todos.into_iter().map(|todo| todo.id).collect()
    }

    #[test]
    fn duplicate_inserts_keep_a_single_entry() {
        let mut view = active_view();
        let record = todo("a", "u1", 0);
        assert!(view.apply_change(ChangeEvent::insert(record.clone())));
        assert!(!view.apply_change(ChangeEvent::insert(record)));
        assert_eq!(ids(&view), vec!["a"]);
    }

    #[test]
    fn inserts_go_to_the_head() {
        let mut view = active_view();
        view.replace_all(vec![todo("old", "u1", 10)]);
        view.apply_change(ChangeEvent::insert(todo("new", "u1", 0)));
        assert_eq!(ids(&view), vec!["new", "old"]);
    }

    #[test]
    fn updates_replace_by_id_and_ignore_stale_copies() {
        let mut view = active_view();
        let original = todo("a", "u1", 5);
        view.replace_all(vec![original.clone()]);

        let mut newer = original.clone();
        newer.completed = true;
        newer.updated_at = Utc::now();
        assert!(view.apply_change(ChangeEvent::update(newer.clone())));
        assert!(!view.apply_change(ChangeEvent::update(newer)));
        assert!(!view.apply_change(ChangeEvent::update(original)));
        assert!(view.get("a").expect("present").completed);
    }

    #[test]
    fn other_owners_events_are_ignored() {
        let mut view = active_view();
        assert!(!view.apply_change(ChangeEvent::insert(todo("x", "u2", 0))));
        assert!(view.is_empty());
    }

    #[test]
    fn update_before_insert_is_replayed_on_insert() {
        let mut view = active_view();
        let inserted = todo("a", "u1", 1);
        let mut updated = inserted.clone();
        updated.text = "edited".to_string();
        updated.updated_at = Utc::now();

        assert!(!view.apply_change(ChangeEvent::update(updated)));
        assert!(view.is_empty());
        assert!(view.apply_change(ChangeEvent::insert(inserted)));
        assert_eq!(view.get("a").expect("present").text, "edited");
    }

    #[test]
    fn delete_before_insert_suppresses_the_insert() {
        let mut view = active_view();
        let record = todo("a", "u1", 1);
        assert!(!view.apply_change(ChangeEvent::delete(record.clone())));
        assert!(!view.apply_change(ChangeEvent::insert(record)));
        assert!(view.is_empty());
    }

    #[test]
    fn field_changes_restore_only_that_field() {
        let mut view = active_view();
        view.replace_all(vec![todo("a", "u1", 1)]);

        let snapshot = view
            .apply_local("a", &LocalChange::Set(TodoField::Completed(true)))
            .expect("present");
        assert_eq!(snapshot, Snapshot::Field(TodoField::Completed(false)));
        assert!(view.get("a").expect("present").completed);

        assert!(view.restore("a", snapshot));
        assert!(!view.get("a").expect("present").completed);
    }

    #[test]
    fn removed_records_come_back_at_the_head() {
        let mut view = active_view();
        view.replace_all(vec![todo("a", "u1", 1), todo("b", "u1", 2)]);

        let snapshot = view.apply_local("b", &LocalChange::Remove).expect("present");
        assert_eq!(ids(&view), vec!["a"]);
        assert!(view.restore("b", snapshot.clone()));
        assert_eq!(ids(&view), vec!["b", "a"]);
        assert!(!view.restore("b", snapshot));
    }

    #[test]
    fn restored_record_picks_up_an_update_that_arrived_while_removed() {
        let mut view = active_view();
        view.replace_all(vec![todo("a", "u1", 5)]);

        let snapshot = view.apply_local("a", &LocalChange::Remove).expect("present");
        let mut edited = todo("a", "u1", 5);
        edited.text = "edited elsewhere".to_string();
        edited.updated_at = Utc::now();
        assert!(!view.apply_change(ChangeEvent::update(edited)));

        assert!(view.restore("a", snapshot));
        assert_eq!(view.get("a").expect("present").text, "edited elsewhere");
        assert!(view.parked.is_empty());
    }

    #[test]
    fn every_change_bumps_the_version() {
        let mut view = active_view();
        let start = view.version();
        view.apply_change(ChangeEvent::insert(todo("a", "u1", 0)));
        view.set_loading(true);
        view.set_loading(true);
        assert_eq!(view.version(), start + 2);

        let epoch = view.epoch();
        view.deactivate();
        assert_eq!(view.epoch(), epoch + 1);
        assert!(view.owner_id().is_none());
    }

    #[test]
    fn parked_updates_are_bounded() {
        let mut view = TodoView::new(2);
        view.activate("u1");
        for id in ["a", "b", "c"] {
            let mut edited = todo(id, "u1", 0);
            edited.text = "edited".to_string();
            view.apply_change(ChangeEvent::update(edited));
        }
        assert_eq!(view.parked.len(), 2);

        // "a" was evicted, so its insert lands unedited.
        assert!(view.apply_change(ChangeEvent::insert(todo("a", "u1", 1))));
        assert_eq!(view.get("a").expect("present").text, "task a");
        assert!(view.apply_change(ChangeEvent::insert(todo("c", "u1", 1))));
        assert_eq!(view.get("c").expect("present").text, "edited");
    }
}
