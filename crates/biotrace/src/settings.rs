//! Runtime settings.
//!
//! A flat map of dotted-path keys (`"montage.downsample-limit"`) to values.  The engine owns no
//! durable state; this map lives in memory and every mutation is announced on the bus with the
//! dotted path as the property name.

use ahash::HashMap;

use crate::events::{PropertyBus, PropertyValue};

#[derive(Debug, Default)]
pub struct Settings {
    values: HashMap<String, PropertyValue>,
    bus: PropertyBus,
}

impl Settings {
    pub fn new() -> Settings {
        Settings::default()
    }

    pub fn bus(&mut self) -> &mut PropertyBus {
        &mut self.bus
    }

    pub fn get(&self, path: &str) -> Option<&PropertyValue> {
        self.values.get(path)
    }

    /// Set one value, emitting a change event keyed by the dotted path.
    pub fn set(&mut self, path: &str, value: impl Into<PropertyValue>) {
        let value = value.into();
        let old = self
            .values
            .insert(path.to_owned(), value.clone())
            .unwrap_or(PropertyValue::None);
        if old != value {
            self.bus.emit(path, old, value);
        }
    }

    /// Apply a batch of updates (the `update-settings` commission payload).
    pub fn update_many(&mut self, entries: impl IntoIterator<Item = (String, PropertyValue)>) {
        for (path, value) in entries {
            self.set(&path, value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn set_emits_on_change_only() {
        let mut settings = Settings::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let inner = hits.clone();
        settings.bus().subscribe(Some("viewer.scale"), None, move |_| {
            inner.fetch_add(1, Ordering::Relaxed);
        });

        settings.set("viewer.scale", 2.0);
        settings.set("viewer.scale", 2.0);
        settings.set("viewer.scale", 3.0);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn update_many_applies_all() {
        let mut settings = Settings::new();
        settings.update_many(vec![
            ("a.b".to_owned(), PropertyValue::Int(1)),
            ("c.d".to_owned(), PropertyValue::Bool(true)),
        ]);
        assert_eq!(settings.get("a.b"), Some(&PropertyValue::Int(1)));
        assert_eq!(settings.get("c.d"), Some(&PropertyValue::Bool(true)));
    }
}
