//! Property-change notification.
//!
//! Resources announce mutations as `{ property, old_value, new_value }` records on a
//! [PropertyBus].  Subscribers register against a kebab-case property name (or every property),
//! optionally under a caller id so a whole consumer can detach with one call, and may be
//! one-shot.  Fan-out is synchronous on the emitting worker; callbacks must be quick and must not
//! call back into the bus.

use smallvec::SmallVec;

use crate::unique_id::UniqueId;

/// A value carried by a property-change event.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Load progress of a streaming fill.
    Progress { loaded: u64, total: u64 },
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Float(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

/// One emitted change.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    /// Kebab-case property name, e.g. `loading-progress`.
    pub property: String,
    pub old_value: PropertyValue,
    pub new_value: PropertyValue,
}

type Callback = Box<dyn FnMut(&PropertyChange) + Send>;

struct Subscriber {
    id: UniqueId,
    /// `None` subscribes to every property.
    property: Option<String>,
    /// Lookup key for bulk removal.
    caller: Option<UniqueId>,
    once: bool,
    callback: Callback,
}

/// Fans property changes out to subscribers.
#[derive(Default)]
pub struct PropertyBus {
    subscribers: Vec<Subscriber>,
}

impl PropertyBus {
    pub fn new() -> PropertyBus {
        PropertyBus::default()
    }

    /// Subscribe to one property (`Some(name)`) or all of them (`None`).  Returns a subscription
    /// id usable with [PropertyBus::unsubscribe].
    pub fn subscribe(
        &mut self,
        property: Option<&str>,
        caller: Option<UniqueId>,
        callback: impl FnMut(&PropertyChange) + Send + 'static,
    ) -> UniqueId {
        self.push_subscriber(property, caller, false, Box::new(callback))
    }

    /// Subscribe for exactly one matching event.
    pub fn subscribe_once(
        &mut self,
        property: Option<&str>,
        caller: Option<UniqueId>,
        callback: impl FnMut(&PropertyChange) + Send + 'static,
    ) -> UniqueId {
        self.push_subscriber(property, caller, true, Box::new(callback))
    }

    fn push_subscriber(
        &mut self,
        property: Option<&str>,
        caller: Option<UniqueId>,
        once: bool,
        callback: Callback,
    ) -> UniqueId {
        let id = UniqueId::new();
        self.subscribers.push(Subscriber {
            id,
            property: property.map(str::to_owned),
            caller,
            once,
            callback,
        });
        id
    }

    /// Remove one subscription.  Unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: UniqueId) {
        self.subscribers.retain(|s| s.id != id);
    }

    /// Remove every subscription registered under `caller`.
    pub fn remove_caller(&mut self, caller: UniqueId) {
        self.subscribers.retain(|s| s.caller != Some(caller));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Emit one change, invoking matching subscribers in registration order.  One-shot
    /// subscribers that fired are removed before this returns.
    pub fn emit(
        &mut self,
        property: &str,
        old_value: impl Into<PropertyValue>,
        new_value: impl Into<PropertyValue>,
    ) {
        let change = PropertyChange {
            property: property.to_owned(),
            old_value: old_value.into(),
            new_value: new_value.into(),
        };

        let mut fired_once: SmallVec<[UniqueId; 2]> = SmallVec::new();
        for sub in self.subscribers.iter_mut() {
            let matches = match &sub.property {
                Some(p) => p == property,
                None => true,
            };
            if !matches {
                continue;
            }
            (sub.callback)(&change);
            if sub.once {
                fired_once.push(sub.id);
            }
        }

        if !fired_once.is_empty() {
            self.subscribers.retain(|s| !fired_once.contains(&s.id));
        }
    }
}

impl std::fmt::Debug for PropertyBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyBus")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
