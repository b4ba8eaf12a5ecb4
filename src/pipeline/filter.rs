use std::collections::HashSet;
use std::sync::Arc;

use crate::models::Event;

/// A predicate stage of a pipeline, which may also derive a narrower event.
pub trait Filter: Send + Sync {
    /// Apply this filter to the given event.
    ///
    /// Returns whether the event was accepted, along with the event which should flow to the
    /// next stage. A rejected event is passed back untouched when there is one.
    fn apply(&self, event: Option<Arc<Event>>) -> (bool, Option<Arc<Event>>);
}

/// Accepts only events produced by one of an allow-list of devices.
pub struct DeviceIdFilter {
    devices: HashSet<String>,
}

impl DeviceIdFilter {
    pub fn new(devices: &[String]) -> Self {
        Self {
            devices: devices.iter().cloned().collect(),
        }
    }
}

impl Filter for DeviceIdFilter {
    fn apply(&self, event: Option<Arc<Event>>) -> (bool, Option<Arc<Event>>) {
        match event {
            None => (false, None),
            Some(event) => (self.devices.contains(&event.device), Some(event)),
        }
    }
}

/// Narrows events down to the readings of an allow-list of value descriptors.
///
/// Accepted events are new events; the shared input is never mutated.
pub struct ValueDescriptorFilter {
    descriptors: HashSet<String>,
}

impl ValueDescriptorFilter {
    pub fn new(descriptors: &[String]) -> Self {
        Self {
            descriptors: descriptors.iter().cloned().collect(),
        }
    }
}

impl Filter for ValueDescriptorFilter {
    fn apply(&self, event: Option<Arc<Event>>) -> (bool, Option<Arc<Event>>) {
        let event = match event {
            Some(event) => event,
            None => return (false, None),
        };
        let readings: Vec<_> = event.readings.iter().filter(|reading| self.descriptors.contains(&reading.name)).cloned().collect();
        if readings.is_empty() {
            return (false, Some(event));
        }
        let filtered = Event {
            id: event.id.clone(),
            pushed: event.pushed,
            device: event.device.clone(),
            created: event.created,
            modified: event.modified,
            origin: event.origin,
            readings,
            checksum: event.checksum.clone(),
        };
        (true, Some(Arc::new(filtered)))
    }
}

/// Build the filter chain of a registration.
///
/// The device filter always runs before the value descriptor filter.
pub fn build_filters(filter: &crate::models::Filter) -> Vec<Box<dyn Filter>> {
    let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(2);
    if !filter.device_ids.is_empty() {
        filters.push(Box::new(DeviceIdFilter::new(&filter.device_ids)));
    }
    if !filter.value_descriptor_ids.is_empty() {
        filters.push(Box::new(ValueDescriptorFilter::new(&filter.value_descriptor_ids)));
    }
    filters
}
